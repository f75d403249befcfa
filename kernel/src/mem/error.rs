use crate::block::block_error::BlockError;
use core::error::Error;
use core::fmt::{Debug, Display, Formatter};
use kidneyvm_syscalls::{EFAULT, EINVAL, EIO, ENOMEM};

/// Error type for virtual memory operations
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free frame could be found or made by eviction, or swap is full
    AllocationExhausted,
    /// A read or write of backing storage was short or failed
    IoFailure,
    /// The address or range does not name a valid mapping
    InvalidMapping,
    /// The access is not permitted on the page
    ProtectionViolation,
}

impl VmError {
    /// Errno reported to user space for this error.
    pub fn errno(self) -> isize {
        match self {
            VmError::AllocationExhausted => ENOMEM,
            VmError::IoFailure => EIO,
            VmError::InvalidMapping => EINVAL,
            VmError::ProtectionViolation => EFAULT,
        }
    }
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::AllocationExhausted => write!(f, "AllocationExhausted"),
            VmError::IoFailure => write!(f, "IoFailure"),
            VmError::InvalidMapping => write!(f, "InvalidMapping"),
            VmError::ProtectionViolation => write!(f, "ProtectionViolation"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let description = match self {
            VmError::AllocationExhausted => "out of frames or swap slots",
            VmError::IoFailure => "backing store I/O failed",
            VmError::InvalidMapping => "invalid mapping",
            VmError::ProtectionViolation => "protection violation",
        };
        f.write_str(description)
    }
}

impl Error for VmError {}

impl From<BlockError> for VmError {
    fn from(_: BlockError) -> Self {
        VmError::IoFailure
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
