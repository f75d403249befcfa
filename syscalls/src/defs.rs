// syscall constants shared by the kernel and the userspace libc.

pub const ENOENT: isize = 2;
pub const EIO: isize = 5;
pub const EBADF: isize = 9;
pub const ENOMEM: isize = 12;
pub const EACCES: isize = 13;
pub const EFAULT: isize = 14;
pub const EEXIST: isize = 17;
pub const ENODEV: isize = 19;
pub const EINVAL: isize = 22;
pub const ENOSYS: isize = 38;

pub const SYS_EXIT: usize = 0x1;
pub const SYS_FORK: usize = 0x2;
pub const SYS_MMAP: usize = 0x5a;
pub const SYS_MUNMAP: usize = 0x5b;

/// Value returned by `mmap` when the mapping could not be created.
pub const MAP_FAILED: usize = usize::MAX;

pub const PROT_READ: usize = 0x1;
pub const PROT_WRITE: usize = 0x2;
