//! Lazy loading of executables.
//!
//! Loading only records, page by page, where each segment's bytes live in the file. Nothing is
//! read until the process touches the page.

use super::elf::{Elf, ElfArchitecture, ElfEndianness, ElfProgramHeader, ElfProgramType, ElfUsage};
use crate::fs::VmFile;
use crate::mem::fault::claim_page;
use crate::mem::page::{LazyDescriptor, Page, VmType};
use crate::mem::spt::SupplementalPageTable;
use crate::mem::{Vm, VmError};
use alloc::vec;
use core::error::Error;
use core::fmt::{Display, Formatter};
use kidneyvm_shared::mem::{
    is_user_vaddr, pg_offset, pg_round_down, pg_round_up, PAGE_FRAME_SIZE, USER_STACK_TOP,
};
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The file is not a well-formed ELF32 file
    Malformed,
    UnsupportedEndianess,
    UnsupportedType,
    UnsupportedMachine,
    SegmentError(ElfSegmentError),
    Vm(VmError),
}

// Error types that will arise when we try to validate segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfSegmentError {
    DifferentPageOffset,
    OffsetOutOfRange,
    MemSizeLesserThanFileSize,
    EmptyMemSize,
    VMRegionOutOfRange,
    VMRegionWrapAround,
    PageZeroMapping,
}

impl Display for ElfError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ElfError::Malformed => write!(f, "malformed ELF file"),
            ElfError::UnsupportedEndianess => write!(f, "unsupported endianness"),
            ElfError::UnsupportedType => write!(f, "not an executable"),
            ElfError::UnsupportedMachine => write!(f, "not an x86 executable"),
            ElfError::SegmentError(err) => write!(f, "invalid segment: {:?}", err),
            ElfError::Vm(err) => write!(f, "{}", err),
        }
    }
}

impl Error for ElfError {}

impl From<VmError> for ElfError {
    fn from(err: VmError) -> Self {
        ElfError::Vm(err)
    }
}

/// Entry point and initial stack pointer of a loaded program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedProgram {
    pub entry: usize,
    pub esp: usize,
}

fn verify_elf_header(elf: &Elf) -> Result<(), ElfError> {
    if elf.header.endianness != ElfEndianness::Little {
        return Err(ElfError::UnsupportedEndianess);
    }
    if elf.header.usage != ElfUsage::Executable {
        return Err(ElfError::UnsupportedType);
    }
    if elf.header.architecture != ElfArchitecture::X86 {
        return Err(ElfError::UnsupportedMachine);
    }
    Ok(())
}

fn validate_segment(phdr: &ElfProgramHeader, file_len: u64) -> Result<(), ElfSegmentError> {
    // p_offset and p_vaddr must have the same page offset.
    if pg_offset(phdr.file_offset as usize) != pg_offset(phdr.virtual_address as usize) {
        return Err(ElfSegmentError::DifferentPageOffset);
    }

    // The file bytes of the segment must lie within the file.
    if phdr.file_offset as u64 + phdr.file_size as u64 > file_len {
        return Err(ElfSegmentError::OffsetOutOfRange);
    }

    // p_memsz must be at least as big as p_filesz.
    if phdr.memory_size < phdr.file_size {
        return Err(ElfSegmentError::MemSizeLesserThanFileSize);
    }

    // The segment must not be empty.
    if phdr.memory_size == 0 {
        return Err(ElfSegmentError::EmptyMemSize);
    }

    // The virtual memory region must both start and end within the
    // user address space range.
    if !is_user_vaddr(phdr.virtual_address as usize) {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // The region cannot "wrap around" across the kernel virtual
    // address space.
    let end = phdr
        .virtual_address
        .checked_add(phdr.memory_size)
        .ok_or(ElfSegmentError::VMRegionWrapAround)?;
    if !is_user_vaddr(end as usize - 1) {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // Disallow mapping page 0.
    if (phdr.virtual_address as usize) < PAGE_FRAME_SIZE {
        return Err(ElfSegmentError::PageZeroMapping);
    }

    Ok(())
}

/// Adds lazy pages for a segment starting at `offset` in `file`, mapped at `upage`.
///
/// The first `read_bytes` bytes come from the file and the following `zero_bytes` are zeroed.
/// Their sum must be a whole number of pages.
pub fn load_segment(
    spt: &mut SupplementalPageTable,
    file: &dyn VmFile,
    mut offset: u64,
    mut upage: usize,
    mut read_bytes: usize,
    mut zero_bytes: usize,
    writable: bool,
) -> Result<(), VmError> {
    assert_eq!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE, 0);
    assert_eq!(pg_offset(upage), 0);

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
        let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

        let lazy = if page_read_bytes == 0 {
            LazyDescriptor::zeroed()
        } else {
            LazyDescriptor::from_file(file.reopen(), offset, page_read_bytes, false)
        };
        if !spt.insert(Page::new_uninit(upage, writable, VmType::Anonymous, lazy)) {
            warn!("segment page {:#x} overlaps another segment", upage);
            return Err(VmError::InvalidMapping);
        }

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PAGE_FRAME_SIZE;
        offset += page_read_bytes as u64;
    }
    Ok(())
}

/// Creates the first stack page just below [`USER_STACK_TOP`] and returns the initial stack
/// pointer.
pub fn setup_stack(vm: &Vm, spt: &mut SupplementalPageTable) -> Result<usize, VmError> {
    let stack_bottom = USER_STACK_TOP - PAGE_FRAME_SIZE;
    if !spt.insert(Page::new_anonymous(stack_bottom, true)) {
        return Err(VmError::InvalidMapping);
    }
    claim_page(vm, spt, stack_bottom)?;
    Ok(USER_STACK_TOP)
}

/// Loads the executable in `file` into the address space of `spt`.
///
/// On failure the table may hold some of the program's pages; the caller tears it down.
pub fn load_executable(
    vm: &Vm,
    spt: &mut SupplementalPageTable,
    file: &mut dyn VmFile,
) -> Result<LoadedProgram, ElfError> {
    let mut bytes = vec![0; file.length() as usize];
    if file.read_at(&mut bytes, 0) != bytes.len() {
        return Err(ElfError::Vm(VmError::IoFailure));
    }

    let elf = Elf::parse_bytes(&bytes).map_err(|_| ElfError::Malformed)?;
    verify_elf_header(&elf)?;

    for phdr in &elf.program_headers {
        if phdr.program_type != ElfProgramType::Load {
            continue;
        }
        validate_segment(phdr, file.length()).map_err(ElfError::SegmentError)?;

        let file_page = pg_round_down(phdr.file_offset as usize) as u64;
        let mem_page = pg_round_down(phdr.virtual_address as usize);
        let page_offset = pg_offset(phdr.virtual_address as usize);
        let end = pg_round_up(page_offset + phdr.memory_size as usize);
        let (read_bytes, zero_bytes) = if phdr.file_size > 0 {
            // Normal segment: read the initial part from disk and zero the rest.
            let read_bytes = page_offset + phdr.file_size as usize;
            (read_bytes, end - read_bytes)
        } else {
            // Entirely zero: don't read anything from disk.
            (0, end)
        };

        load_segment(
            spt,
            file,
            file_page,
            mem_page,
            read_bytes,
            zero_bytes,
            phdr.writable,
        )?;
        debug!(
            "segment at {:#x}: {} bytes from file, {} zeroed",
            mem_page, read_bytes, zero_bytes
        );
    }

    let esp = setup_stack(vm, spt)?;
    Ok(LoadedProgram {
        entry: elf.header.program_entry as usize,
        esp,
    })
}
