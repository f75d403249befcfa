//! Page fault handling: lazy loading, swap-in, stack growth and copy-on-write.

use crate::mem::page::Page;
use crate::mem::pagedir::AddressSpace;
use crate::mem::spt::SupplementalPageTable;
use crate::mem::{Result, Vm, VmError};
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use kidneyvm_shared::mem::{
    is_user_vaddr, pg_round_down, MAX_STACK_SIZE, STACK_GROWTH_WINDOW, USER_STACK_TOP,
};
use log::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address, from CR2.
    pub addr: usize,
    /// The access came from user mode.
    pub user: bool,
    pub write: bool,
    /// No mapping was present, as opposed to a protection violation on a present one.
    pub not_present: bool,
}

impl PageFault {
    /// Decodes the error code the CPU pushes for a page fault.
    pub fn from_error_code(addr: usize, code: u32) -> Self {
        Self {
            addr,
            not_present: code & 0b001 == 0,
            write: code & 0b010 != 0,
            user: code & 0b100 != 0,
        }
    }
}

/// Whether a fault at `addr` with the user stack pointer at `esp` is a stack access.
fn is_stack_access(addr: usize, esp: usize) -> bool {
    addr < USER_STACK_TOP
        && USER_STACK_TOP - pg_round_down(addr) <= MAX_STACK_SIZE
        && addr >= esp.saturating_sub(STACK_GROWTH_WINDOW)
}

/// Resolves `fault` in the address space of `spt`.
///
/// `esp` is the user stack pointer at the time of the fault; for faults taken in kernel mode it
/// is the one saved on entry to the kernel. An error means the access was invalid and the
/// faulting process must be terminated.
pub fn handle_page_fault(
    vm: &Vm,
    spt: &mut SupplementalPageTable,
    fault: PageFault,
    esp: usize,
) -> Result<()> {
    if !is_user_vaddr(fault.addr) {
        debug!("fault on kernel address {:#x}", fault.addr);
        return Err(VmError::ProtectionViolation);
    }

    let va = pg_round_down(fault.addr);
    let Some(page) = spt.find(va) else {
        if !is_stack_access(fault.addr, esp) {
            debug!("fault on unmapped address {:#x} (esp {:#x})", fault.addr, esp);
            return Err(VmError::InvalidMapping);
        }
        debug!("growing stack to {:#x}", va);
        spt.insert(Page::new_anonymous(va, true));
        let result = claim_page(vm, spt, va);
        if result.is_err() {
            spt.remove(vm, va);
        }
        return result;
    };

    if fault.write && !page.lock().writable() {
        debug!("write to read-only page {:#x}", va);
        return Err(VmError::ProtectionViolation);
    }
    if fault.write && !fault.not_present {
        return handle_write_protect(vm, spt.space(), &page);
    }
    claim(vm, spt.space(), &page)
}

/// Makes the page containing `va` resident and mapped.
pub fn claim_page(vm: &Vm, spt: &SupplementalPageTable, va: usize) -> Result<()> {
    let page = spt.find(va).ok_or(VmError::InvalidMapping)?;
    claim(vm, spt.space(), &page)
}

fn claim(vm: &Vm, space: &Arc<dyn AddressSpace>, page_ref: &Arc<Mutex<Page>>) -> Result<()> {
    let mut page = page_ref.lock();
    if page.is_resident() {
        return Ok(());
    }

    let va = page.va();
    let frame = vm.frames().acquire(vm.swap())?;
    if let Err(err) = page.materialize(&frame, vm.swap()) {
        vm.frames().abandon(&frame);
        return Err(err);
    }
    if !space.set_mapping(va, frame.number(), page.writable()) {
        vm.frames().abandon(&frame);
        return Err(VmError::AllocationExhausted);
    }

    page.frame = Some(frame.clone());
    vm.frames().install(&frame, page_ref, space, va);
    trace!("claimed {:#x} in frame {}", va, frame.number());
    Ok(())
}

/// A write to a present, write-protected mapping of a writable page: the frame is shared
/// copy-on-write.
fn handle_write_protect(
    vm: &Vm,
    space: &Arc<dyn AddressSpace>,
    page_ref: &Arc<Mutex<Page>>,
) -> Result<()> {
    let mut page = page_ref.lock();
    let va = page.va();
    let Some(old) = page.frame().cloned() else {
        drop(page);
        return claim(vm, space, page_ref);
    };

    // The other sharers are gone; the frame is ours.
    if old.refcount() == 1 {
        if !space.set_mapping(va, old.number(), true) {
            return Err(VmError::AllocationExhausted);
        }
        trace!("frame {} no longer shared, {:#x} made writable", old.number(), va);
        return Ok(());
    }

    let new = vm.frames().acquire(vm.swap())?;
    new.data().0.copy_from_slice(&old.data().0);
    if !space.set_mapping(va, new.number(), true) {
        vm.frames().abandon(&new);
        return Err(VmError::AllocationExhausted);
    }

    vm.frames().release(&old, space, va);
    page.frame = Some(new.clone());
    vm.frames().install(&new, page_ref, space, va);
    debug!(
        "copy-on-write of {:#x}: frame {} -> {}",
        va,
        old.number(),
        new.number()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{Block, BlockDriver, BlockType};
    use crate::drivers::memory_disk::MemoryDisk;
    use crate::fs::{MemFile, VmFile};
    use crate::mem::page::{LazyDescriptor, VmType};
    use crate::mem::pagedir::PageDirectory;
    use crate::mem::swap::SECTORS_PER_PAGE;
    use crate::test::vm;
    use alloc::vec;
    use kidneyvm_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

    const ESP: usize = USER_STACK_TOP - 3 * PAGE_FRAME_SIZE + 16;

    fn read(addr: usize) -> PageFault {
        PageFault {
            addr,
            user: true,
            write: false,
            not_present: true,
        }
    }

    fn write(addr: usize, not_present: bool) -> PageFault {
        PageFault {
            addr,
            user: true,
            write: true,
            not_present,
        }
    }

    fn table() -> (Arc<PageDirectory>, SupplementalPageTable) {
        let pd = Arc::new(PageDirectory::new());
        let spt = SupplementalPageTable::new(pd.clone());
        (pd, spt)
    }

    fn byte_at(spt: &SupplementalPageTable, va: usize) -> u8 {
        let page = spt.find(va).unwrap();
        let page = page.lock();
        let byte = page.frame().unwrap().data().0[va % PAGE_FRAME_SIZE];
        byte
    }

    fn set_byte(spt: &SupplementalPageTable, va: usize, byte: u8) {
        let page = spt.find(va).unwrap();
        let page = page.lock();
        page.frame().unwrap().data().0[va % PAGE_FRAME_SIZE] = byte;
    }

    #[test]
    fn decodes_error_code() {
        assert_eq!(
            PageFault::from_error_code(0x1234, 0b111),
            PageFault {
                addr: 0x1234,
                user: true,
                write: true,
                not_present: false,
            }
        );
        assert!(PageFault::from_error_code(0, 0).not_present);
    }

    #[test]
    fn stack_grows_within_window() {
        let vm = vm(4, 2);
        let (pd, mut spt) = table();

        handle_page_fault(&vm, &mut spt, write(ESP - 32, true), ESP).unwrap();
        let va = pg_round_down(ESP - 32);
        assert!(spt.find(va).unwrap().lock().is_resident());
        assert!(pd.is_writable(va));
        assert_eq!(byte_at(&spt, ESP - 32), 0);

        let far = ESP - STACK_GROWTH_WINDOW - PAGE_FRAME_SIZE;
        assert_eq!(
            handle_page_fault(&vm, &mut spt, write(far, true), ESP),
            Err(VmError::InvalidMapping)
        );
        assert!(spt.find(far).is_none());
    }

    #[test]
    fn stack_is_bounded() {
        let vm = vm(4, 2);
        let (_, mut spt) = table();
        let esp = USER_STACK_TOP - MAX_STACK_SIZE;
        assert!(handle_page_fault(&vm, &mut spt, read(esp), esp).is_ok());
        assert_eq!(
            handle_page_fault(&vm, &mut spt, read(esp - 4), esp),
            Err(VmError::InvalidMapping)
        );
    }

    #[test]
    fn failed_stack_growth_leaves_no_page() {
        // One frame and one swap slot, both taken.
        let vm = vm(1, 1);
        let (pd, mut spt) = table();
        spt.insert(Page::new_anonymous(0x4000, true));
        spt.insert(Page::new_anonymous(0x5000, true));
        handle_page_fault(&vm, &mut spt, read(0x4000), ESP).unwrap();
        handle_page_fault(&vm, &mut spt, read(0x5000), ESP).unwrap();
        assert_eq!(vm.swap().slots_in_use(), 1);

        assert_eq!(
            handle_page_fault(&vm, &mut spt, write(ESP - 32, true), ESP),
            Err(VmError::AllocationExhausted)
        );
        let va = pg_round_down(ESP - 32);
        assert!(spt.find(va).is_none());
        assert!(pd.get_mapping(va).is_none());
        assert_eq!(spt.len(), 2);
        assert!(spt.find(0x5000).unwrap().lock().is_resident());
    }

    #[test]
    fn kernel_and_null_addresses_fault() {
        let vm = vm(1, 2);
        let (_, mut spt) = table();
        assert_eq!(
            handle_page_fault(&vm, &mut spt, read(OFFSET + 8), ESP),
            Err(VmError::ProtectionViolation)
        );
        assert_eq!(
            handle_page_fault(&vm, &mut spt, read(0), ESP),
            Err(VmError::InvalidMapping)
        );
    }

    #[test]
    fn write_to_read_only_page() {
        let vm = vm(1, 2);
        let (_, mut spt) = table();
        spt.insert(Page::new_anonymous(0x4000, false));
        assert_eq!(
            handle_page_fault(&vm, &mut spt, write(0x4000, true), ESP),
            Err(VmError::ProtectionViolation)
        );
        handle_page_fault(&vm, &mut spt, read(0x4000), ESP).unwrap();
        assert_eq!(
            handle_page_fault(&vm, &mut spt, write(0x4000, false), ESP),
            Err(VmError::ProtectionViolation)
        );
    }

    #[test]
    fn failed_claim_releases_frame() {
        let vm = vm(1, 2);
        let file = MemFile::new(vec![1; 10]);
        let (pd, mut spt) = table();
        let lazy = LazyDescriptor::from_file(file.reopen(), 0, 100, false);
        spt.insert(Page::new_uninit(0x4000, true, VmType::Anonymous, lazy));

        assert_eq!(
            handle_page_fault(&vm, &mut spt, read(0x4000), ESP),
            Err(VmError::IoFailure)
        );
        assert_eq!(vm.frames().resident_frames(), 0);
        assert!(pd.get_mapping(0x4000).is_none());
    }

    #[test]
    fn eviction_unmaps_victim() {
        let vm = vm(2, 4);
        let (pd, mut spt) = table();
        for va in [0x4000, 0x5000, 0x6000] {
            spt.insert(Page::new_anonymous(va, true));
        }
        handle_page_fault(&vm, &mut spt, read(0x4000), ESP).unwrap();
        set_byte(&spt, 0x4000, 0x44);
        handle_page_fault(&vm, &mut spt, read(0x5000), ESP).unwrap();
        assert_eq!(vm.frames().free_frames(), 0);

        handle_page_fault(&vm, &mut spt, read(0x6000), ESP).unwrap();
        assert_eq!(vm.frames().resident_frames(), 2);
        assert!(pd.get_mapping(0x4000).is_none());
        assert!(!spt.find(0x4000).unwrap().lock().is_resident());
        assert!(pd.get_mapping(0x5000).is_some());
        assert_eq!(vm.swap().slots_in_use(), 1);

        // Oldest first: 0x5000 goes next, and 0x4000 comes back intact.
        handle_page_fault(&vm, &mut spt, read(0x4000), ESP).unwrap();
        assert!(pd.get_mapping(0x5000).is_none());
        assert_eq!(byte_at(&spt, 0x4000), 0x44);
        assert_eq!(vm.swap().slots_in_use(), 1);
    }

    #[test]
    fn eviction_io_failure_is_fatal() {
        let swap = Block::new(
            BlockType::Swap,
            "swap",
            2 * SECTORS_PER_PAGE as u32,
            BlockDriver::Memory(MemoryDisk::new(2 * SECTORS_PER_PAGE as u32).read_only()),
        );
        let vm = Vm::new(1, Arc::new(swap));
        let (_, mut spt) = table();
        spt.insert(Page::new_anonymous(0x4000, true));
        spt.insert(Page::new_anonymous(0x5000, true));
        handle_page_fault(&vm, &mut spt, read(0x4000), ESP).unwrap();

        assert_eq!(
            handle_page_fault(&vm, &mut spt, read(0x5000), ESP),
            Err(VmError::IoFailure)
        );
        assert!(spt.find(0x4000).unwrap().lock().is_resident());
        assert_eq!(vm.swap().slots_in_use(), 0);
    }

    #[test]
    fn copy_on_write_after_fork() {
        let vm = vm(4, 2);
        let (a_pd, mut a) = table();
        a.insert(Page::new_anonymous(0x4000, true));
        handle_page_fault(&vm, &mut a, write(0x4000, true), ESP).unwrap();
        set_byte(&a, 0x4000, 0xaa);

        let (b_pd, mut b) = table();
        b.copy(&vm, &a).unwrap();
        let shared = a.find(0x4000).unwrap().lock().frame().unwrap().clone();
        assert_eq!(shared.refcount(), 2);
        assert_eq!(b_pd.get_mapping(0x4000), Some(shared.number()));

        handle_page_fault(&vm, &mut b, write(0x4000, false), ESP).unwrap();
        set_byte(&b, 0x4000, 0xbb);

        let private = b.find(0x4000).unwrap().lock().frame().unwrap().clone();
        assert_ne!(private.number(), shared.number());
        assert_eq!(private.refcount(), 1);
        assert_eq!(shared.refcount(), 1);
        assert!(b_pd.is_writable(0x4000));
        assert_eq!(byte_at(&a, 0x4000), 0xaa);
        assert_eq!(byte_at(&b, 0x4000), 0xbb);
        assert!(!a_pd.is_writable(0x4000));

        // A is now the only user of the original frame: no copy needed.
        handle_page_fault(&vm, &mut a, write(0x4000, false), ESP).unwrap();
        assert_eq!(a_pd.get_mapping(0x4000), Some(shared.number()));
        assert!(a_pd.is_writable(0x4000));
        assert_eq!(vm.frames().resident_frames(), 2);
    }

    #[test]
    fn shared_frames_are_not_evicted() {
        let vm = vm(1, 2);
        let (_, mut a) = table();
        a.insert(Page::new_anonymous(0x4000, true));
        a.insert(Page::new_anonymous(0x5000, true));
        handle_page_fault(&vm, &mut a, read(0x4000), ESP).unwrap();

        let (_, mut b) = table();
        b.copy(&vm, &a).unwrap();
        assert_eq!(
            handle_page_fault(&vm, &mut a, read(0x5000), ESP),
            Err(VmError::AllocationExhausted)
        );
        b.kill(&vm);
        handle_page_fault(&vm, &mut a, read(0x5000), ESP).unwrap();
    }
}
