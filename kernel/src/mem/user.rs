use crate::mem::fault::{handle_page_fault, PageFault};
use crate::mem::spt::SupplementalPageTable;
use crate::mem::{Result, Vm, VmError};
use crate::sync::mutex::Mutex;
use alloc::{vec, vec::Vec};
use kidneyvm_shared::mem::{pg_offset, pg_round_down, OFFSET, PAGE_FRAME_SIZE};

fn check_range(start: usize, count: usize) -> Result<()> {
    match start.checked_add(count) {
        // Trying to touch kernel memory.
        Some(end) if end <= OFFSET => Ok(()),
        _ => Err(VmError::ProtectionViolation),
    }
}

/// Runs `f` on the bytes of the resident user page containing `addr`, faulting it in the way the
/// MMU would on access. Sets the accessed bit, and the dirty bit for writes.
fn with_user_page<R>(
    vm: &Vm,
    spt: &Mutex<SupplementalPageTable>,
    esp: usize,
    addr: usize,
    write: bool,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Result<R> {
    let mut spt = spt.lock();
    let va = pg_round_down(addr);
    loop {
        let space = spt.space().clone();
        let present = space.get_mapping(va).is_some();
        if !present || (write && !space.is_writable(va)) {
            let fault = PageFault {
                addr,
                user: false,
                write,
                not_present: !present,
            };
            handle_page_fault(vm, &mut spt, fault, esp)?;
        }

        let page = spt.find(va).ok_or(VmError::InvalidMapping)?;
        let page = page.lock();
        // Evicted again before we got the page lock.
        let Some(frame) = page.frame() else {
            continue;
        };
        space.set_accessed(va, true);
        if write {
            space.set_dirty(va, true);
        }
        let mut data = frame.data();
        return Ok(f(&mut data.0[..]));
    }
}

/// Copies `buf.len()` bytes of user memory starting at `src` into `buf`.
pub fn copy_from_user(
    vm: &Vm,
    spt: &Mutex<SupplementalPageTable>,
    esp: usize,
    src: usize,
    buf: &mut [u8],
) -> Result<()> {
    check_range(src, buf.len())?;
    let mut done = 0;
    while done < buf.len() {
        let addr = src + done;
        let offset = pg_offset(addr);
        let n = (PAGE_FRAME_SIZE - offset).min(buf.len() - done);
        let chunk = &mut buf[done..done + n];
        with_user_page(vm, spt, esp, addr, false, |page| {
            chunk.copy_from_slice(&page[offset..offset + n])
        })?;
        done += n;
    }
    Ok(())
}

/// Copies `buf` into user memory starting at `dst`.
pub fn copy_to_user(
    vm: &Vm,
    spt: &Mutex<SupplementalPageTable>,
    esp: usize,
    dst: usize,
    buf: &[u8],
) -> Result<()> {
    check_range(dst, buf.len())?;
    let mut done = 0;
    while done < buf.len() {
        let addr = dst + done;
        let offset = pg_offset(addr);
        let n = (PAGE_FRAME_SIZE - offset).min(buf.len() - done);
        let chunk = &buf[done..done + n];
        with_user_page(vm, spt, esp, addr, true, |page| {
            page[offset..offset + n].copy_from_slice(chunk)
        })?;
        done += n;
    }
    Ok(())
}

/// Copies `count` bytes of user memory at `pointer` into a kernel buffer.
///
/// We sometimes want to transfer information from one thread to another. To avoid having to map
/// this memory across address spaces, we copy it to kernel memory first.
pub fn check_and_copy_user_memory(
    vm: &Vm,
    spt: &Mutex<SupplementalPageTable>,
    esp: usize,
    pointer: usize,
    count: usize,
) -> Result<Vec<u8>> {
    let mut bytes = vec![0; count];
    copy_from_user(vm, spt, esp, pointer, &mut bytes)?;
    Ok(bytes)
}
