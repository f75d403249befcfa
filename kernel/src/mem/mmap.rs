//! Memory-mapped files.
//!
//! A mapping is a run of lazy file-backed pages, each holding its own handle to the file. Every
//! page but the last is marked as chaining into the next, which is how [`unmap`] finds the end of
//! the mapping.

use crate::fs::VmFile;
use crate::mem::page::{LazyDescriptor, Page, VmType};
use crate::mem::spt::SupplementalPageTable;
use crate::mem::{Result, Vm, VmError};
use kidneyvm_shared::mem::{pg_offset, pg_round_down, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// Maps `length` bytes of `file`, starting at `offset`, at `addr`. Returns `addr`.
///
/// Bytes of the last page past the end of the file read as zero and are never written back.
/// Nothing is mapped unless the whole request is valid.
pub fn map(
    spt: &mut SupplementalPageTable,
    addr: usize,
    length: usize,
    writable: bool,
    file: &dyn VmFile,
    offset: u64,
) -> Result<usize> {
    if addr == 0 || pg_offset(addr) != 0 || offset % PAGE_FRAME_SIZE as u64 != 0 || length == 0 {
        warn!(
            "mmap rejected: addr {:#x}, length {}, offset {}",
            addr, length, offset
        );
        return Err(VmError::InvalidMapping);
    }
    let file_len = file.length();
    if file_len == 0 {
        warn!("mmap rejected: empty file");
        return Err(VmError::InvalidMapping);
    }
    let end = match length
        .checked_add(PAGE_FRAME_SIZE - 1)
        .map(pg_round_down)
        .and_then(|len| addr.checked_add(len))
    {
        Some(end) if end <= OFFSET => end,
        _ => {
            warn!("mmap rejected: {:#x}+{} reaches kernel space", addr, length);
            return Err(VmError::InvalidMapping);
        }
    };
    if !spt.range_is_free(addr, end) {
        warn!("mmap rejected: {:#x}..{:#x} overlaps existing pages", addr, end);
        return Err(VmError::InvalidMapping);
    }

    if offset.checked_add((end - addr) as u64).is_none() {
        warn!("mmap rejected: offset {} + {} overflows", offset, length);
        return Err(VmError::InvalidMapping);
    }

    let pages = (end - addr) / PAGE_FRAME_SIZE;
    for i in 0..pages {
        let page_offset = offset + (i * PAGE_FRAME_SIZE) as u64;
        let read_bytes = file_len
            .saturating_sub(page_offset)
            .min(PAGE_FRAME_SIZE as u64) as usize;
        let lazy = LazyDescriptor::from_file(file.reopen(), page_offset, read_bytes, i + 1 < pages);
        let va = addr + i * PAGE_FRAME_SIZE;
        let inserted = spt.insert(Page::new_uninit(va, writable, VmType::File, lazy));
        assert!(inserted, "page {:#x} appeared during mmap", va);
    }

    debug!("mapped {} pages at {:#x}", pages, addr);
    Ok(addr)
}

/// Removes the mapping starting at `addr`, writing dirty pages back to the file.
pub fn unmap(vm: &Vm, spt: &mut SupplementalPageTable, addr: usize) -> Result<()> {
    let mut va = addr;
    let mut removed = 0;
    loop {
        let Some(page) = spt.find(va) else {
            break;
        };
        let (file_backed, chained) = {
            let page = page.lock();
            (page.is_file_backed(), page.lazy().chained)
        };
        if !file_backed {
            break;
        }
        spt.remove(vm, va);
        removed += 1;
        if !chained {
            break;
        }
        va += PAGE_FRAME_SIZE;
    }

    if removed == 0 {
        warn!("munmap of {:#x}: no mapping there", addr);
        return Err(VmError::InvalidMapping);
    }
    debug!("unmapped {} pages at {:#x}", removed, addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;
    use crate::mem::fault::claim_page;
    use crate::mem::page::PageKind;
    use crate::mem::pagedir::{AddressSpace, PageDirectory};
    use crate::test::{patterned, vm};
    use alloc::sync::Arc;
    use alloc::vec;

    const ADDR: usize = 0x1000_0000;

    fn table() -> (Arc<PageDirectory>, SupplementalPageTable) {
        let pd = Arc::new(PageDirectory::new());
        let spt = SupplementalPageTable::new(pd.clone());
        (pd, spt)
    }

    #[test]
    fn maps_chained_pages() {
        let file = MemFile::new(patterned(PAGE_FRAME_SIZE * 5 / 2));
        let (_, mut spt) = table();
        assert_eq!(
            map(&mut spt, ADDR, 3 * PAGE_FRAME_SIZE, true, &file, 0),
            Ok(ADDR)
        );
        assert_eq!(spt.len(), 3);
        assert_eq!(file.handles(), 4);

        let expected = [
            (PAGE_FRAME_SIZE, 0, true),
            (PAGE_FRAME_SIZE, 0, true),
            (PAGE_FRAME_SIZE / 2, PAGE_FRAME_SIZE / 2, false),
        ];
        for (i, (read, zero, chained)) in expected.into_iter().enumerate() {
            let page = spt.find(ADDR + i * PAGE_FRAME_SIZE).unwrap();
            let page = page.lock();
            assert!(page.is_file_backed());
            assert!(!page.is_resident());
            let lazy = page.lazy();
            assert_eq!(lazy.offset, (i * PAGE_FRAME_SIZE) as u64);
            assert_eq!((lazy.read_bytes, lazy.zero_bytes, lazy.chained), (read, zero, chained));
        }
    }

    #[test]
    fn rejects_invalid_requests() {
        let file = MemFile::new(vec![1; 100]);
        let empty = MemFile::new(vec![]);
        let (_, mut spt) = table();
        let invalid = Err(VmError::InvalidMapping);

        assert_eq!(map(&mut spt, 0, PAGE_FRAME_SIZE, true, &file, 0), invalid);
        assert_eq!(map(&mut spt, ADDR + 1, PAGE_FRAME_SIZE, true, &file, 0), invalid);
        assert_eq!(map(&mut spt, ADDR, PAGE_FRAME_SIZE, true, &file, 10), invalid);
        assert_eq!(map(&mut spt, ADDR, 0, true, &file, 0), invalid);
        assert_eq!(map(&mut spt, ADDR, PAGE_FRAME_SIZE, true, &empty, 0), invalid);
        assert_eq!(
            map(&mut spt, OFFSET - PAGE_FRAME_SIZE, 2 * PAGE_FRAME_SIZE, true, &file, 0),
            invalid
        );

        assert_eq!(map(&mut spt, ADDR, usize::MAX - 10, true, &file, 0), invalid);
        assert_eq!(
            map(&mut spt, ADDR, 2 * PAGE_FRAME_SIZE, true, &file, u64::MAX - 0xfff),
            invalid
        );

        spt.insert(Page::new_anonymous(ADDR + PAGE_FRAME_SIZE, true));
        assert_eq!(map(&mut spt, ADDR, 2 * PAGE_FRAME_SIZE, true, &file, 0), invalid);
        assert_eq!(spt.len(), 1);
        assert_eq!(file.handles(), 1);
    }

    #[test]
    fn offset_past_end_of_file_reads_zeroes() {
        let vm = vm(2, 2);
        let file = MemFile::new(patterned(PAGE_FRAME_SIZE));
        let (_, mut spt) = table();
        map(&mut spt, ADDR, 2 * PAGE_FRAME_SIZE, false, &file, PAGE_FRAME_SIZE as u64).unwrap();

        claim_page(&vm, &spt, ADDR).unwrap();
        let page = spt.find(ADDR).unwrap();
        let page = page.lock();
        assert_eq!(page.lazy().read_bytes, 0);
        assert!(page.frame().unwrap().data().0.iter().all(|&b| b == 0));
    }

    #[test]
    fn unmap_writes_back_dirty_pages() {
        let vm = vm(4, 2);
        let file = MemFile::new(vec![0; PAGE_FRAME_SIZE * 5 / 2]);
        let (pd, mut spt) = table();
        map(&mut spt, ADDR, 3 * PAGE_FRAME_SIZE, true, &file, 0).unwrap();
        spt.insert(Page::new_anonymous(ADDR + 3 * PAGE_FRAME_SIZE, true));

        for i in [0, 2] {
            let va = ADDR + i * PAGE_FRAME_SIZE;
            claim_page(&vm, &spt, va).unwrap();
            spt.find(va)
                .unwrap()
                .lock()
                .frame()
                .unwrap()
                .data()
                .0
                .fill(i as u8 + 1);
            pd.set_dirty(va, true);
        }
        assert!(matches!(
            spt.find(ADDR).unwrap().lock().kind(),
            PageKind::FileBacked(_)
        ));

        unmap(&vm, &mut spt, ADDR).unwrap();
        assert_eq!(spt.len(), 1);
        assert!(spt.find(ADDR + 3 * PAGE_FRAME_SIZE).is_some());
        assert!(pd.get_mapping(ADDR).is_none());
        assert_eq!(vm.frames().resident_frames(), 0);
        assert_eq!(file.handles(), 1);

        let contents = file.contents();
        assert_eq!(contents.len(), PAGE_FRAME_SIZE * 5 / 2);
        assert!(contents[..PAGE_FRAME_SIZE].iter().all(|&b| b == 1));
        assert!(contents[PAGE_FRAME_SIZE..2 * PAGE_FRAME_SIZE].iter().all(|&b| b == 0));
        assert!(contents[2 * PAGE_FRAME_SIZE..].iter().all(|&b| b == 3));

        assert_eq!(unmap(&vm, &mut spt, ADDR), Err(VmError::InvalidMapping));
        assert_eq!(
            unmap(&vm, &mut spt, ADDR + 3 * PAGE_FRAME_SIZE),
            Err(VmError::InvalidMapping)
        );
    }

    #[test]
    fn evicted_file_pages_are_reread() {
        let vm = vm(1, 2);
        let file = MemFile::new(patterned(2 * PAGE_FRAME_SIZE));
        let (pd, mut spt) = table();
        map(&mut spt, ADDR, 2 * PAGE_FRAME_SIZE, true, &file, 0).unwrap();

        claim_page(&vm, &spt, ADDR).unwrap();
        spt.find(ADDR).unwrap().lock().frame().unwrap().data().0[0] = 0xfe;
        pd.set_dirty(ADDR, true);

        claim_page(&vm, &spt, ADDR + PAGE_FRAME_SIZE).unwrap();
        assert_eq!(vm.swap().slots_in_use(), 0);
        assert_eq!(file.contents()[0], 0xfe);
        assert!(matches!(
            spt.find(ADDR).unwrap().lock().kind(),
            PageKind::FileBacked(f) if f.is_evicted()
        ));

        claim_page(&vm, &spt, ADDR).unwrap();
        assert_eq!(spt.find(ADDR).unwrap().lock().frame().unwrap().data().0[0], 0xfe);
        assert!(!pd.is_dirty(ADDR));
    }
}
