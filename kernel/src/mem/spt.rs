use crate::mem::page::Page;
use crate::mem::pagedir::AddressSpace;
use crate::mem::{Result, Vm};
use crate::sync::mutex::Mutex;
use alloc::{collections::BTreeMap, sync::Arc};
use kidneyvm_shared::mem::pg_round_down;
use log::{debug, trace};

/// The pages of one address space, keyed by page address.
pub struct SupplementalPageTable {
    space: Arc<dyn AddressSpace>,
    pages: BTreeMap<usize, Arc<Mutex<Page>>>,
}

impl SupplementalPageTable {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self {
            space,
            pages: BTreeMap::new(),
        }
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The page containing `va`.
    pub fn find(&self, va: usize) -> Option<Arc<Mutex<Page>>> {
        self.pages.get(&pg_round_down(va)).cloned()
    }

    /// Adds `page`. Returns `false`, leaving the table unchanged, if its address is taken.
    pub fn insert(&mut self, page: Page) -> bool {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, Arc::new(Mutex::new(page)));
        true
    }

    fn link(&mut self, va: usize, page: Arc<Mutex<Page>>) {
        let previous = self.pages.insert(va, page);
        assert!(previous.is_none(), "duplicate page at {:#x}", va);
    }

    /// Whether no page lies in `[start, end)`.
    pub fn range_is_free(&self, start: usize, end: usize) -> bool {
        self.pages.range(start..end).next().is_none()
    }

    /// Unlinks and destroys the page at `va`. Returns whether there was one.
    pub fn remove(&mut self, vm: &Vm, va: usize) -> bool {
        match self.pages.remove(&pg_round_down(va)) {
            Some(page) => {
                page.lock().destroy(vm, &self.space);
                true
            }
            None => false,
        }
    }

    /// Fills this (empty) table with the pages of `src`, for fork.
    ///
    /// Resident frames are not copied: both address spaces map them read-only and the frame's
    /// reference count goes up, so the first write to either side takes a private copy. On
    /// failure the caller must [`kill`](Self::kill) this table.
    pub fn copy(&mut self, vm: &Vm, src: &SupplementalPageTable) -> Result<()> {
        for (&va, page) in &src.pages {
            let page = page.lock();
            let child = Arc::new(Mutex::new(page.duplicate(vm.swap())?));

            match page.frame() {
                Some(frame) => {
                    vm.frames()
                        .share(frame, &src.space, &child, &self.space, va)?;
                    child.lock().frame = Some(frame.clone());
                }
                None => {
                    if let Some(frame) = src.space.get_mapping(va) {
                        vm.frames()
                            .share_raw(frame, &src.space, &self.space, va)?;
                    }
                }
            }
            trace!("copied page {:#x}", va);
            self.link(va, child);
        }
        debug!("copied {} pages", src.pages.len());
        Ok(())
    }

    /// Destroys every page, flushing dirty file-backed pages.
    pub fn kill(&mut self, vm: &Vm) {
        for page in core::mem::take(&mut self.pages).into_values() {
            page.lock().destroy(vm, &self.space);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemFile, VmFile};
    use crate::mem::fault::claim_page;
    use crate::mem::page::{LazyDescriptor, PageKind, VmType};
    use crate::mem::pagedir::PageDirectory;
    use crate::test::{patterned, vm};
    use alloc::vec;

    fn table() -> (Arc<PageDirectory>, SupplementalPageTable) {
        let pd = Arc::new(PageDirectory::new());
        let spt = SupplementalPageTable::new(pd.clone());
        (pd, spt)
    }

    #[test]
    fn find_and_duplicate_insert() {
        let (_, mut spt) = table();
        assert!(spt.insert(Page::new_anonymous(0x4000, true)));
        assert!(!spt.insert(Page::new_anonymous(0x4000, false)));

        let page = spt.find(0x4abc).unwrap();
        assert!(page.lock().writable());
        assert!(spt.find(0x5000).is_none());
        assert!(!spt.range_is_free(0x3000, 0x5000));
        assert!(spt.range_is_free(0x5000, 0x8000));
    }

    #[test]
    fn remove_releases_frame() {
        let vm = vm(2, 2);
        let (pd, mut spt) = table();
        spt.insert(Page::new_anonymous(0x4000, true));
        claim_page(&vm, &spt, 0x4000).unwrap();
        assert_eq!(vm.frames().resident_frames(), 1);
        assert!(pd.get_mapping(0x4000).is_some());

        assert!(spt.remove(&vm, 0x4000));
        assert!(!spt.remove(&vm, 0x4000));
        assert!(spt.find(0x4000).is_none());
        assert!(pd.get_mapping(0x4000).is_none());
        assert_eq!(vm.frames().resident_frames(), 0);
    }

    #[test]
    fn copy_shares_resident_frames() {
        let vm = vm(4, 2);
        let (parent_pd, mut parent) = table();
        parent.insert(Page::new_anonymous(0x4000, true));
        claim_page(&vm, &parent, 0x4000).unwrap();

        let (child_pd, mut child) = table();
        child.copy(&vm, &parent).unwrap();

        let frame = parent.find(0x4000).unwrap().lock().frame().unwrap().clone();
        assert_eq!(frame.refcount(), 2);
        assert_eq!(child_pd.get_mapping(0x4000), Some(frame.number()));
        assert!(!parent_pd.is_writable(0x4000));
        assert!(!child_pd.is_writable(0x4000));
        assert_eq!(vm.frames().resident_frames(), 1);

        child.kill(&vm);
        assert_eq!(frame.refcount(), 1);
        assert!(child.is_empty());
        parent.kill(&vm);
        assert_eq!(frame.refcount(), 0);
        assert_eq!(vm.frames().resident_frames(), 0);
    }

    #[test]
    fn copy_replicates_raw_mappings() {
        let vm = vm(2, 2);
        let (parent_pd, mut parent) = table();
        parent.insert(Page::new_anonymous(0x4000, true));
        assert!(parent_pd.set_mapping(0x4000, 5, true));

        let (child_pd, mut child) = table();
        child.copy(&vm, &parent).unwrap();
        assert_eq!(child_pd.get_mapping(0x4000), Some(5));
        assert!(!child_pd.is_writable(0x4000));
        assert!(!parent_pd.is_writable(0x4000));
        assert_eq!(vm.frames().resident_frames(), 0);
    }

    #[test]
    fn copy_reopens_lazy_files() {
        let vm = vm(1, 2);
        let file = MemFile::new(patterned(100));
        let (_, mut parent) = table();
        let lazy = LazyDescriptor::from_file(file.reopen(), 0, 100, false);
        parent.insert(Page::new_uninit(0x4000, false, VmType::Anonymous, lazy));

        let (_, mut child) = table();
        child.copy(&vm, &parent).unwrap();
        assert_eq!(file.handles(), 3);

        claim_page(&vm, &child, 0x4000).unwrap();
        let page = child.find(0x4000).unwrap();
        let page = page.lock();
        assert!(matches!(page.kind(), PageKind::Anonymous(_)));
        assert_eq!(&page.frame().unwrap().data().0[..100], patterned(100).as_slice());
        drop(page);

        child.kill(&vm);
        parent.kill(&vm);
        assert_eq!(file.handles(), 1);
    }

    #[test]
    fn copy_duplicates_swapped_out_pages() {
        let vm = vm(1, 4);
        let (_, mut parent) = table();
        parent.insert(Page::new_anonymous(0x4000, true));
        parent.insert(Page::new_anonymous(0x5000, true));
        claim_page(&vm, &parent, 0x4000).unwrap();
        parent
            .find(0x4000)
            .unwrap()
            .lock()
            .frame()
            .unwrap()
            .data()
            .0
            .fill(0x11);
        // Only one frame: claiming the second page evicts the first.
        claim_page(&vm, &parent, 0x5000).unwrap();
        assert!(!parent.find(0x4000).unwrap().lock().is_resident());
        assert_eq!(vm.swap().slots_in_use(), 1);

        let (_, mut child) = table();
        child.copy(&vm, &parent).unwrap();
        assert_eq!(vm.swap().slots_in_use(), 2);

        parent.kill(&vm);
        assert_eq!(vm.swap().slots_in_use(), 1);
        claim_page(&vm, &child, 0x4000).unwrap();
        let page = child.find(0x4000).unwrap();
        assert!(page.lock().frame().unwrap().data().0.iter().all(|&b| b == 0x11));
        child.kill(&vm);
        assert_eq!(vm.swap().slots_in_use(), 0);
    }

    #[test]
    fn kill_flushes_dirty_file_pages() {
        let vm = vm(2, 2);
        let file = MemFile::new(vec![0; 10]);
        let (pd, mut spt) = table();
        let lazy = LazyDescriptor::from_file(file.reopen(), 0, 10, false);
        spt.insert(Page::new_uninit(0x4000, true, VmType::File, lazy));
        claim_page(&vm, &spt, 0x4000).unwrap();

        spt.find(0x4000)
            .unwrap()
            .lock()
            .frame()
            .unwrap()
            .data()
            .0
            .fill(0xee);
        pd.set_dirty(0x4000, true);

        spt.kill(&vm);
        assert_eq!(file.contents(), vec![0xee; 10]);
        assert_eq!(file.handles(), 1);
    }
}
