use crate::mem::frame_table::FrameNumber;
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use arbitrary_int::u20;
use kidneyvm_shared::mem::{is_user_vaddr, pg_round_down};
use kidneyvm_shared::paging::PageTableEntry;

/// The hardware mapping of one address space.
///
/// Addresses are rounded down to their page.
pub trait AddressSpace: Send + Sync {
    /// Frame mapped at `va`, if any.
    fn get_mapping(&self, va: usize) -> Option<FrameNumber>;

    /// Maps `va` to `frame`. Returns `false` if the mapping could not be installed.
    fn set_mapping(&self, va: usize, frame: FrameNumber, writable: bool) -> bool;

    fn clear_mapping(&self, va: usize);

    fn is_writable(&self, va: usize) -> bool;

    fn is_dirty(&self, va: usize) -> bool;

    fn set_dirty(&self, va: usize, dirty: bool);

    fn set_accessed(&self, _va: usize, _accessed: bool) {}
}

/// A software page directory holding one x86 [`PageTableEntry`] per mapped user page.
#[derive(Default)]
pub struct PageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, va: usize) -> Option<PageTableEntry> {
        self.entries.lock().get(&pg_round_down(va)).copied()
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.entry(va).is_some_and(|e| e.accessed())
    }

    /// Number of installed mappings.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, va: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.lock().get_mut(&pg_round_down(va)) {
            *entry = f(*entry);
        }
    }
}

/// Whether `frame` fits the 20-bit frame field of a page table entry.
fn fits_entry(frame: FrameNumber) -> bool {
    u32::try_from(frame).is_ok_and(|frame| u20::try_new(frame).is_ok())
}

impl AddressSpace for PageDirectory {
    fn get_mapping(&self, va: usize) -> Option<FrameNumber> {
        self.entry(va).map(|e| e.frame())
    }

    fn set_mapping(&self, va: usize, frame: FrameNumber, writable: bool) -> bool {
        if !is_user_vaddr(va) || !fits_entry(frame) {
            return false;
        }

        let mut entries = self.entries.lock();
        let entry = PageTableEntry::user(frame, writable);
        // Remapping the same frame (e.g. write-protecting it) keeps its dirty bit.
        let entry = match entries.get(&pg_round_down(va)) {
            Some(old) if old.frame() == frame => entry.with_dirty(old.dirty()),
            _ => entry,
        };
        entries.insert(pg_round_down(va), entry);
        true
    }

    fn clear_mapping(&self, va: usize) {
        self.entries.lock().remove(&pg_round_down(va));
    }

    fn is_writable(&self, va: usize) -> bool {
        self.entry(va).is_some_and(|e| e.read_write())
    }

    fn is_dirty(&self, va: usize) -> bool {
        self.entry(va).is_some_and(|e| e.dirty())
    }

    fn set_dirty(&self, va: usize, dirty: bool) {
        self.update(va, |e| e.with_dirty(dirty));
    }

    fn set_accessed(&self, va: usize, accessed: bool) {
        self.update(va, |e| e.with_accessed(accessed));
    }
}
