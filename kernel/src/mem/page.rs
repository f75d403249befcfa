//! Virtual pages and their backing stores.
//!
//! A page starts out [`PageKind::Uninit`], carrying a [`LazyDescriptor`] that says how to fill it.
//! The first claim turns it into the anonymous or file-backed page it was always meant to be.
//! From then on it moves between memory and its backing store: anonymous pages go to swap,
//! file-backed pages go back to their file.

use crate::fs::VmFile;
use crate::mem::frame_table::{Frame, FrameData};
use crate::mem::pagedir::AddressSpace;
use crate::mem::swap::{SlotIndex, SwapSpace};
use crate::mem::{Result, Vm, VmError};
use alloc::{boxed::Box, sync::Arc};
use kidneyvm_shared::mem::PAGE_FRAME_SIZE;
use log::warn;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmType {
    Anonymous,
    File,
}

/// Where a page's initial contents come from.
///
/// `read_bytes` bytes are read from `file` at `offset` and the remaining `zero_bytes` are zeroed.
/// Without a file the whole page is zero-filled. Cloning reopens the file, so each page owns a
/// private handle.
pub struct LazyDescriptor {
    pub file: Option<Box<dyn VmFile>>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Whether the mapping this page belongs to continues into the next page.
    pub chained: bool,
}

impl LazyDescriptor {
    pub fn zeroed() -> Self {
        Self {
            file: None,
            offset: 0,
            read_bytes: 0,
            zero_bytes: PAGE_FRAME_SIZE,
            chained: false,
        }
    }

    pub fn from_file(file: Box<dyn VmFile>, offset: u64, read_bytes: usize, chained: bool) -> Self {
        assert!(read_bytes <= PAGE_FRAME_SIZE);
        Self {
            file: Some(file),
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
            chained,
        }
    }

    /// Fills `data` with the page's initial contents.
    fn load(&mut self, data: &mut FrameData) -> Result<()> {
        let read_bytes = match self.file.as_mut() {
            Some(file) => {
                let n = file.read_at(&mut data.0[..self.read_bytes], self.offset);
                if n != self.read_bytes {
                    warn!(
                        "short read at offset {}: {} of {} bytes",
                        self.offset, n, self.read_bytes
                    );
                    return Err(VmError::IoFailure);
                }
                n
            }
            None => 0,
        };
        data.0[read_bytes..].fill(0);
        Ok(())
    }
}

impl Clone for LazyDescriptor {
    fn clone(&self) -> Self {
        Self {
            file: self.file.as_ref().map(|file| file.reopen()),
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
            chained: self.chained,
        }
    }
}

/// A page with no file behind it once loaded: stack, heap and executable data pages.
pub struct AnonPage {
    lazy: LazyDescriptor,
    slot: Option<SlotIndex>,
}

impl AnonPage {
    /// Swap slot holding the page while it is not resident.
    pub fn slot(&self) -> Option<SlotIndex> {
        self.slot
    }

    fn swap_in(&mut self, data: &mut FrameData, swap: &SwapSpace) -> Result<()> {
        if let Some(slot) = self.slot {
            swap.swap_in(slot, data)?;
            self.slot = None;
        }
        Ok(())
    }

    fn swap_out(&mut self, data: &FrameData, swap: &SwapSpace) -> Result<()> {
        self.slot = Some(swap.swap_out(data)?);
        Ok(())
    }
}

/// A page of a memory-mapped file.
pub struct FilePage {
    lazy: LazyDescriptor,
    evicted: bool,
}

impl FilePage {
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    fn swap_in(&mut self, data: &mut FrameData) -> Result<()> {
        self.lazy.load(data)?;
        self.evicted = false;
        Ok(())
    }

    /// Writes the page back to its file if the mapping at `va` is dirty.
    fn write_back(&mut self, data: &FrameData, space: &dyn AddressSpace, va: usize) -> Result<()> {
        if !space.is_dirty(va) {
            return Ok(());
        }
        let Some(file) = self.lazy.file.as_mut() else {
            return Err(VmError::IoFailure);
        };
        let n = file.write_at(&data.0[..self.lazy.read_bytes], self.lazy.offset);
        if n != self.lazy.read_bytes {
            warn!(
                "short write back at offset {}: {} of {} bytes",
                self.lazy.offset, n, self.lazy.read_bytes
            );
            return Err(VmError::IoFailure);
        }
        space.set_dirty(va, false);
        Ok(())
    }

    fn swap_out(&mut self, data: &FrameData, space: &dyn AddressSpace, va: usize) -> Result<()> {
        self.write_back(data, space, va)?;
        self.evicted = true;
        Ok(())
    }
}

pub enum PageKind {
    Uninit {
        target: VmType,
        lazy: LazyDescriptor,
    },
    Anonymous(AnonPage),
    FileBacked(FilePage),
}

pub struct Page {
    va: usize,
    writable: bool,
    pub(crate) frame: Option<Arc<Frame>>,
    kind: PageKind,
}

impl Page {
    /// A page that becomes `target` when first claimed, filled as `lazy` describes.
    pub fn new_uninit(va: usize, writable: bool, target: VmType, lazy: LazyDescriptor) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind: PageKind::Uninit { target, lazy },
        }
    }

    /// A zero-filled anonymous page.
    pub fn new_anonymous(va: usize, writable: bool) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind: PageKind::Anonymous(AnonPage {
                lazy: LazyDescriptor::zeroed(),
                slot: None,
            }),
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<&Arc<Frame>> {
        self.frame.as_ref()
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn lazy(&self) -> &LazyDescriptor {
        match &self.kind {
            PageKind::Uninit { lazy, .. } => lazy,
            PageKind::Anonymous(anon) => &anon.lazy,
            PageKind::FileBacked(file) => &file.lazy,
        }
    }

    /// Whether this is, or will become, a page of a mapped file.
    pub fn is_file_backed(&self) -> bool {
        matches!(
            self.kind,
            PageKind::FileBacked(_)
                | PageKind::Uninit {
                    target: VmType::File,
                    ..
                }
        )
    }

    /// Fills `frame` with this page's contents: the lazy load on first claim, the backing store
    /// afterwards.
    pub fn materialize(&mut self, frame: &Frame, swap: &SwapSpace) -> Result<()> {
        let mut data = frame.data();
        match &mut self.kind {
            PageKind::Uninit { target, lazy } => {
                lazy.load(&mut data)?;
                let target = *target;
                let lazy = core::mem::replace(lazy, LazyDescriptor::zeroed());
                self.kind = match target {
                    VmType::Anonymous => PageKind::Anonymous(AnonPage { lazy, slot: None }),
                    VmType::File => PageKind::FileBacked(FilePage {
                        lazy,
                        evicted: false,
                    }),
                };
                Ok(())
            }
            PageKind::Anonymous(anon) => anon.swap_in(&mut data, swap),
            PageKind::FileBacked(file) => file.swap_in(&mut data),
        }
    }

    /// Saves the contents of `frame` to the backing store. The caller unmaps the page and takes
    /// the frame away afterwards.
    pub fn swap_out(&mut self, frame: &Frame, space: &dyn AddressSpace, swap: &SwapSpace) -> Result<()> {
        let data = frame.data();
        match &mut self.kind {
            PageKind::Anonymous(anon) => anon.swap_out(&data, swap),
            PageKind::FileBacked(file) => file.swap_out(&data, space, self.va),
            PageKind::Uninit { .. } => Err(VmError::InvalidMapping),
        }
    }

    /// Releases everything the page holds: dirty contents are flushed to the file, the swap slot
    /// and file handle are given back, and the frame is unmapped and released.
    ///
    /// Calling this on a page that holds nothing does nothing.
    pub fn destroy(&mut self, vm: &Vm, space: &Arc<dyn AddressSpace>) {
        match &mut self.kind {
            PageKind::FileBacked(file) => {
                if let Some(frame) = &self.frame {
                    if let Err(err) = file.write_back(&frame.data(), space.as_ref(), self.va) {
                        warn!("lost write back of page {:#x}: {}", self.va, err);
                    }
                }
                file.lazy.file = None;
            }
            PageKind::Anonymous(anon) => {
                if let Some(slot) = anon.slot.take() {
                    vm.swap().free(slot);
                }
                anon.lazy.file = None;
            }
            PageKind::Uninit { lazy, .. } => lazy.file = None,
        }

        space.clear_mapping(self.va);
        if let Some(frame) = self.frame.take() {
            vm.frames().release(&frame, space, self.va);
        }
    }

    /// A non-resident copy of this page for a forked address space.
    ///
    /// The copy gets its own file handle and, if this page is in swap, its own swap slot.
    pub fn duplicate(&self, swap: &SwapSpace) -> Result<Page> {
        let kind = match &self.kind {
            PageKind::Uninit { target, lazy } => PageKind::Uninit {
                target: *target,
                lazy: lazy.clone(),
            },
            PageKind::Anonymous(anon) => PageKind::Anonymous(AnonPage {
                lazy: anon.lazy.clone(),
                slot: anon.slot.map(|slot| swap.duplicate(slot)).transpose()?,
            }),
            PageKind::FileBacked(file) => PageKind::FileBacked(FilePage {
                lazy: file.lazy.clone(),
                evicted: file.evicted,
            }),
        };
        Ok(Page {
            va: self.va,
            writable: self.writable,
            frame: None,
            kind,
        })
    }
}
