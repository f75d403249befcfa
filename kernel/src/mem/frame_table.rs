//! The global table of physical frames.
//!
//! Every physical frame is preallocated at startup. The core map records which frames are in use
//! and which are pinned (being filled in and not yet mapped). Allocation, victim selection and
//! eviction all run under the single table lock.

use crate::mem::page::Page;
use crate::mem::page_replacement::PageReplacementPolicy;
use crate::mem::pagedir::AddressSpace;
use crate::mem::swap::SwapSpace;
use crate::mem::{Result, VmError};
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use bitbybit::bitfield;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyvm_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, trace};
use zerocopy::FromZeroes;

pub type FrameNumber = usize;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
}

/// The contents of one physical frame.
#[derive(FromZeroes)]
#[repr(C)]
pub struct FrameData(pub [u8; PAGE_FRAME_SIZE]);

pub struct Frame {
    number: FrameNumber,
    /// Number of pages sharing this frame; more than one only while copy-on-write shared.
    refcount: AtomicUsize,
    data: Mutex<Box<FrameData>>,
}

impl Frame {
    fn new(number: FrameNumber) -> Self {
        Self {
            number,
            refcount: AtomicUsize::new(0),
            data: Mutex::new(FrameData::new_box_zeroed()),
        }
    }

    pub fn number(&self) -> FrameNumber {
        self.number
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn data(&self) -> MutexGuard<Box<FrameData>> {
        self.data.lock()
    }
}

/// A page mapped to a frame, and where it is mapped.
struct Owner {
    page: Weak<Mutex<Page>>,
    space: Arc<dyn AddressSpace>,
    va: usize,
}

fn same_space(a: &Arc<dyn AddressSpace>, b: &Arc<dyn AddressSpace>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct FrameTableInner {
    core_map: Box<[CoreMapEntry]>,
    owners: Box<[Vec<Owner>]>,
    policy: Box<dyn PageReplacementPolicy + Send>,
    /// Where the next-fit search for a free frame starts.
    position: usize,
}

impl FrameTableInner {
    /// Finds a free frame, next-fit.
    fn place(&mut self) -> Option<FrameNumber> {
        let total = self.core_map.len();
        let frame = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&n| !self.core_map[n].allocated())?;
        self.position = (frame + 1) % total;
        Some(frame)
    }

    fn free(&mut self, frame: FrameNumber) {
        self.core_map[frame] = CoreMapEntry::DEFAULT;
        self.owners[frame].clear();
        self.policy.remove(frame);
    }
}

pub struct FrameTable {
    frames: Box<[Arc<Frame>]>,
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    pub fn new(num_frames: usize, policy: Box<dyn PageReplacementPolicy + Send>) -> Self {
        Self {
            frames: (0..num_frames).map(|n| Arc::new(Frame::new(n))).collect(),
            inner: Mutex::new(FrameTableInner {
                core_map: (0..num_frames).map(|_| CoreMapEntry::DEFAULT).collect(),
                owners: (0..num_frames).map(|_| Vec::new()).collect(),
                policy,
                position: 0,
            }),
        }
    }

    pub fn frame(&self, number: FrameNumber) -> Option<Arc<Frame>> {
        self.frames.get(number).cloned()
    }

    pub fn resident_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.core_map.iter().filter(|e| e.allocated()).count()
    }

    pub fn free_frames(&self) -> usize {
        self.frames.len() - self.resident_frames()
    }

    /// Returns a zero-filled frame with a reference count of one, evicting a resident page if no
    /// frame is free.
    ///
    /// The frame stays pinned, and so cannot be evicted, until it is [`install`](Self::install)ed
    /// or [`abandon`](Self::abandon)ed.
    pub fn acquire(&self, swap: &SwapSpace) -> Result<Arc<Frame>> {
        let mut inner = self.inner.lock();
        let number = match inner.place() {
            Some(number) => number,
            None => self.evict(&mut inner, swap)?,
        };

        inner.core_map[number] = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_pinned(true);
        inner.policy.insert(number);

        let frame = &self.frames[number];
        frame.refcount.store(1, Ordering::Release);
        frame.data().0.fill(0);
        trace!("acquired frame {}", number);
        Ok(frame.clone())
    }

    /// Picks a victim in policy order and pushes its page out to backing store.
    ///
    /// Pinned and shared frames are passed over, as are frames whose page is locked by another
    /// thread.
    fn evict(&self, inner: &mut FrameTableInner, swap: &SwapSpace) -> Result<FrameNumber> {
        for number in inner.policy.candidates() {
            let entry = inner.core_map[number];
            let frame = &self.frames[number];
            if !entry.allocated() || entry.pinned() || frame.refcount() != 1 {
                continue;
            }
            let (owner, space, va) = match inner.owners[number].as_slice() {
                [owner] => (owner.page.clone(), owner.space.clone(), owner.va),
                _ => continue,
            };
            let Some(owner) = owner.upgrade() else {
                continue;
            };
            let Some(mut page) = owner.try_lock() else {
                continue;
            };

            page.swap_out(frame, space.as_ref(), swap)?;
            space.clear_mapping(va);
            page.frame = None;
            drop(page);

            frame.refcount.store(0, Ordering::Release);
            inner.free(number);
            debug!("evicted frame {} mapped at {:#x}", number, va);
            return Ok(number);
        }

        Err(VmError::AllocationExhausted)
    }

    /// Records that `page` is mapped to `frame` at `va` in `space`, and unpins the frame.
    pub fn install(
        &self,
        frame: &Arc<Frame>,
        page: &Arc<Mutex<Page>>,
        space: &Arc<dyn AddressSpace>,
        va: usize,
    ) {
        let mut inner = self.inner.lock();
        inner.owners[frame.number].push(Owner {
            page: Arc::downgrade(page),
            space: space.clone(),
            va,
        });
        inner.core_map[frame.number] = inner.core_map[frame.number].with_pinned(false);
    }

    /// Shares `frame`, mapped at `va` in `parent`, with `child` at the same address.
    ///
    /// Both mappings become read-only and the reference count goes up by one.
    pub fn share(
        &self,
        frame: &Arc<Frame>,
        parent: &Arc<dyn AddressSpace>,
        child_page: &Arc<Mutex<Page>>,
        child: &Arc<dyn AddressSpace>,
        va: usize,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        map_shared(parent, child, va, frame.number)?;

        frame.refcount.fetch_add(1, Ordering::AcqRel);
        inner.owners[frame.number].push(Owner {
            page: Arc::downgrade(child_page),
            space: child.clone(),
            va,
        });
        trace!("frame {} shared, refcount {}", frame.number, frame.refcount());
        Ok(())
    }

    /// Replicates a raw mapping of `number` at `va` in `parent`, one the frame table does not
    /// track, into `child`. Both end up read-only.
    pub fn share_raw(
        &self,
        number: FrameNumber,
        parent: &Arc<dyn AddressSpace>,
        child: &Arc<dyn AddressSpace>,
        va: usize,
    ) -> Result<()> {
        let _inner = self.inner.lock();
        map_shared(parent, child, va, number)?;
        trace!("raw mapping of frame {} at {:#x} shared", number, va);
        Ok(())
    }

    /// Drops the page mapped at `va` in `space` from `frame`. The frame is freed when its last
    /// page goes.
    pub fn release(&self, frame: &Arc<Frame>, space: &Arc<dyn AddressSpace>, va: usize) {
        let mut inner = self.inner.lock();
        inner.owners[frame.number].retain(|o| !(o.va == va && same_space(&o.space, space)));
        self.put(&mut inner, frame);
    }

    /// Gives back a frame from [`acquire`](Self::acquire) that was never installed.
    pub fn abandon(&self, frame: &Arc<Frame>) {
        let mut inner = self.inner.lock();
        self.put(&mut inner, frame);
    }

    fn put(&self, inner: &mut FrameTableInner, frame: &Arc<Frame>) {
        if frame.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.free(frame.number);
            trace!("freed frame {}", frame.number);
        }
    }
}

/// Maps `number` read-only at `va` in both spaces. Called with the frame table locked.
fn map_shared(
    parent: &Arc<dyn AddressSpace>,
    child: &Arc<dyn AddressSpace>,
    va: usize,
    number: FrameNumber,
) -> Result<()> {
    if !child.set_mapping(va, number, false) {
        return Err(VmError::AllocationExhausted);
    }
    if !parent.set_mapping(va, number, false) {
        child.clear_mapping(va);
        return Err(VmError::AllocationExhausted);
    }
    Ok(())
}
