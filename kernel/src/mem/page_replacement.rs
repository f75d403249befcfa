use crate::mem::frame_table::FrameNumber;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Decides the order in which resident frames are offered for eviction.
///
/// The frame table tells the policy when frames become resident and when they are freed; the
/// policy never evicts on its own.
pub trait PageReplacementPolicy {
    /// `frame` just became resident.
    fn insert(&mut self, frame: FrameNumber);

    /// `frame` was evicted or freed.
    fn remove(&mut self, frame: FrameNumber);

    /// Resident frames, best victim first.
    fn candidates(&self) -> Vec<FrameNumber>;
}

/// Evicts the frame that became resident longest ago.
#[derive(Default)]
pub struct Fifo {
    queue: VecDeque<FrameNumber>,
}

impl PageReplacementPolicy for Fifo {
    fn insert(&mut self, frame: FrameNumber) {
        self.queue.push_back(frame);
    }

    fn remove(&mut self, frame: FrameNumber) {
        self.queue.retain(|&f| f != frame);
    }

    fn candidates(&self) -> Vec<FrameNumber> {
        self.queue.iter().copied().collect()
    }
}
