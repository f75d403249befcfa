//! Demand-paged virtual memory.
//!
//! [`Vm`] owns the machine-wide resources: the frame table and the swap space. Each address
//! space has a [`SupplementalPageTable`](spt::SupplementalPageTable) describing its pages, which
//! are brought in on page faults and pushed out again under memory pressure.

mod error;
pub mod fault;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod page_replacement;
pub mod pagedir;
pub mod spt;
pub mod swap;
pub mod user;

pub use error::{Result, VmError};

use crate::block::block_core::{Block, BlockManager, BlockType};
use alloc::{boxed::Box, sync::Arc};
use frame_table::FrameTable;
use log::info;
use page_replacement::{Fifo, PageReplacementPolicy};
use swap::SwapSpace;

pub struct Vm {
    frames: FrameTable,
    swap: SwapSpace,
}

impl Vm {
    /// A VM with `num_frames` physical frames, swapping to `swap`, evicting oldest first.
    pub fn new(num_frames: usize, swap: Arc<Block>) -> Self {
        Self::with_policy(num_frames, swap, Box::new(Fifo::default()))
    }

    pub fn with_policy(
        num_frames: usize,
        swap: Arc<Block>,
        policy: Box<dyn PageReplacementPolicy + Send>,
    ) -> Self {
        let swap = SwapSpace::new(swap);
        info!(
            "VM: {} frames, {} swap slots",
            num_frames,
            swap.capacity()
        );
        Self {
            frames: FrameTable::new(num_frames, policy),
            swap,
        }
    }

    /// A VM swapping to the first registered swap device.
    pub fn from_block_manager(num_frames: usize, blocks: &BlockManager) -> Option<Self> {
        let swap = blocks.by_type(BlockType::Swap)?;
        Some(Self::new(num_frames, swap))
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }
}
