//! Disk-backed storage for evicted anonymous pages.
//!
//! The swap device is divided into slots of `SECTORS_PER_PAGE` consecutive sectors, each holding
//! exactly one page. Slot bookkeeping lives behind the swap lock; disk transfers happen outside
//! of it, on slots already reserved by the caller.

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::mem::frame_table::FrameData;
use crate::mem::{Result, VmError};
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use kidneyvm_shared::mem::PAGE_FRAME_SIZE;
use log::{trace, warn};
use zerocopy::FromZeroes;

pub type SlotIndex = usize;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

struct SwapSlot {
    index: SlotIndex,
    free: bool,
}

pub struct SwapSpace {
    block: Arc<Block>,
    capacity: usize,
    slots: Mutex<Vec<SwapSlot>>,
}

impl SwapSpace {
    pub fn new(block: Arc<Block>) -> Self {
        let capacity = block.get_size() as usize / SECTORS_PER_PAGE;
        Self {
            block,
            capacity,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Total number of page slots on the swap device.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| !s.free).count()
    }

    /// Reserves a free slot, growing the slot list up to the device capacity.
    fn allocate(&self) -> Result<SlotIndex> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.free) {
            slot.free = false;
            return Ok(slot.index);
        }
        if slots.len() >= self.capacity {
            warn!("swap is full ({} slots)", self.capacity);
            return Err(VmError::AllocationExhausted);
        }
        let index = slots.len();
        slots.push(SwapSlot { index, free: false });
        Ok(index)
    }

    /// Returns `slot` to the free pool. Freeing a free slot does nothing.
    pub fn free(&self, slot: SlotIndex) {
        if let Some(slot) = self.slots.lock().get_mut(slot) {
            slot.free = true;
        }
    }

    fn first_sector(slot: SlotIndex) -> BlockSector {
        (slot * SECTORS_PER_PAGE) as BlockSector
    }

    fn write_slot(&self, slot: SlotIndex, data: &FrameData) -> Result<()> {
        let start = Self::first_sector(slot);
        for (i, chunk) in data.0.chunks(BLOCK_SECTOR_SIZE).enumerate() {
            self.block.write(start + i as BlockSector, chunk)?;
        }
        Ok(())
    }

    fn read_slot(&self, slot: SlotIndex, data: &mut FrameData) -> Result<()> {
        let start = Self::first_sector(slot);
        for (i, chunk) in data.0.chunks_mut(BLOCK_SECTOR_SIZE).enumerate() {
            self.block.read(start + i as BlockSector, chunk)?;
        }
        Ok(())
    }

    /// Writes a page to a fresh slot and returns the slot.
    pub fn swap_out(&self, data: &FrameData) -> Result<SlotIndex> {
        let slot = self.allocate()?;
        if let Err(err) = self.write_slot(slot, data) {
            self.free(slot);
            return Err(err);
        }
        trace!("swapped out to slot {}", slot);
        Ok(slot)
    }

    /// Reads `slot` back into `data` and frees the slot.
    ///
    /// On a failed read the slot stays allocated, so its contents are not lost.
    pub fn swap_in(&self, slot: SlotIndex, data: &mut FrameData) -> Result<()> {
        self.read_slot(slot, data)?;
        self.free(slot);
        trace!("swapped in from slot {}", slot);
        Ok(())
    }

    /// Copies `slot` into a newly allocated slot.
    pub fn duplicate(&self, slot: SlotIndex) -> Result<SlotIndex> {
        let mut data = FrameData::new_box_zeroed();
        self.read_slot(slot, &mut data)?;
        self.swap_out(&data)
    }
}
