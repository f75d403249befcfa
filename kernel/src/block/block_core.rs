use crate::block::block_error::BlockError;
use crate::drivers::memory_disk::MemoryDisk;
use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kidneyvm_shared::sizes::SECTOR_SIZE;
use log::info;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by another operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp {
    /// Read a block sector
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// Supported block drivers
pub enum BlockDriver {
    Memory(MemoryDisk),
}

impl BlockDriver {
    /// Unwrap the block driver to get the underlying block operation
    fn unwrap(&self) -> &dyn BlockOp {
        match self {
            BlockDriver::Memory(driver) => driver,
        }
    }
}

/// A block device
///
/// Synchronous: `read` and `write` return once the driver is done with the
/// buffer. Safe to share between threads; the driver serializes access.
pub struct Block {
    /// Unique and immutable index of the block
    index: usize,
    /// The name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: BlockDriver,
    /// The size of the block device in sectors
    block_size: BlockSector,
    read_count: AtomicU32,
    write_count: AtomicU32,
}

impl Block {
    pub fn new(
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: BlockDriver,
    ) -> Self {
        Self {
            index: 0,
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.unwrap().read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        if self.block_type == BlockType::Foreign {
            return Err(BlockError::WriteError);
        }

        self.driver.unwrap().write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn get_index(&self) -> usize {
        self.index
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "    {:04} | \"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.index,
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}

/// Maintain a list of blocks
#[derive(Default)]
pub struct BlockManager {
    all_blocks: Vec<Arc<Block>>,
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block device with the given `name`. The block device's `size` in sectors and its
    /// `block_type` must be provided, as well as the `driver` to access the block.
    ///
    /// Returns the index of the block device.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: BlockDriver,
    ) -> usize {
        let index = self.all_blocks.len();
        let mut block = Block::new(block_type, block_name, block_size, driver);
        block.index = index;
        self.all_blocks.push(Arc::new(block));

        info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size,
        );

        index
    }

    /// Get the block device with the given `index`.
    pub fn by_id(&self, idx: usize) -> Option<Arc<Block>> {
        self.all_blocks.get(idx).cloned()
    }

    /// Get the block device with the given `name`.
    pub fn by_name(&self, name: &str) -> Option<Arc<Block>> {
        self.all_blocks.iter().find(|b| b.block_name == name).cloned()
    }

    /// Get the first block device of type `block_type`, e.g. the swap disk.
    pub fn by_type(&self, block_type: BlockType) -> Option<Arc<Block>> {
        self.all_blocks
            .iter()
            .find(|b| b.block_type == block_type)
            .cloned()
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block Devices:")?;
        for block in &self.all_blocks {
            writeln!(f, "{}", block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    /// A RAM-backed swap device with room for `sectors` sectors.
    pub fn swap_block(sectors: BlockSector) -> Arc<Block> {
        Arc::new(Block::new(
            BlockType::Swap,
            "swap",
            sectors,
            BlockDriver::Memory(MemoryDisk::new(sectors)),
        ))
    }
}
