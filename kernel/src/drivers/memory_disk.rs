use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::vec;
use alloc::vec::Vec;

/// A RAM-backed block device driver.
///
/// Used for the swap partition when the kernel runs without an ATA channel, and for tests.
pub struct MemoryDisk {
    sectors: Mutex<Vec<u8>>,
    read_only: bool,
}

impl MemoryDisk {
    /// A zero-filled disk of `sectors` sectors.
    pub fn new(sectors: BlockSector) -> Self {
        Self::from_bytes(vec![0; sectors as usize * BLOCK_SECTOR_SIZE])
    }

    /// A disk holding `bytes`, padded with zeroes to a whole number of sectors.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        let padded = bytes.len().div_ceil(BLOCK_SECTOR_SIZE) * BLOCK_SECTOR_SIZE;
        bytes.resize(padded, 0);
        Self {
            sectors: Mutex::new(bytes),
            read_only: false,
        }
    }

    /// Writes to a read-only disk fail with [`BlockError::WriteError`].
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn range(&self, len: usize, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        if end > len {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(start..end)
    }
}

impl BlockOp for MemoryDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let sectors = self.sectors.lock();
        let range = self.range(sectors.len(), sector)?;
        buf.copy_from_slice(&sectors[range]);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.read_only {
            return Err(BlockError::WriteError);
        }
        let mut sectors = self.sectors.lock();
        let range = self.range(sectors.len(), sector)?;
        sectors[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_pads_to_sector() {
        let disk = MemoryDisk::from_bytes(vec![7; 10]);
        let mut buf = [1; BLOCK_SECTOR_SIZE];
        disk.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[7; 10]);
        assert!(buf[10..].iter().all(|&b| b == 0));
        assert_eq!(disk.read(1, &mut buf), Err(BlockError::SectorOutOfBounds));
    }

    #[test]
    fn read_only_rejects_writes() {
        let disk = MemoryDisk::new(1).read_only();
        assert_eq!(disk.write(0, &[0; BLOCK_SECTOR_SIZE]), Err(BlockError::WriteError));
    }
}
