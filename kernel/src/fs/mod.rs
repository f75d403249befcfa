//! The file collaborator the VM reads lazy pages from and writes dirty mappings back to.

pub mod memfile;

use alloc::boxed::Box;

pub use memfile::MemFile;

/// An open file.
///
/// Every handle has its own cursor. Closing a handle is dropping it; the file's contents outlive
/// any single handle.
pub trait VmFile: Send {
    /// Opens a new, independent handle to the same file with its cursor at 0.
    fn reopen(&self) -> Box<dyn VmFile>;

    fn seek(&mut self, pos: u64);

    fn tell(&self) -> u64;

    /// Reads from the cursor into `buf`, advancing the cursor. Returns the number of bytes read,
    /// which is less than `buf.len()` only at end of file.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Writes `buf` at `offset` without moving the cursor. Returns the number of bytes written;
    /// files never grow, so writes are cut short at end of file.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> usize;

    /// Length of the file in bytes.
    fn length(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> usize {
        self.seek(offset);
        self.read(buf)
    }
}
