use crate::fs::VmFile;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, sync::Arc, vec::Vec};

/// A file whose contents live in kernel memory.
///
/// Handles made with [`VmFile::reopen`] or [`Clone`] share the contents but not the cursor.
#[derive(Clone)]
pub struct MemFile {
    inode: Arc<Mutex<Vec<u8>>>,
    pos: u64,
}

impl MemFile {
    pub fn new(contents: Vec<u8>) -> Self {
        Self {
            inode: Arc::new(Mutex::new(contents)),
            pos: 0,
        }
    }

    /// A copy of the current file contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inode.lock().clone()
    }

    /// Number of live handles to this file, including `self`.
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.inode)
    }
}

impl VmFile for MemFile {
    fn reopen(&self) -> Box<dyn VmFile> {
        Box::new(Self {
            inode: self.inode.clone(),
            pos: 0,
        })
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let contents = self.inode.lock();
        let start = (self.pos as usize).min(contents.len());
        let n = buf.len().min(contents.len() - start);
        buf[..n].copy_from_slice(&contents[start..start + n]);
        self.pos += n as u64;
        n
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> usize {
        let mut contents = self.inode.lock();
        let start = (offset as usize).min(contents.len());
        let n = buf.len().min(contents.len() - start);
        contents[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> u64 {
        self.inode.lock().len() as u64
    }
}
