use super::elf_loader::{load_executable, ElfError, LoadedProgram};
use crate::fs::VmFile;
use crate::mem::fault::{handle_page_fault, PageFault};
use crate::mem::pagedir::PageDirectory;
use crate::mem::spt::SupplementalPageTable;
use crate::mem::user::{copy_from_user, copy_to_user};
use crate::mem::{Result, Vm};
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, info, warn};

pub type Pid = u16;
pub type FileDescriptor = i16;

/// The first descriptor handed out; 0, 1 and 2 belong to the console.
const FIRST_FILE_DESCRIPTOR: FileDescriptor = 3;

/// A user process: an address space plus the files it has open.
pub struct Process {
    pub pid: Pid,
    pagedir: Arc<PageDirectory>,
    spt: Mutex<SupplementalPageTable>,
    /// User stack pointer saved on the last entry to the kernel.
    esp: AtomicUsize,
    files: Mutex<BTreeMap<FileDescriptor, Box<dyn VmFile>>>,
}

impl Process {
    /// A process with an empty address space.
    pub fn new(pid: Pid) -> Self {
        let pagedir = Arc::new(PageDirectory::new());
        Self {
            pid,
            spt: Mutex::new(SupplementalPageTable::new(pagedir.clone())),
            pagedir,
            esp: AtomicUsize::new(0),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pagedir(&self) -> &Arc<PageDirectory> {
        &self.pagedir
    }

    pub fn spt(&self) -> &Mutex<SupplementalPageTable> {
        &self.spt
    }

    pub fn esp(&self) -> usize {
        self.esp.load(Ordering::Relaxed)
    }

    /// Records the user stack pointer on entry to the kernel.
    pub fn set_esp(&self, esp: usize) {
        self.esp.store(esp, Ordering::Relaxed);
    }

    /// Loads the executable in `file` and returns where to start it.
    pub fn load(&self, vm: &Vm, file: &mut dyn VmFile) -> core::result::Result<usize, ElfError> {
        let LoadedProgram { entry, esp } = load_executable(vm, &mut self.spt.lock(), file)?;
        self.set_esp(esp);
        info!("pid {}: loaded, entry {:#x}", self.pid, entry);
        Ok(entry)
    }

    pub fn open_file(&self, file: Box<dyn VmFile>) -> FileDescriptor {
        let mut files = self.files.lock();
        let fd = files
            .keys()
            .next_back()
            .map_or(FIRST_FILE_DESCRIPTOR, |fd| fd + 1);
        files.insert(fd, file);
        fd
    }

    pub fn close_file(&self, fd: FileDescriptor) -> bool {
        self.files.lock().remove(&fd).is_some()
    }

    /// Runs `f` on the file open as `fd`.
    pub fn with_file<R>(&self, fd: FileDescriptor, f: impl FnOnce(&mut dyn VmFile) -> R) -> Option<R> {
        let mut files = self.files.lock();
        files.get_mut(&fd).map(|file| f(file.as_mut()))
    }

    /// Resolves a page fault in this process. User-mode faults carry the stack pointer from the
    /// trap frame; kernel-mode faults use the one saved on entry to the kernel.
    pub fn page_fault(&self, vm: &Vm, fault: PageFault, user_esp: usize) -> Result<()> {
        if fault.user {
            self.set_esp(user_esp);
        }
        let result = handle_page_fault(vm, &mut self.spt.lock(), fault, self.esp());
        if let Err(err) = result {
            warn!(
                "pid {}: page fault at {:#x} ({}), killing process",
                self.pid, fault.addr, err
            );
        }
        result
    }

    pub fn read_user(&self, vm: &Vm, src: usize, buf: &mut [u8]) -> Result<()> {
        copy_from_user(vm, &self.spt, self.esp(), src, buf)
    }

    pub fn write_user(&self, vm: &Vm, dst: usize, buf: &[u8]) -> Result<()> {
        copy_to_user(vm, &self.spt, self.esp(), dst, buf)
    }

    /// Duplicates this process. The child shares every resident frame copy-on-write, gets its own
    /// copy of anything in swap, and its own handle to every open file.
    pub fn fork(&self, vm: &Vm, child_pid: Pid) -> Result<Process> {
        let mut child = Process::new(child_pid);
        child.set_esp(self.esp());

        if let Err(err) = child.spt.get_mut().copy(vm, &self.spt.lock()) {
            warn!("pid {}: fork failed: {}", self.pid, err);
            child.spt.get_mut().kill(vm);
            return Err(err);
        }

        let files = self.files.lock();
        let child_files = child.files.get_mut();
        for (&fd, file) in files.iter() {
            let mut copy = file.reopen();
            copy.seek(file.tell());
            child_files.insert(fd, copy);
        }
        drop(files);

        debug!("pid {}: forked pid {}", self.pid, child_pid);
        Ok(child)
    }

    /// Tears down the address space, writing back mapped files, and closes every file.
    pub fn exit(&self, vm: &Vm) {
        self.spt.lock().kill(vm);
        self.files.lock().clear();
        info!("pid {}: exited", self.pid);
    }
}
