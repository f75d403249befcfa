use super::process::{FileDescriptor, Process};
use crate::mem::mmap::{map, unmap};
use crate::mem::Vm;
use kidneyvm_syscalls::{EBADF, EINVAL, ENOSYS, PROT_WRITE, SYS_MMAP, SYS_MUNMAP};
use log::trace;

/// Processes a syscall made by `process`. The return value is the syscall return value; errors
/// come back as a negated errno.
pub fn handler(
    vm: &Vm,
    process: &Process,
    syscall_number: usize,
    arg0: usize,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    arg4: usize,
) -> isize {
    trace!(
        "pid {}: syscall {syscall_number:#X} with arguments: {arg0:#X} {arg1:#X} {arg2:#X} {arg3:#X} {arg4:#X}",
        process.pid
    );
    match syscall_number {
        SYS_MMAP => mmap(process, arg0, arg1, arg2, arg3, arg4),
        SYS_MUNMAP => match unmap(vm, &mut process.spt().lock(), arg0) {
            Ok(()) => 0,
            Err(err) => -err.errno(),
        },
        _ => -ENOSYS,
    }
}

fn mmap(
    process: &Process,
    addr: usize,
    length: usize,
    prot: usize,
    fd: usize,
    offset: usize,
) -> isize {
    let Ok(fd) = FileDescriptor::try_from(fd as i32) else {
        return -EBADF;
    };
    let Ok(addr_out) = isize::try_from(addr) else {
        return -EINVAL;
    };
    let writable = prot & PROT_WRITE != 0;
    let result = process.with_file(fd, |file| {
        map(
            &mut process.spt().lock(),
            addr,
            length,
            writable,
            file,
            offset as u64,
        )
    });
    match result {
        None => -EBADF,
        Some(Ok(_)) => addr_out,
        Some(Err(err)) => -err.errno(),
    }
}
