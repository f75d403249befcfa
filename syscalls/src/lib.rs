#![no_std]

pub mod defs;

pub use defs::*;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod user {
    use core::arch::asm;

    #[no_mangle]
    pub extern "C" fn exit(code: usize) {
        unsafe {
            asm!("
                mov eax, 0x1
                int 0x80
            ", in("ebx") code);
        }
    }

    #[no_mangle]
    pub extern "C" fn fork() -> i32 {
        let result;
        unsafe {
            asm!("
                mov eax, 0x2
                int 0x80
            ", out("eax") result);
        }
        result
    }

    /// Map `length` bytes of the file open as `fd`, starting at `offset`, at `addr`.
    ///
    /// Returns `addr` on success and `MAP_FAILED` otherwise.
    #[no_mangle]
    pub extern "C" fn mmap(
        addr: *mut u8,
        length: usize,
        prot: usize,
        fd: i32,
        offset: usize,
    ) -> *mut u8 {
        let result;
        unsafe {
            asm!("
                mov eax, 0x5a
                int 0x80
            ", in("ebx") addr, in("ecx") length, in("edx") prot, in("esi") fd,
               in("edi") offset, lateout("eax") result);
        }
        result
    }

    #[no_mangle]
    pub extern "C" fn munmap(addr: *mut u8) -> i32 {
        let result;
        unsafe {
            asm!("
                mov eax, 0x5b
                int 0x80
            ", in("ebx") addr, lateout("eax") result);
        }
        result
    }
}
