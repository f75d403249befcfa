#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for a teaching kernel: lazily loaded executables, anonymous and
//! file-backed pages, swapping, copy-on-write fork and memory-mapped files.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod sync;
pub mod user_program;
