use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// User stacks grow down from just below the kernel.
pub const USER_STACK_TOP: usize = OFFSET;

// Upper bound on how far a user stack may grow.
pub const MAX_STACK_SIZE: usize = MB;

// How far below the saved stack pointer a fault may land and still count as a
// stack access. Covers `enter` and large `sub esp` adjustments.
pub const STACK_GROWTH_WINDOW: usize = 2 * PAGE_FRAME_SIZE;

#[inline]
pub const fn pg_round_down(va: usize) -> usize {
    va & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_up(va: usize) -> usize {
    pg_round_down(va + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_offset(va: usize) -> usize {
    va & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(va: usize) -> bool {
    va < OFFSET
}

#[inline]
pub const fn is_kernel_vaddr(va: usize) -> bool {
    va >= OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(pg_round_down(0x1234), 0x1000);
        assert_eq!(pg_round_up(0x1234), 0x2000);
        assert_eq!(pg_round_up(0x2000), 0x2000);
        assert_eq!(pg_offset(0x1234), 0x234);
        assert!(is_user_vaddr(USER_STACK_TOP - 1));
        assert!(is_kernel_vaddr(USER_STACK_TOP));
    }
}
