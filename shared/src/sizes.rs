pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const SECTOR_SIZE: u32 = 512;
/// Size of the swap device the kernel is configured with: 4 MiB.
pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: u32 = SECTOR_SIZE * SWAP_SECTORS;
