pub const KB: usize = 1024;

/// Size of one sector of a block device, swap included.
pub const SECTOR_SIZE: u32 = 512;
