use crate::sizes::{KB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Number of block device sectors backing one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE as usize;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_FRAME_SIZE - 1) & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_kernel_address(addr: usize) -> bool {
    addr >= OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_up(0x1234), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
        assert_eq!(page_offset(0x1234), 0x234);
    }

    #[test]
    fn split() {
        assert!(!is_kernel_address(OFFSET - 1));
        assert!(is_kernel_address(OFFSET));
        assert_eq!(SECTORS_PER_PAGE, 8);
    }
}
