pub mod frame_table;
pub mod pool;

pub use frame_table::{FrameTable, FrameTableEntry, PinnedFrame};
pub use pool::{PagePool, PhysicalAllocator};

/// Index of a physical frame in the user frame pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub const fn index(self) -> usize {
        self.0
    }
}
