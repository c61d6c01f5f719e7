use crate::mem::FrameTableEntry;

/// Chooses which resident frame to evict.
///
/// Called with the frame table locked. Implementations may clear reference
/// information as they scan, but must only return the index of a frame for
/// which [`FrameTableEntry::is_evictable`] holds.
pub trait PageReplacementPolicy: Send {
    fn select_victim(&mut self, frames: &mut [Option<FrameTableEntry>]) -> Option<usize>;
}

/// The clock algorithm.
///
/// The hand sweeps the frame table circularly, giving every referenced frame a
/// second chance by clearing its reference bits. Two sweeps are always enough
/// to find a victim if any frame is evictable at all.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    pub const fn new() -> Self {
        Self { hand: 0 }
    }

    pub fn hand(&self) -> usize {
        self.hand
    }
}

impl PageReplacementPolicy for Clock {
    fn select_victim(&mut self, frames: &mut [Option<FrameTableEntry>]) -> Option<usize> {
        let len = frames.len();
        if len == 0 {
            return None;
        }

        for _ in 0..2 * len {
            let idx = self.hand % len;
            self.hand = (idx + 1) % len;

            let Some(entry) = frames[idx].as_mut() else {
                continue;
            };
            if !entry.is_evictable() {
                continue;
            }
            if !entry.test_and_clear_reference() {
                return Some(idx);
            }
        }

        None
    }
}
