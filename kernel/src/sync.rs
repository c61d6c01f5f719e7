pub mod mutex;

pub use mutex::{Mutex, MutexGuard, OwnedMutex, OwnedMutexGuard};

use core::sync::atomic::AtomicU32;

/// Kernel thread identifier. Zero is never a valid thread.
pub type Tid = u32;
pub type AtomicTid = AtomicU32;
