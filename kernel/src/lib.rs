//! The virtual-memory manager of the KidneyOS kernel.
//!
//! User pages are loaded lazily from their executable, grown on demand for the
//! stack, and evicted to a swap device with the clock algorithm when physical
//! frames run out.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
pub mod mem;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod vm;

pub use config::VmConfig;
pub use error::{Killed, SwapError, VmError};
pub use system::{ProcessReaper, VmSystem};
