use crate::block::block_error::BlockError;
use crate::vm::address_space::Pid;
use thiserror::Error;

/// Per-process failures of the virtual-memory subsystem.
///
/// Every one of these ends with the offending process being killed; none of
/// them is propagated to the kernel.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("illegal access to {0:#X}")]
    IllegalAccess(usize),
    #[error("write to read-only page at {0:#X}")]
    ReadOnlyWrite(usize),
    #[error("stack quota of {0} pages exceeded")]
    StackQuotaExceeded(usize),
    #[error("no physical frame could be obtained")]
    OutOfFrames,
    #[error("short read while loading page: wanted {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("page at {0:#X} is already mapped")]
    AlreadyMapped(usize),
    #[error("page {0:#X} already has a supplemental page table entry")]
    DuplicatePage(usize),
    #[error("segment is not page-aligned or leaves user space")]
    BadSegment,
}

/// Failures of the swap device. These are fatal to the whole system.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    #[error("no free swap slot")]
    Full,
    #[error("swap device failure: {0}")]
    Device(#[from] BlockError),
}

/// A process was terminated by the virtual-memory subsystem.
///
/// The trap or system-call path that receives this must not return to user
/// mode.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("process {pid} killed with status {status}: {reason}")]
pub struct Killed {
    pub pid: Pid,
    pub status: i32,
    pub reason: VmError,
}
