/// Exit status given to a process killed by the fault path.
pub const KILLED_EXIT_STATUS: i32 = -1;

/// Tunables of the virtual-memory subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum number of stack pages per process, including the initial one.
    pub max_stack_pages: usize,
    /// How far below the stack pointer a fault may land and still count as
    /// stack growth. 32 bytes covers `pusha`.
    pub stack_slack: usize,
    /// Number of clock passes frame acquisition makes while every frame is
    /// pinned or unbound before giving up. `None` waits until a frame is
    /// freed or unpinned.
    pub eviction_sweeps: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack_pages: 32,
            stack_slack: 32,
            eviction_sweeps: None,
        }
    }
}
