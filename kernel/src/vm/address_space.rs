use super::spt::SupplementalPageTable;
use crate::sync::{Mutex, MutexGuard, Tid};
use kidneyos_shared::paging::PageManager;

pub type Pid = u32;

/// The virtual-memory state of one user process.
///
/// Processes here are single threaded, so the process id doubles as the id of
/// the thread that faults on its behalf.
pub struct AddressSpace {
    pid: Pid,
    spt: Mutex<SupplementalPageTable>,
    page_manager: Mutex<PageManager>,
    exit_status: Mutex<Option<i32>>,
}

impl AddressSpace {
    /// # Panics
    ///
    /// Panics if `pid` is 0, which is reserved for the kernel.
    pub fn new(pid: Pid) -> Self {
        assert_ne!(pid, 0, "pid 0 is reserved for the kernel");
        Self {
            pid,
            spt: Mutex::new(SupplementalPageTable::new(pid)),
            page_manager: Mutex::new(PageManager::new()),
            exit_status: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tid(&self) -> Tid {
        self.pid
    }

    pub fn spt(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.spt.lock()
    }

    pub fn page_manager(&self) -> MutexGuard<'_, PageManager> {
        self.page_manager.lock()
    }

    /// Records the exit status unless one was already recorded.
    ///
    /// Returns whether this call set it.
    pub fn set_exit_status(&self, status: i32) -> bool {
        let mut exit_status = self.exit_status.lock();
        if exit_status.is_some() {
            return false;
        }
        *exit_status = Some(status);
        true
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_is_set_once() {
        let space = AddressSpace::new(9);
        assert_eq!(space.exit_status(), None);
        assert!(space.set_exit_status(-1));
        assert!(!space.set_exit_status(0));
        assert_eq!(space.exit_status(), Some(-1));
        assert!(space.has_exited());
    }

    #[test]
    #[should_panic]
    fn pid_zero_is_rejected() {
        let _ = AddressSpace::new(0);
    }
}
