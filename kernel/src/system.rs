use crate::block::block_core::Block;
use crate::config::{VmConfig, KILLED_EXIT_STATUS};
use crate::error::{Killed, VmError};
use crate::mem::{FrameTable, PhysicalAllocator, PinnedFrame};
use crate::swapping::SwapManager;
use crate::sync::OwnedMutex;
use crate::vm::{
    address_space::{AddressSpace, Pid},
    spt::Residency,
};
use alloc::{boxed::Box, sync::Arc};
use log::{info, warn};

/// Told when the virtual-memory subsystem ends a process, so the process
/// manager can report the exit status to whoever waits on it.
pub trait ProcessReaper: Send + Sync {
    fn reap(&self, pid: Pid, status: i32);
}

/// The state shared by every address space: physical frames, swap, and the
/// file system lock pages are loaded under.
///
/// The kernel creates one of these at boot and hands a reference to every
/// fault and system call that needs it.
pub struct VmSystem {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapManager,
    file_lock: OwnedMutex<()>,
    reaper: Option<Box<dyn ProcessReaper>>,
}

impl VmSystem {
    pub fn new(config: VmConfig, allocator: Box<dyn PhysicalAllocator>, swap_device: Block) -> Self {
        info!(
            "virtual memory: {} user frames, swap on {swap_device}",
            allocator.frame_count()
        );
        Self {
            config,
            frames: FrameTable::new(allocator),
            swap: SwapManager::new(swap_device),
            file_lock: OwnedMutex::new(()),
            reaper: None,
        }
    }

    pub fn with_reaper(mut self, reaper: Box<dyn ProcessReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }

    /// The file system lock. System calls that read files into user memory hold
    /// it across the copy, so a fault taken during the copy finds it held.
    pub fn file_lock(&self) -> &OwnedMutex<()> {
        &self.file_lock
    }

    pub fn create_address_space(&self, pid: Pid) -> Arc<AddressSpace> {
        info!("process {pid}: address space created");
        Arc::new(AddressSpace::new(pid))
    }

    /// Obtains a pinned frame for `owner`, evicting if necessary.
    ///
    /// # Panics
    ///
    /// Panics if the swap device is full or fails.
    pub fn acquire_frame(
        &self,
        owner: &Arc<AddressSpace>,
        zeroed: bool,
    ) -> Result<PinnedFrame<'_>, VmError> {
        self.frames
            .acquire(owner, zeroed, &self.swap, self.config.eviction_sweeps)
    }

    /// Frees every frame, swap slot and supplemental page table entry of
    /// `space`. Calling it again does nothing.
    pub fn release_address_space(&self, space: &AddressSpace) {
        // No eviction may be halfway through one of these pages.
        let _evictor = self.swap.lock_evictor();
        let mut spt = space.spt();

        let entries = spt.drain();
        let mut frames = 0;
        let mut slots = 0;
        for spte in &entries {
            match spte.residency() {
                Residency::Resident(frame) => {
                    space.page_manager().unmap(spte.upage());
                    self.frames.release(frame);
                    frames += 1;
                }
                Residency::Swapped(slot) => {
                    self.swap.free_slot(slot);
                    slots += 1;
                }
                Residency::NotLoaded => {}
            }
        }
        if !entries.is_empty() {
            info!(
                "process {}: address space released ({} pages, {frames} frames, {slots} swap slots)",
                space.pid(),
                entries.len()
            );
        }
    }

    /// Ends the process owning `space` with `status`.
    ///
    /// Only the first call for a process has any effect.
    pub fn exit(&self, space: &AddressSpace, status: i32) {
        if !space.set_exit_status(status) {
            return;
        }
        self.release_address_space(space);
        if let Some(reaper) = &self.reaper {
            reaper.reap(space.pid(), status);
        }
    }

    /// Kills the process owning `space` for `reason`.
    pub fn kill(&self, space: &AddressSpace, reason: VmError) -> Killed {
        warn!("process {}: killed: {reason}", space.pid());
        self.exit(space, KILLED_EXIT_STATUS);
        Killed {
            pid: space.pid(),
            status: space.exit_status().unwrap_or(KILLED_EXIT_STATUS),
            reason,
        }
    }
}
