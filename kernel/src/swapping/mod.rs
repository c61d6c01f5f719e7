//! Swap space and eviction.
//!
//! The swap device is divided into page-sized slots of [`SECTORS_PER_PAGE`]
//! sectors each. A bitmap records which slots hold an evicted page.

pub mod page_replacement;

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::error::SwapError;
use crate::mem::{FrameNumber, FrameTable, PinnedFrame};
use crate::sync::{Mutex, MutexGuard};
use alloc::boxed::Box;
use kidneyos_shared::{bitmap::Bitmap, mem::SECTORS_PER_PAGE};
use log::{debug, warn};
use page_replacement::{Clock, PageReplacementPolicy};

/// A page-sized region of the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    fn first_sector(self) -> BlockSector {
        self.0 * SECTORS_PER_PAGE as BlockSector
    }
}

pub struct SwapManager {
    /// Held for the whole of an eviction, and by address-space teardown.
    evictor: Mutex<Box<dyn PageReplacementPolicy>>,
    slots: Mutex<Bitmap>,
    device: Mutex<Block>,
}

impl SwapManager {
    /// Uses `device` as swap space with clock replacement.
    pub fn new(device: Block) -> Self {
        Self::with_policy(device, Box::new(Clock::new()))
    }

    pub fn with_policy(device: Block, policy: Box<dyn PageReplacementPolicy>) -> Self {
        let slot_count = device.get_size() as usize / SECTORS_PER_PAGE;
        debug!("swap device {device}: {slot_count} slots");
        Self {
            evictor: Mutex::new(policy),
            slots: Mutex::new(Bitmap::new(slot_count)),
            device: Mutex::new(device),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.slots.lock().count_set()
    }

    pub fn free_slots(&self) -> usize {
        let slots = self.slots.lock();
        slots.len() - slots.count_set()
    }

    pub fn is_slot_used(&self, slot: SwapSlot) -> bool {
        self.slots.lock().get(slot.index())
    }

    /// Sectors read from and written to the swap device so far.
    pub fn device_counters(&self) -> (u32, u32) {
        let device = self.device.lock();
        (device.read_count(), device.write_count())
    }

    /// Excludes evictions for as long as the guard lives.
    pub(crate) fn lock_evictor(&self) -> MutexGuard<'_, Box<dyn PageReplacementPolicy>> {
        self.evictor.lock()
    }

    fn allocate_slot(&self) -> Result<SwapSlot, SwapError> {
        let idx = self.slots.lock().scan_and_set().ok_or(SwapError::Full)?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(SwapSlot(idx as u32))
    }

    /// Marks `slot` free again.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not in use.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        assert!(slots.get(slot.index()), "freeing unused {slot:?}");
        slots.set(slot.index(), false);
    }

    fn write_slot(&self, slot: SwapSlot, page: &[u8]) -> Result<(), SwapError> {
        let mut device = self.device.lock();
        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            device.write(slot.first_sector() + i as BlockSector, sector)?;
        }
        Ok(())
    }

    fn read_slot(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), SwapError> {
        let mut device = self.device.lock();
        for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            device.read(slot.first_sector() + i as BlockSector, sector)?;
        }
        Ok(())
    }

    /// Evicts one frame and returns it, zeroed and detached from the frame
    /// table, for the caller to record as its own.
    ///
    /// Makes a single clock pass. Returns `Ok(None)` if every frame is pinned
    /// or unbound.
    pub fn swap_out(&self, frames: &FrameTable) -> Result<Option<FrameNumber>, SwapError> {
        let mut policy = self.evictor.lock();
        self.evict_one(frames, &mut **policy)
    }

    fn evict_one(
        &self,
        frames: &FrameTable,
        policy: &mut dyn PageReplacementPolicy,
    ) -> Result<Option<FrameNumber>, SwapError> {
        let Some((mut pinned, victim)) = frames.select_victim(policy) else {
            return Ok(None);
        };
        let upage = victim.binding.upage;

        let Some(owner) = victim.owner.upgrade() else {
            warn!(
                "frame {} outlived process {}, reclaiming it",
                pinned.number().index(),
                victim.pid
            );
            pinned.bytes_mut().fill(0);
            return Ok(Some(pinned.detach()));
        };

        let mut spt = owner.spt();
        // Unmap first, so the owner faults instead of touching the frame while
        // it is written out.
        let dirty = {
            let mut page_manager = owner.page_manager();
            let dirty = page_manager.is_dirty(upage);
            page_manager.unmap(upage);
            dirty
        };

        let spte = spt
            .get(victim.binding.spte)
            .expect("eviction victim has no supplemental page table entry");
        if dirty && spte.writable() {
            let slot = self.allocate_slot()?;
            self.write_slot(slot, pinned.bytes())?;
            spt.mark_swapped(victim.binding.spte, slot);
            debug!(
                "evicted {upage:#X} of process {} to {slot:?}",
                victim.pid
            );
        } else {
            spt.mark_unloaded(victim.binding.spte);
            debug!(
                "dropped clean page {upage:#X} of process {}",
                victim.pid
            );
        }
        drop(spt);

        pinned.bytes_mut().fill(0);
        Ok(Some(pinned.detach()))
    }

    /// Reads the page stored in `slot` into `frame` and frees the slot.
    ///
    /// The frame must stay pinned until it is mapped and bound.
    pub fn swap_in(&self, slot: SwapSlot, frame: &mut PinnedFrame<'_>) -> Result<(), SwapError> {
        assert!(self.is_slot_used(slot), "swapping in from unused {slot:?}");
        self.read_slot(slot, frame.bytes_mut())?;
        self.free_slot(slot);
        debug!("swapped {slot:?} into frame {}", frame.number().index());
        Ok(())
    }
}
