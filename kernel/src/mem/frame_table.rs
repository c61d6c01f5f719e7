//! The frame table: one entry per user frame currently handed out.
//!
//! Entries record who owns a frame and which supplemental page table entry
//! currently lives in it. Every mutation happens under the table-wide lock;
//! device I/O never does.

use super::{FrameNumber, PhysicalAllocator};
use crate::error::VmError;
use crate::swapping::{page_replacement::PageReplacementPolicy, SwapManager};
use crate::sync::Mutex;
use crate::vm::{
    address_space::{AddressSpace, Pid},
    spt::SpteId,
};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use bitbybit::bitfield;
use core::{mem::ManuallyDrop, ptr::NonNull, slice};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, warn};

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    #[bit(0, rw)]
    pinned: bool,
    #[bit(1, rw)]
    referenced: bool,
}

/// The page a frame is backing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub spte: SpteId,
    /// User virtual address of the page.
    pub upage: usize,
}

pub struct FrameTableEntry {
    pid: Pid,
    owner: Weak<AddressSpace>,
    kernel_address: usize,
    binding: Option<Binding>,
    flags: FrameFlags,
    /// Distinguishes successive occupants of the same frame.
    serial: u64,
}

impl FrameTableEntry {
    /// A freshly handed out frame: pinned, and not yet backing any page.
    pub(crate) fn new(pid: Pid, owner: Weak<AddressSpace>, kernel_address: usize, serial: u64) -> Self {
        Self {
            pid,
            owner,
            kernel_address,
            binding: None,
            flags: FrameFlags::default().with_pinned(true),
            serial,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn binding(&self) -> Option<Binding> {
        self.binding
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.pinned()
    }

    /// Pinned frames and frames still being set up are never eviction victims.
    pub fn is_evictable(&self) -> bool {
        !self.flags.pinned() && self.binding.is_some()
    }

    /// Reports whether the frame was used since the last call, and forgets it.
    ///
    /// Combines the software reference flag set when the frame was bound with
    /// the hardware accessed bit of the page mapped to it.
    pub fn test_and_clear_reference(&mut self) -> bool {
        let referenced = self.flags.referenced();
        self.flags = self.flags.with_referenced(false);

        let accessed = match (self.binding, self.owner.upgrade()) {
            (Some(binding), Some(owner)) => {
                let mut page_manager = owner.page_manager();
                let accessed = page_manager.is_accessed(binding.upage);
                if accessed {
                    page_manager.set_accessed(binding.upage, false);
                }
                accessed
            }
            _ => false,
        };

        referenced || accessed
    }

    #[cfg(test)]
    pub(crate) fn set_test_state(&mut self, binding: Option<Binding>, pinned: bool, referenced: bool) {
        self.binding = binding;
        self.flags = FrameFlags::default()
            .with_pinned(pinned)
            .with_referenced(referenced);
    }
}

/// What the evictor needs to know about the frame it picked.
pub struct Victim {
    pub pid: Pid,
    pub owner: Weak<AddressSpace>,
    pub binding: Binding,
}

/// A snapshot of one frame table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub pid: Pid,
    pub binding: Option<Binding>,
    pub pinned: bool,
}

struct Entries {
    slots: Box<[Option<FrameTableEntry>]>,
    next_serial: u64,
}

impl Entries {
    fn get_mut(&mut self, frame: FrameNumber, serial: u64) -> Option<&mut FrameTableEntry> {
        self.slots
            .get_mut(frame.index())?
            .as_mut()
            .filter(|entry| entry.serial == serial)
    }
}

pub struct FrameTable {
    allocator: Box<dyn PhysicalAllocator>,
    entries: Mutex<Entries>,
}

impl FrameTable {
    pub fn new(allocator: Box<dyn PhysicalAllocator>) -> Self {
        let mut slots = Vec::with_capacity(allocator.frame_count());
        slots.resize_with(allocator.frame_count(), || None);
        Self {
            allocator,
            entries: Mutex::new(Entries {
                slots: slots.into_boxed_slice(),
                next_serial: 0,
            }),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.allocator.frame_count()
    }

    /// Obtains a frame for `owner`, evicting another one if none is free.
    ///
    /// While every frame is pinned or unbound this keeps retrying both the
    /// allocator and eviction, giving up after `sweeps` passes if that is set.
    /// The frame comes back pinned and unbound. Dropping the guard without
    /// binding it gives the frame back to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if eviction needs swap space and the swap device is full or failing.
    pub fn acquire(
        &self,
        owner: &Arc<AddressSpace>,
        zeroed: bool,
        swap: &SwapManager,
        sweeps: Option<usize>,
    ) -> Result<PinnedFrame<'_>, VmError> {
        if self.frame_count() == 0 {
            return Err(VmError::OutOfFrames);
        }

        let mut passes = 0usize;
        loop {
            if let Some(frame) = self.allocator.alloc(zeroed) {
                debug!("frame {} handed to process {}", frame.index(), owner.pid());
                return Ok(self.record(frame, owner));
            }

            // Evicted frames come back zeroed.
            match swap.swap_out(self) {
                Ok(Some(frame)) => {
                    debug!("frame {} reclaimed for process {}", frame.index(), owner.pid());
                    return Ok(self.record(frame, owner));
                }
                Ok(None) => {}
                Err(err) => panic!("swap subsystem failure: {err}"),
            }

            passes += 1;
            if sweeps.is_some_and(|limit| passes >= limit) {
                warn!("no frame for process {}: every frame is pinned or unbound", owner.pid());
                return Err(VmError::OutOfFrames);
            }
            core::hint::spin_loop();
        }
    }

    fn record(&self, frame: FrameNumber, owner: &Arc<AddressSpace>) -> PinnedFrame<'_> {
        let kernel_address = self.allocator.kernel_address(frame);
        let mut entries = self.entries.lock();
        let serial = entries.next_serial;
        entries.next_serial += 1;

        let slot = &mut entries.slots[frame.index()];
        assert!(slot.is_none(), "{frame:?} is already in the frame table");
        *slot = Some(FrameTableEntry::new(
            owner.pid(),
            Arc::downgrade(owner),
            kernel_address.as_ptr() as usize,
            serial,
        ));

        PinnedFrame {
            table: self,
            frame,
            serial,
            kernel_address,
        }
    }

    /// Frees `frame` back to the allocator and forgets its entry.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not in the table.
    pub fn release(&self, frame: FrameNumber) {
        let entry = self.entries.lock().slots[frame.index()].take();
        assert!(entry.is_some(), "releasing {frame:?}, which is not in use");
        self.allocator.dealloc(frame);
    }

    /// Pins a bound frame of process `pid` backing `upage`, so the kernel can
    /// touch its contents without it being evicted underneath.
    ///
    /// Returns `None` if the frame no longer backs that page or is already pinned.
    pub fn try_pin(&self, frame: FrameNumber, pid: Pid, upage: usize) -> Option<PinnedFrame<'_>> {
        let mut entries = self.entries.lock();
        let entry = entries.slots.get_mut(frame.index())?.as_mut()?;
        if entry.pid != pid
            || entry.is_pinned()
            || entry.binding.map(|binding| binding.upage) != Some(upage)
        {
            return None;
        }
        entry.flags = entry.flags.with_pinned(true);
        Some(PinnedFrame {
            table: self,
            frame,
            serial: entry.serial,
            kernel_address: NonNull::new(entry.kernel_address as *mut u8)?,
        })
    }

    /// Runs `policy` over the table and pins the frame it picks.
    pub(crate) fn select_victim(
        &self,
        policy: &mut dyn PageReplacementPolicy,
    ) -> Option<(PinnedFrame<'_>, Victim)> {
        let mut entries = self.entries.lock();
        let idx = policy.select_victim(&mut entries.slots)?;
        let entry = entries.slots.get_mut(idx)?.as_mut()?;
        assert!(
            entry.is_evictable(),
            "replacement policy picked frame {idx}, which is pinned or unbound"
        );
        let binding = entry.binding?;
        entry.flags = entry.flags.with_pinned(true);

        let pinned = PinnedFrame {
            table: self,
            frame: FrameNumber(idx),
            serial: entry.serial,
            kernel_address: NonNull::new(entry.kernel_address as *mut u8)?,
        };
        let victim = Victim {
            pid: entry.pid,
            owner: entry.owner.clone(),
            binding,
        };
        Some((pinned, victim))
    }

    fn bind_entry(&self, frame: FrameNumber, serial: u64, binding: Binding) {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(frame, serial)
            .expect("binding a frame that left the frame table");
        entry.binding = Some(binding);
        entry.flags = entry.flags.with_referenced(true).with_pinned(false);
    }

    fn unpin_or_release(&self, frame: FrameNumber, serial: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(frame, serial) else {
            return;
        };
        if entry.binding.is_some() {
            entry.flags = entry.flags.with_pinned(false);
            return;
        }
        entries.slots[frame.index()] = None;
        drop(entries);
        self.allocator.dealloc(frame);
    }

    fn detach_entry(&self, frame: FrameNumber, serial: u64) {
        let mut entries = self.entries.lock();
        assert!(
            entries.get_mut(frame, serial).is_some(),
            "detaching a frame that left the frame table"
        );
        entries.slots[frame.index()] = None;
    }

    pub fn entry_info(&self, frame: FrameNumber) -> Option<FrameInfo> {
        let entries = self.entries.lock();
        let entry = entries.slots.get(frame.index())?.as_ref()?;
        Some(FrameInfo {
            pid: entry.pid,
            binding: entry.binding,
            pinned: entry.is_pinned(),
        })
    }

    /// Frames backing a page.
    pub fn resident_frames(&self) -> usize {
        self.count(|entry| entry.binding.is_some())
    }

    pub fn pinned_frames(&self) -> usize {
        self.count(FrameTableEntry::is_pinned)
    }

    pub fn frames_of(&self, pid: Pid) -> Vec<FrameNumber> {
        let entries = self.entries.lock();
        entries
            .slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.as_ref().is_some_and(|entry| entry.pid == pid))
            .map(|(idx, _)| FrameNumber(idx))
            .collect()
    }

    fn count(&self, predicate: impl Fn(&FrameTableEntry) -> bool) -> usize {
        let entries = self.entries.lock();
        entries.slots.iter().flatten().filter(|entry| predicate(entry)).count()
    }
}

/// Exclusive use of a frame, protected from eviction.
///
/// Dropping the guard unpins the frame. A frame that was never bound to a page
/// is freed instead, so an abandoned installation cannot leak it.
pub struct PinnedFrame<'a> {
    table: &'a FrameTable,
    frame: FrameNumber,
    serial: u64,
    kernel_address: NonNull<u8>,
}

impl<'a> PinnedFrame<'a> {
    pub fn number(&self) -> FrameNumber {
        self.frame
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: The pin gives this guard exclusive use of the whole frame.
        unsafe { slice::from_raw_parts(self.kernel_address.as_ptr(), PAGE_FRAME_SIZE) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: The pin gives this guard exclusive use of the whole frame.
        unsafe { slice::from_raw_parts_mut(self.kernel_address.as_ptr(), PAGE_FRAME_SIZE) }
    }

    /// Records that the frame now backs `spte` at `upage` and unpins it.
    ///
    /// Call once the page table mapping is in place.
    pub fn bind(self, spte: SpteId, upage: usize) {
        let this = ManuallyDrop::new(self);
        this.table
            .bind_entry(this.frame, this.serial, Binding { spte, upage });
    }

    /// Removes the frame from the table without freeing it, for reuse by the
    /// caller.
    pub(crate) fn detach(self) -> FrameNumber {
        let this = ManuallyDrop::new(self);
        this.table.detach_entry(this.frame, this.serial);
        this.frame
    }
}

impl Drop for PinnedFrame<'_> {
    fn drop(&mut self) {
        self.table.unpin_or_release(self.frame, self.serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PagePool;
    use crate::swapping::SwapManager;
    use crate::block::block_core::{BlockType, MemDisk};
    use crate::vm::spt::SpteId;

    fn setup(frames: usize) -> (FrameTable, SwapManager, Arc<AddressSpace>) {
        let table = FrameTable::new(Box::new(PagePool::new(frames)));
        let swap = SwapManager::new(MemDisk::new(64).into_block("swap", BlockType::Swap));
        (table, swap, Arc::new(AddressSpace::new(1)))
    }

    #[test]
    fn acquired_frames_are_pinned_until_bound() {
        let (table, swap, space) = setup(2);
        let frame = table.acquire(&space, true, &swap, Some(1)).unwrap();
        let number = frame.number();
        assert_eq!(
            table.entry_info(number),
            Some(FrameInfo { pid: 1, binding: None, pinned: true })
        );
        assert_eq!(table.resident_frames(), 0);

        let spte = SpteId::new(0, 0);
        frame.bind(spte, 0x1000);
        assert_eq!(
            table.entry_info(number),
            Some(FrameInfo {
                pid: 1,
                binding: Some(Binding { spte, upage: 0x1000 }),
                pinned: false,
            })
        );
        assert_eq!(table.resident_frames(), 1);
        assert_eq!(table.pinned_frames(), 0);
    }

    #[test]
    fn dropping_an_unbound_frame_frees_it() {
        let (table, swap, space) = setup(1);
        let frame = table.acquire(&space, false, &swap, Some(1)).unwrap();
        let number = frame.number();
        drop(frame);
        assert_eq!(table.entry_info(number), None);
        // The only frame is available again.
        assert!(table.acquire(&space, false, &swap, Some(1)).is_ok());
    }

    #[test]
    fn waits_for_a_frame_freed_by_another_thread() {
        let (table, swap, space) = setup(1);
        let held = std::sync::Barrier::new(2);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut frame = table.acquire(&space, false, &swap, None).unwrap();
                frame.bytes_mut().fill(0xAA);
                held.wait();
                std::thread::sleep(std::time::Duration::from_millis(2));
                drop(frame);
            });
            held.wait();
            let frame = table.acquire(&space, true, &swap, None).unwrap();
            assert_eq!(frame.number(), FrameNumber(0));
            assert!(frame.bytes().iter().all(|&byte| byte == 0));
        });
    }

    #[test]
    fn empty_pool_is_out_of_frames() {
        let (table, swap, space) = setup(0);
        assert_eq!(
            table.acquire(&space, false, &swap, None).err(),
            Some(VmError::OutOfFrames)
        );
    }

    #[test]
    fn out_of_frames_when_nothing_is_evictable() {
        let (table, swap, space) = setup(1);
        let _held = table.acquire(&space, false, &swap, Some(1)).unwrap();
        assert_eq!(
            table.acquire(&space, false, &swap, Some(2)).err(),
            Some(VmError::OutOfFrames)
        );
        assert_eq!(table.pinned_frames(), 1);
    }

    #[test]
    fn try_pin_checks_owner_page_and_pin_state() {
        let (table, swap, space) = setup(1);
        let frame = table.acquire(&space, false, &swap, Some(1)).unwrap();
        let number = frame.number();
        // Unbound frames are never pinned by anyone else.
        assert!(table.try_pin(number, 1, 0x1000).is_none());
        frame.bind(SpteId::new(0, 0), 0x1000);

        assert!(table.try_pin(number, 2, 0x1000).is_none());
        assert!(table.try_pin(number, 1, 0x2000).is_none());
        let pinned = table.try_pin(number, 1, 0x1000).unwrap();
        assert!(table.try_pin(number, 1, 0x1000).is_none());
        drop(pinned);
        // Bound frames are only unpinned on drop, never freed.
        assert_eq!(table.resident_frames(), 1);
        assert!(table.try_pin(number, 1, 0x1000).is_some());
    }

    #[test]
    fn stale_guard_does_not_touch_new_occupant() {
        let (table, swap, space) = setup(1);
        let frame = table.acquire(&space, false, &swap, Some(1)).unwrap();
        let number = frame.number();
        frame.bind(SpteId::new(0, 0), 0x1000);
        let stale = table.try_pin(number, 1, 0x1000).unwrap();

        table.release(number);
        let fresh = table.acquire(&space, false, &swap, Some(1)).unwrap();
        assert_eq!(fresh.number(), number);
        drop(stale);
        assert_eq!(table.entry_info(number).map(|info| info.pinned), Some(true));
        drop(fresh);
    }

    #[test]
    fn frames_of_lists_owned_frames() {
        let (table, swap, space) = setup(3);
        let other = Arc::new(AddressSpace::new(2));
        let a = table.acquire(&space, false, &swap, Some(1)).unwrap();
        let b = table.acquire(&other, false, &swap, Some(1)).unwrap();
        assert_eq!(table.frames_of(1), [a.number()]);
        assert_eq!(table.frames_of(2), [b.number()]);
    }

    #[test]
    #[should_panic]
    fn releasing_a_free_frame_panics() {
        let (table, _swap, _space) = setup(1);
        table.release(FrameNumber(0));
    }
}
