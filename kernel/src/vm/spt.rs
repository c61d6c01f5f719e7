//! The supplemental page table.
//!
//! One per process. Entries live in an arena and are named by [`SpteId`], which
//! carries a generation so that an identifier kept past the entry's removal
//! (by the frame table, say) looks up as absent instead of aliasing whatever
//! entry reuses the slot.

use super::{address_space::Pid, file::VmFile};
use crate::error::VmError;
use crate::mem::FrameNumber;
use crate::swapping::SwapSlot;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::{page_round_down, PAGE_FRAME_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpteId {
    index: u32,
    generation: u32,
}

impl SpteId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Where the contents of a page come from the first time it is touched.
#[derive(Clone)]
pub enum Origin {
    File {
        file: Arc<dyn VmFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
    ZeroStack,
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Origin::File {
                offset,
                read_bytes,
                zero_bytes,
                writable,
                ..
            } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("read_bytes", read_bytes)
                .field("zero_bytes", zero_bytes)
                .field("writable", writable)
                .finish_non_exhaustive(),
            Origin::ZeroStack => f.write_str("ZeroStack"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// Never touched, or dropped clean by eviction.
    NotLoaded,
    Resident(FrameNumber),
    Swapped(SwapSlot),
}

#[derive(Clone, Debug)]
pub struct Spte {
    pid: Pid,
    upage: usize,
    origin: Origin,
    residency: Residency,
}

impl Spte {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// User virtual address of the page.
    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn writable(&self) -> bool {
        match self.origin {
            Origin::File { writable, .. } => writable,
            Origin::ZeroStack => true,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.residency, Residency::Resident(_))
    }

    pub fn is_swapped(&self) -> bool {
        matches!(self.residency, Residency::Swapped(_))
    }
}

struct Slot {
    generation: u32,
    entry: Option<Spte>,
}

pub struct SupplementalPageTable {
    pid: Pid,
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_page: BTreeMap<usize, SpteId>,
    stack_pages: usize,
}

impl SupplementalPageTable {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            slots: Vec::new(),
            free: Vec::new(),
            by_page: BTreeMap::new(),
            stack_pages: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_page.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_page.is_empty()
    }

    /// Number of zero-fill stack pages registered so far.
    pub fn stack_pages(&self) -> usize {
        self.stack_pages
    }

    /// Registers a page whose contents are read from `file` on first touch.
    pub fn register_file_backed(
        &mut self,
        upage: usize,
        file: Arc<dyn VmFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<SpteId, VmError> {
        assert_eq!(
            read_bytes + zero_bytes,
            PAGE_FRAME_SIZE,
            "read and zero bytes must cover exactly one page"
        );
        self.insert(
            upage,
            Origin::File {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            },
        )
    }

    /// Registers a zero-filled, writable stack page.
    pub fn register_zero_stack(&mut self, upage: usize) -> Result<SpteId, VmError> {
        let id = self.insert(upage, Origin::ZeroStack)?;
        self.stack_pages += 1;
        Ok(id)
    }

    fn insert(&mut self, upage: usize, origin: Origin) -> Result<SpteId, VmError> {
        assert_eq!(upage, page_round_down(upage), "{upage:#X} is not page aligned");
        if self.by_page.contains_key(&upage) {
            return Err(VmError::DuplicatePage(upage));
        }

        let entry = Spte {
            pid: self.pid,
            upage,
            origin,
            residency: Residency::NotLoaded,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                SpteId::new(index, slot.generation)
            }
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                SpteId::new(index, 0)
            }
        };
        self.by_page.insert(upage, id);
        Ok(id)
    }

    /// Entry for the page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<(SpteId, &Spte)> {
        let id = *self.by_page.get(&page_round_down(addr))?;
        Some((id, self.get(id)?))
    }

    pub fn get(&self, id: SpteId) -> Option<&Spte> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, id: SpteId) -> &mut Spte {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .expect("stale supplemental page table entry id")
    }

    /// Records that the page now lives in `slot`. The page must be resident.
    pub fn mark_swapped(&mut self, id: SpteId, slot: SwapSlot) {
        let entry = self.get_mut(id);
        assert!(
            entry.is_resident(),
            "swapping out {:#X}, which is not resident",
            entry.upage
        );
        entry.residency = Residency::Swapped(slot);
    }

    /// Records that the page now lives in `frame`. The page must not be
    /// resident already.
    pub fn mark_resident(&mut self, id: SpteId, frame: FrameNumber) {
        let entry = self.get_mut(id);
        assert!(
            !entry.is_resident(),
            "{:#X} is already resident",
            entry.upage
        );
        entry.residency = Residency::Resident(frame);
    }

    /// Records that a resident page was dropped without being written to swap.
    pub fn mark_unloaded(&mut self, id: SpteId) {
        let entry = self.get_mut(id);
        assert!(
            entry.is_resident(),
            "unloading {:#X}, which is not resident",
            entry.upage
        );
        entry.residency = Residency::NotLoaded;
    }

    /// Removes an entry. Its identifier, and any copy of it, goes stale.
    pub fn remove(&mut self, id: SpteId) -> Option<Spte> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.by_page.remove(&entry.upage);
        if matches!(entry.origin, Origin::ZeroStack) {
            self.stack_pages -= 1;
        }
        Some(entry)
    }

    /// Removes every entry, in address order.
    pub fn drain(&mut self) -> Vec<Spte> {
        let ids: Vec<SpteId> = self.by_page.values().copied().collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpteId, &Spte)> + '_ {
        self.by_page
            .values()
            .filter_map(|&id| Some((id, self.get(id)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use proptest::prelude::*;

    fn file() -> Arc<dyn VmFile> {
        Arc::new(vec![0u8; 2 * PAGE_FRAME_SIZE])
    }

    #[test]
    fn register_and_lookup() {
        let mut spt = SupplementalPageTable::new(4);
        let id = spt
            .register_file_backed(0x8000, file(), 0, 1200, 2896, false)
            .unwrap();
        let (found, entry) = spt.lookup(0x8ABC).unwrap();
        assert_eq!(found, id);
        assert_eq!(entry.pid(), 4);
        assert_eq!(entry.upage(), 0x8000);
        assert!(!entry.writable());
        assert_eq!(entry.residency(), Residency::NotLoaded);
        assert!(spt.lookup(0x9000).is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut spt = SupplementalPageTable::new(1);
        spt.register_zero_stack(0x7000_0000).unwrap();
        assert_eq!(
            spt.register_zero_stack(0x7000_0000),
            Err(VmError::DuplicatePage(0x7000_0000))
        );
        assert_eq!(
            spt.register_file_backed(0x7000_0000, file(), 0, 0, PAGE_FRAME_SIZE, true)
                .err(),
            Some(VmError::DuplicatePage(0x7000_0000))
        );
        assert_eq!(spt.len(), 1);
        assert_eq!(spt.stack_pages(), 1);
    }

    #[test]
    fn residency_transitions() {
        let mut spt = SupplementalPageTable::new(1);
        let id = spt.register_zero_stack(0x1000).unwrap();
        spt.mark_resident(id, FrameNumber(3));
        assert_eq!(spt.get(id).unwrap().residency(), Residency::Resident(FrameNumber(3)));
        spt.mark_swapped(id, SwapSlot::new(0));
        assert!(spt.get(id).unwrap().is_swapped());
        spt.mark_resident(id, FrameNumber(1));
        spt.mark_unloaded(id);
        assert_eq!(spt.get(id).unwrap().residency(), Residency::NotLoaded);
    }

    #[test]
    #[should_panic]
    fn swapping_a_non_resident_page_panics() {
        let mut spt = SupplementalPageTable::new(1);
        let id = spt.register_zero_stack(0x1000).unwrap();
        spt.mark_swapped(id, SwapSlot::new(0));
    }

    #[test]
    fn removed_ids_go_stale() {
        let mut spt = SupplementalPageTable::new(1);
        let old = spt.register_zero_stack(0x1000).unwrap();
        assert!(spt.remove(old).is_some());
        assert_eq!(spt.stack_pages(), 0);

        let new = spt.register_zero_stack(0x2000).unwrap();
        assert_ne!(old, new);
        assert!(spt.get(old).is_none());
        assert!(spt.remove(old).is_none());
        assert_eq!(spt.get(new).unwrap().upage(), 0x2000);
    }

    #[test]
    fn drain_empties_the_table() {
        let mut spt = SupplementalPageTable::new(1);
        spt.register_zero_stack(0x3000).unwrap();
        spt.register_file_backed(0x1000, file(), 0, PAGE_FRAME_SIZE, 0, true)
            .unwrap();
        let drained = spt.drain();
        assert_eq!(
            drained.iter().map(Spte::upage).collect::<Vec<_>>(),
            [0x1000, 0x3000]
        );
        assert!(spt.is_empty());
        assert_eq!(spt.stack_pages(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Register(usize),
        Load(usize),
        SwapOut(usize),
        Drop(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        let page = 0usize..8;
        prop_oneof![
            page.clone().prop_map(Op::Register),
            page.clone().prop_map(Op::Load),
            page.clone().prop_map(Op::SwapOut),
            page.clone().prop_map(Op::Drop),
            page.prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn never_resident_and_swapped(ops in proptest::collection::vec(op(), 0..64)) {
            let mut spt = SupplementalPageTable::new(1);
            let mut next_slot = 0;
            for op in ops {
                match op {
                    Op::Register(page) => {
                        let _ = spt.register_zero_stack(page * PAGE_FRAME_SIZE);
                    }
                    Op::Load(page) => {
                        if let Some((id, entry)) = spt.lookup(page * PAGE_FRAME_SIZE) {
                            if !entry.is_resident() {
                                spt.mark_resident(id, FrameNumber(page));
                            }
                        }
                    }
                    Op::SwapOut(page) => {
                        if let Some((id, entry)) = spt.lookup(page * PAGE_FRAME_SIZE) {
                            if entry.is_resident() {
                                spt.mark_swapped(id, SwapSlot::new(next_slot));
                                next_slot += 1;
                            }
                        }
                    }
                    Op::Drop(page) => {
                        if let Some((id, entry)) = spt.lookup(page * PAGE_FRAME_SIZE) {
                            if entry.is_resident() {
                                spt.mark_unloaded(id);
                            }
                        }
                    }
                    Op::Remove(page) => {
                        if let Some((id, _)) = spt.lookup(page * PAGE_FRAME_SIZE) {
                            spt.remove(id);
                        }
                    }
                }
                for (_, entry) in spt.iter() {
                    prop_assert!(!(entry.is_resident() && entry.is_swapped()));
                }
                prop_assert_eq!(spt.iter().count(), spt.len());
                prop_assert_eq!(spt.stack_pages(), spt.len());
            }
        }
    }
}
