// https://wiki.osdev.org/Paging
// https://wiki.osdev.org/Setting_Up_Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{is_kernel_address, page_round_down, PAGE_FRAME_SIZE};
use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

const PAGE_DIRECTORY_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageDirectoryEntry>();

#[repr(align(4096))]
pub struct PageDirectory(pub [PageDirectoryEntry; PAGE_DIRECTORY_LEN]);

impl Default for PageDirectory {
    fn default() -> Self {
        Self([PageDirectoryEntry::default(); PAGE_DIRECTORY_LEN])
    }
}

impl Deref for PageDirectory {
    type Target = [PageDirectoryEntry; PAGE_DIRECTORY_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageDirectory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(7, rw)]
    page_size: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::default(); PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    fn indices(self) -> (usize, usize) {
        (
            self.page_directory_index().value().into(),
            self.page_table_index().value().into(),
        )
    }
}

/// The user half of one process's two-level page table.
///
/// Page tables are owned by the manager and indexed by their directory slot,
/// so a directory entry's `page_table_address` records that slot rather than
/// a physical address. Frames are named by frame number.
pub struct PageManager {
    directory: Box<PageDirectory>,
    tables: Vec<Option<Box<PageTable>>>,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(PAGE_DIRECTORY_LEN);
        tables.resize_with(PAGE_DIRECTORY_LEN, || None);
        Self {
            directory: Box::default(),
            tables,
        }
    }

    fn split(vaddr: usize) -> (usize, usize) {
        assert!(
            !is_kernel_address(vaddr),
            "{vaddr:#X} is not a user address"
        );
        VirtualAddress::new_with_raw_value(vaddr as u32).indices()
    }

    fn entry(&self, vaddr: usize) -> Option<&PageTableEntry> {
        let (dir, idx) = Self::split(vaddr);
        if !self.directory[dir].present() {
            return None;
        }
        let entry = &self.tables[dir].as_ref()?[idx];
        entry.present().then_some(entry)
    }

    fn entry_mut(&mut self, vaddr: usize) -> Option<&mut PageTableEntry> {
        let (dir, idx) = Self::split(vaddr);
        if !self.directory[dir].present() {
            return None;
        }
        let entry = &mut self.tables[dir].as_mut()?[idx];
        if entry.present() {
            Some(entry)
        } else {
            None
        }
    }

    /// Maps the page containing `vaddr` to `frame`.
    ///
    /// Returns `false` without changing anything if the page is already mapped.
    #[must_use]
    pub fn map(&mut self, vaddr: usize, frame: usize, writable: bool) -> bool {
        let (dir, idx) = Self::split(page_round_down(vaddr));
        if !self.directory[dir].present() {
            self.tables[dir] = Some(Box::default());
            self.directory[dir] = PageDirectoryEntry::default()
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true)
                .with_page_table_address(u20::new(dir as u32));
        }
        let Some(table) = self.tables[dir].as_mut() else {
            return false;
        };
        if table[idx].present() {
            return false;
        }
        table[idx] = PageTableEntry::default()
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(frame as u32));
        true
    }

    /// Unmaps the page containing `vaddr`, returning the frame it was mapped to.
    pub fn unmap(&mut self, vaddr: usize) -> Option<usize> {
        let entry = self.entry_mut(vaddr)?;
        let frame = entry.page_frame_address().value() as usize;
        *entry = PageTableEntry::default();
        Some(frame)
    }

    /// Frame number the page containing `vaddr` is mapped to.
    pub fn translate(&self, vaddr: usize) -> Option<usize> {
        self.entry(vaddr)
            .map(|entry| entry.page_frame_address().value() as usize)
    }

    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some()
    }

    pub fn is_range_mapped(&self, start: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = start.checked_add(len) else {
            return false;
        };
        (page_round_down(start)..end)
            .step_by(PAGE_FRAME_SIZE)
            .all(|page| !is_kernel_address(page) && self.is_mapped(page))
    }

    pub fn is_writable(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.read_write())
    }

    pub fn is_dirty(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.dirty())
    }

    pub fn set_dirty(&mut self, vaddr: usize, dirty: bool) {
        if let Some(entry) = self.entry_mut(vaddr) {
            *entry = entry.with_dirty(dirty);
        }
    }

    pub fn is_accessed(&self, vaddr: usize) -> bool {
        self.entry(vaddr).is_some_and(|entry| entry.accessed())
    }

    pub fn set_accessed(&mut self, vaddr: usize, accessed: bool) {
        if let Some(entry) = self.entry_mut(vaddr) {
            *entry = entry.with_accessed(accessed);
        }
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.tables
            .iter()
            .flatten()
            .map(|table| table.iter().filter(|entry| entry.present()).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_unmap() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x0804_8123, 7, false));
        assert_eq!(pm.translate(0x0804_8000), Some(7));
        assert_eq!(pm.translate(0x0804_8fff), Some(7));
        assert!(!pm.is_writable(0x0804_8000));
        // Already mapped.
        assert!(!pm.map(0x0804_8000, 9, true));
        assert_eq!(pm.translate(0x0804_8000), Some(7));

        assert_eq!(pm.unmap(0x0804_8000), Some(7));
        assert_eq!(pm.translate(0x0804_8000), None);
        assert_eq!(pm.unmap(0x0804_8000), None);
        assert_eq!(pm.mapped_pages(), 0);
    }

    #[test]
    fn hardware_bits() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x1000, 1, true));
        assert!(!pm.is_dirty(0x1000));
        assert!(!pm.is_accessed(0x1000));
        pm.set_dirty(0x1000, true);
        pm.set_accessed(0x1000, true);
        assert!(pm.is_dirty(0x1000));
        assert!(pm.is_accessed(0x1000));
        pm.set_accessed(0x1000, false);
        assert!(!pm.is_accessed(0x1000));
        // Remapping starts with clear bits.
        pm.unmap(0x1000);
        assert!(pm.map(0x1000, 2, true));
        assert!(!pm.is_dirty(0x1000));
    }

    #[test]
    fn ranges() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x1000, 1, true));
        assert!(pm.map(0x2000, 2, true));
        assert!(pm.is_range_mapped(0x1ff0, 0x20));
        assert!(!pm.is_range_mapped(0x2ff0, 0x20));
        assert!(pm.is_range_mapped(0x5000, 0));
        assert!(!pm.is_range_mapped(usize::MAX, 2));
        assert_eq!(pm.mapped_pages(), 2);
    }

    #[test]
    #[should_panic]
    fn kernel_addresses_are_not_mappable() {
        let mut pm = PageManager::new();
        let _ = pm.map(crate::mem::OFFSET, 1, true);
    }
}
