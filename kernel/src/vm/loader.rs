use super::{address_space::AddressSpace, fault::install_page, file::VmFile};
use crate::error::VmError;
use crate::system::VmSystem;
use alloc::sync::Arc;
use kidneyos_shared::mem::{page_offset, page_round_down, page_round_up, OFFSET, PAGE_FRAME_SIZE};
use log::info;

/// A loadable segment of an executable, as found in its program header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSegment {
    pub file_offset: u64,
    pub vaddr: usize,
    pub file_size: usize,
    pub mem_size: usize,
    pub writable: bool,
}

impl LoadSegment {
    fn validate(&self, file: &dyn VmFile) -> Result<(), VmError> {
        // The segment must start at the same offset within a page in the file
        // and in memory, fit in the file, and lie in user space above page 0.
        let in_file = self
            .file_offset
            .checked_add(self.file_size as u64)
            .is_some_and(|end| end <= file.len());
        let end = self.vaddr.checked_add(self.mem_size);
        let ok = self.file_offset % PAGE_FRAME_SIZE as u64 == page_offset(self.vaddr) as u64
            && self.mem_size >= self.file_size
            && self.mem_size > 0
            && in_file
            && self.vaddr >= PAGE_FRAME_SIZE
            && end.is_some_and(|end| end <= OFFSET);
        if ok {
            Ok(())
        } else {
            Err(VmError::BadSegment)
        }
    }
}

/// Registers every page of `segment` to be loaded lazily from `file`.
///
/// Pages are split so that the first `file_size` bytes of the segment come
/// from the file and the rest of the last page, and any page past it, is zero.
pub fn load_segment(
    space: &AddressSpace,
    file: &Arc<dyn VmFile>,
    segment: &LoadSegment,
) -> Result<(), VmError> {
    segment.validate(&**file)?;

    let page_off = page_offset(segment.vaddr);
    let (read_bytes, zero_bytes) = if segment.file_size > 0 {
        let read_bytes = page_off + segment.file_size;
        (read_bytes, page_round_up(page_off + segment.mem_size) - read_bytes)
    } else {
        (0, page_round_up(page_off + segment.mem_size))
    };

    register_segment_pages(
        space,
        file,
        segment.file_offset - page_off as u64,
        page_round_down(segment.vaddr),
        read_bytes,
        zero_bytes,
        segment.writable,
    )
}

/// Registers `read_bytes + zero_bytes` worth of pages starting at `upage`, the
/// first `read_bytes` of which are read from `file` at `offset`.
pub fn register_segment_pages(
    space: &AddressSpace,
    file: &Arc<dyn VmFile>,
    mut offset: u64,
    mut upage: usize,
    mut read_bytes: usize,
    mut zero_bytes: usize,
    writable: bool,
) -> Result<(), VmError> {
    assert_eq!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE, 0);
    assert_eq!(page_offset(upage), 0);

    let mut spt = space.spt();
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
        let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

        spt.register_file_backed(
            upage,
            Arc::clone(file),
            offset,
            page_read_bytes,
            page_zero_bytes,
            writable,
        )?;

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        offset += page_read_bytes as u64;
        upage += PAGE_FRAME_SIZE;
    }
    Ok(())
}

/// Maps a zeroed page at the top of user memory and returns the initial
/// stack pointer.
pub fn setup_stack(system: &VmSystem, space: &Arc<AddressSpace>) -> Result<usize, VmError> {
    let upage = OFFSET - PAGE_FRAME_SIZE;
    let frame = system.acquire_frame(space, true)?;

    let mut spt = space.spt();
    let id = spt.register_zero_stack(upage)?;
    // Dirty from the start: the loader pushes arguments onto it.
    install_page(space, &mut spt, id, upage, true, frame, true)?;
    info!("process {} stack set up at {upage:#X}", space.pid());
    Ok(OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::spt::{Origin, Residency};
    use alloc::{vec, vec::Vec};

    fn file(len: usize) -> Arc<dyn VmFile> {
        Arc::new(vec![0u8; len])
    }

    fn splits(space: &AddressSpace) -> Vec<(usize, u64, usize, usize, bool)> {
        space
            .spt()
            .iter()
            .map(|(_, spte)| match spte.origin() {
                Origin::File {
                    offset,
                    read_bytes,
                    zero_bytes,
                    writable,
                    ..
                } => (spte.upage(), *offset, *read_bytes, *zero_bytes, *writable),
                Origin::ZeroStack => panic!("loader registered a stack page"),
            })
            .collect()
    }

    #[test]
    fn splits_unaligned_segment() {
        let space = AddressSpace::new(1);
        let segment = LoadSegment {
            file_offset: 0x1100,
            vaddr: 0x0804_8100,
            file_size: 0x1000,
            mem_size: 0x2000,
            writable: true,
        };
        load_segment(&space, &file(0x3000), &segment).unwrap();
        assert_eq!(
            splits(&space),
            [
                (0x0804_8000, 0x1000, 0x1000, 0, true),
                (0x0804_9000, 0x2000, 0x100, 0xF00, true),
                (0x0804_A000, 0x2100, 0, 0x1000, true),
            ]
        );
        for (_, spte) in space.spt().iter() {
            assert_eq!(spte.residency(), Residency::NotLoaded);
        }
    }

    #[test]
    fn bss_only_segment_is_all_zero() {
        let space = AddressSpace::new(1);
        let segment = LoadSegment {
            file_offset: 0,
            vaddr: 0x1000_0000,
            file_size: 0,
            mem_size: 10,
            writable: true,
        };
        load_segment(&space, &file(0), &segment).unwrap();
        assert_eq!(splits(&space), [(0x1000_0000, 0, 0, 0x1000, true)]);
    }

    #[test]
    fn rejects_bad_segments() {
        let space = AddressSpace::new(1);
        let file = file(0x2000);
        let good = LoadSegment {
            file_offset: 0,
            vaddr: 0x1000,
            file_size: 0x10,
            mem_size: 0x10,
            writable: false,
        };
        for bad in [
            LoadSegment { vaddr: 0x1004, ..good },
            LoadSegment { mem_size: 0x8, ..good },
            LoadSegment { file_size: 0, mem_size: 0, ..good },
            LoadSegment { vaddr: 0, ..good },
            LoadSegment { vaddr: OFFSET - 0x1000, mem_size: 0x2000, ..good },
            LoadSegment { file_size: 0x3000, mem_size: 0x3000, ..good },
        ] {
            assert_eq!(load_segment(&space, &file, &bad), Err(VmError::BadSegment));
        }
        assert!(space.spt().is_empty());
        load_segment(&space, &file, &good).unwrap();
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let space = AddressSpace::new(1);
        let file = file(0x2000);
        let segment = LoadSegment {
            file_offset: 0,
            vaddr: 0x1000,
            file_size: 0x1000,
            mem_size: 0x1000,
            writable: false,
        };
        load_segment(&space, &file, &segment).unwrap();
        assert_eq!(
            load_segment(&space, &file, &segment),
            Err(VmError::DuplicatePage(0x1000))
        );
    }
}
