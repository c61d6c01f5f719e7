//! Access to user memory from system calls.
//!
//! A user buffer handed to a system call may be swapped out or not loaded yet,
//! so instead of rejecting unmapped pages these helpers fault them in, the same
//! way the trap handler would. Pages are pinned while the kernel copies to or
//! from them.

use super::{
    address_space::AddressSpace,
    fault::{resolve, PageFault},
};
use crate::error::{Killed, VmError};
use crate::mem::{FrameNumber, PinnedFrame};
use crate::system::VmSystem;
use alloc::sync::Arc;
use core::ops::Range;
use kidneyos_shared::mem::{page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE};

/// Checks that `[addr, addr + len)` is valid user memory, loading any page of it
/// that is not resident.
///
/// Kills the process if the range touches the null pointer or kernel memory,
/// or any page of it cannot be faulted in.
pub fn check_user_range(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    len: usize,
    esp: usize,
    write: bool,
) -> Result<(), Killed> {
    for_each_user_page(system, space, addr, len, esp, write, |_, _, _| {})
}

/// Copies `buf.len()` bytes from user address `src` into `buf`.
pub fn copy_from_user(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    src: usize,
    buf: &mut [u8],
    esp: usize,
) -> Result<(), Killed> {
    for_each_user_page(system, space, src, buf.len(), esp, false, |frame, page, chunk| {
        buf[chunk].copy_from_slice(&frame.bytes()[page]);
    })
}

/// Copies `data` to user address `dst`.
pub fn copy_to_user(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    dst: usize,
    data: &[u8],
    esp: usize,
) -> Result<(), Killed> {
    for_each_user_page(system, space, dst, data.len(), esp, true, |frame, page, chunk| {
        frame.bytes_mut()[page].copy_from_slice(&data[chunk]);
    })
}

/// Calls `f` with each page of `[addr, addr + len)` pinned, the byte range of the
/// page that falls in the user range, and the matching range relative to `addr`.
#[allow(clippy::too_many_arguments)]
fn for_each_user_page(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    len: usize,
    esp: usize,
    write: bool,
    mut f: impl FnMut(&mut PinnedFrame<'_>, Range<usize>, Range<usize>),
) -> Result<(), Killed> {
    if len == 0 {
        return Ok(());
    }
    let kill = |reason: VmError| system.kill(space, reason);
    let end = addr
        .checked_add(len)
        .filter(|&end| addr != 0 && end <= OFFSET)
        .ok_or_else(|| kill(VmError::IllegalAccess(addr)))?;

    let mut cur = addr;
    while cur < end {
        let chunk_end = end.min(page_round_down(cur) + PAGE_FRAME_SIZE);
        let mut frame = pin_user_page(system, space, cur, esp, write).map_err(kill)?;
        let page = page_offset(cur)..page_offset(cur) + (chunk_end - cur);
        f(&mut frame, page, cur - addr..chunk_end - addr);
        cur = chunk_end;
    }
    Ok(())
}

/// Pins the frame backing the page containing `addr`, faulting it in first if
/// needed, and marks it accessed (and dirty, for writes) as the MMU would.
fn pin_user_page<'a>(
    system: &'a VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    esp: usize,
    write: bool,
) -> Result<PinnedFrame<'a>, VmError> {
    let upage = page_round_down(addr);
    loop {
        let mapping = {
            let page_manager = space.page_manager();
            page_manager
                .translate(upage)
                .map(|frame| (frame, page_manager.is_writable(upage)))
        };

        match mapping {
            None => resolve(system, space, PageFault { addr, esp, write })?,
            Some((_, false)) if write => return Err(VmError::ReadOnlyWrite(addr)),
            Some((frame, _)) => {
                // The frame may be mid-eviction, or already reused by the time
                // it is pinned; only trust a pin that still matches the mapping.
                if let Some(pinned) =
                    system
                        .frames()
                        .try_pin(FrameNumber(frame), space.pid(), upage)
                {
                    let mut page_manager = space.page_manager();
                    if page_manager.translate(upage) == Some(frame) {
                        page_manager.set_accessed(upage, true);
                        if write {
                            page_manager.set_dirty(upage, true);
                        }
                        return Ok(pinned);
                    }
                }
                core::hint::spin_loop();
            }
        }
    }
}
