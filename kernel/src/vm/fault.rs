//! Page fault resolution.
//!
//! A fault on a user address is resolved by growing the stack, restoring the
//! page from swap or loading it from its file. Anything else kills the process.
//!
//! The faulting process's supplemental page table is never locked while a frame
//! is being acquired: acquisition may evict, and the victim may belong to the
//! faulting process itself. The table is consulted first, the frame acquired
//! and filled, and the table locked again to install the page, checking that
//! nothing changed in between.

use super::{
    address_space::AddressSpace,
    spt::{Origin, Residency, SpteId, SupplementalPageTable},
};
use crate::config::VmConfig;
use crate::error::{Killed, VmError};
use crate::mem::PinnedFrame;
use crate::swapping::SwapSlot;
use crate::system::VmSystem;
use alloc::sync::Arc;
use kidneyos_shared::mem::{is_kernel_address, page_round_down, OFFSET, PAGE_FRAME_SIZE};
use log::debug;

/// What the trap handler knows about a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address.
    pub addr: usize,
    /// User stack pointer at the time of the fault.
    pub esp: usize,
    pub write: bool,
}

enum Plan {
    GrowStack,
    SwapIn { id: SpteId, slot: SwapSlot, writable: bool },
    Load { id: SpteId, origin: Origin },
}

/// Resolves a page fault taken by the process owning `space`.
///
/// On failure the process has been killed, and the caller must not return to
/// user mode.
pub fn handle_page_fault(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    fault: PageFault,
) -> Result<(), Killed> {
    resolve(system, space, fault).map_err(|reason| system.kill(space, reason))
}

/// Whether a fault at `addr` with stack pointer `esp` looks like the stack
/// growing, e.g. through `push` or `pusha`. The address must also lie within
/// the largest stack the quota allows.
pub fn is_stack_access(config: &VmConfig, addr: usize, esp: usize) -> bool {
    (stack_bottom(config)..OFFSET).contains(&addr) && addr.saturating_add(config.stack_slack) >= esp
}

/// Lowest address the stack may grow down to.
fn stack_bottom(config: &VmConfig) -> usize {
    OFFSET.saturating_sub(config.max_stack_pages.saturating_mul(PAGE_FRAME_SIZE))
}

/// A push just below the stack pointer that would take the stack past its
/// largest size.
fn is_stack_overflow(config: &VmConfig, addr: usize, esp: usize) -> bool {
    addr < stack_bottom(config) && (esp.saturating_sub(config.stack_slack)..=esp).contains(&addr)
}

pub(crate) fn resolve(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    fault: PageFault,
) -> Result<(), VmError> {
    let PageFault { addr, esp, write } = fault;
    if addr == 0 || is_kernel_address(addr) {
        return Err(VmError::IllegalAccess(addr));
    }
    let upage = page_round_down(addr);

    let plan = {
        let spt = space.spt();
        match spt.lookup(upage) {
            None => Plan::GrowStack,
            Some((id, spte)) => {
                if write && !spte.writable() {
                    return Err(VmError::ReadOnlyWrite(addr));
                }
                match spte.residency() {
                    // Someone else got here first.
                    Residency::Resident(_) => return Ok(()),
                    Residency::Swapped(slot) => Plan::SwapIn {
                        id,
                        slot,
                        writable: spte.writable(),
                    },
                    Residency::NotLoaded => Plan::Load {
                        id,
                        origin: spte.origin().clone(),
                    },
                }
            }
        }
    };

    match plan {
        Plan::GrowStack => grow_stack(system, space, addr, esp),
        Plan::SwapIn { id, slot, writable } => swap_in(system, space, id, upage, slot, writable),
        Plan::Load { id, origin } => load(system, space, id, upage, origin),
    }
}

fn grow_stack(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    addr: usize,
    esp: usize,
) -> Result<(), VmError> {
    let config = system.config();
    if is_stack_overflow(config, addr, esp) {
        return Err(VmError::StackQuotaExceeded(config.max_stack_pages));
    }
    if !is_stack_access(config, addr, esp) {
        return Err(VmError::IllegalAccess(addr));
    }
    check_stack_quota(config, &space.spt())?;

    let frame = system.acquire_frame(space, true)?;
    let upage = page_round_down(addr);
    let mut spt = space.spt();
    if spt.lookup(upage).is_some() {
        return Ok(());
    }
    check_stack_quota(config, &spt)?;
    let id = spt.register_zero_stack(upage)?;
    debug!("process {} stack grew to {upage:#X}", space.pid());
    install_page(space, &mut spt, id, upage, true, frame, false)
}

fn check_stack_quota(config: &VmConfig, spt: &SupplementalPageTable) -> Result<(), VmError> {
    if spt.stack_pages() >= config.max_stack_pages {
        return Err(VmError::StackQuotaExceeded(config.max_stack_pages));
    }
    Ok(())
}

fn swap_in(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    id: SpteId,
    upage: usize,
    slot: SwapSlot,
    writable: bool,
) -> Result<(), VmError> {
    let mut frame = system.acquire_frame(space, false)?;
    let mut spt = space.spt();
    if spt.get(id).map(|spte| spte.residency()) != Some(Residency::Swapped(slot)) {
        return Ok(());
    }
    if let Err(err) = system.swap().swap_in(slot, &mut frame) {
        panic!("swap subsystem failure: {err}");
    }
    // Its slot is gone, so the page must go back to swap if evicted again.
    install_page(space, &mut spt, id, upage, writable, frame, writable)
}

fn load(
    system: &VmSystem,
    space: &Arc<AddressSpace>,
    id: SpteId,
    upage: usize,
    origin: Origin,
) -> Result<(), VmError> {
    let (read_bytes, writable) = match &origin {
        Origin::File {
            read_bytes,
            writable,
            ..
        } => (*read_bytes, *writable),
        Origin::ZeroStack => (0, true),
    };
    // Taken before the frame, so nobody waits for the lock while pinning a frame
    // its holder might need.
    let file_guard = if read_bytes > 0 {
        system.file_lock().lock_unless_held(space.tid())
    } else {
        None
    };
    let mut frame = system.acquire_frame(space, read_bytes == 0)?;

    if let Origin::File { file, offset, .. } = &origin {
        if read_bytes > 0 {
            let bytes = frame.bytes_mut();
            let read = file.read_at(*offset, &mut bytes[..read_bytes]);
            if read != read_bytes {
                return Err(VmError::ShortRead {
                    expected: read_bytes,
                    actual: read,
                });
            }
            bytes[read_bytes..].fill(0);
        }
    }
    drop(file_guard);

    let mut spt = space.spt();
    if spt.get(id).map(|spte| spte.residency()) != Some(Residency::NotLoaded) {
        return Ok(());
    }
    install_page(space, &mut spt, id, upage, writable, frame, false)
}

/// Maps `frame` at `upage`, records it as the home of `id` and unpins it.
///
/// Read-only pages are always installed clean.
pub(crate) fn install_page(
    space: &AddressSpace,
    spt: &mut SupplementalPageTable,
    id: SpteId,
    upage: usize,
    writable: bool,
    frame: PinnedFrame<'_>,
    dirty: bool,
) -> Result<(), VmError> {
    let number = frame.number();
    {
        let mut page_manager = space.page_manager();
        if !page_manager.map(upage, number.index(), writable) {
            return Err(VmError::AlreadyMapped(upage));
        }
        page_manager.set_dirty(upage, dirty && writable);
    }
    spt.mark_resident(id, number);
    frame.bind(id, upage);
    debug!(
        "process {} page {upage:#X} now in frame {}",
        space.pid(),
        number.index()
    );
    Ok(())
}
