//! Per-process virtual memory: the supplemental page table and everything that
//! populates it.

pub mod address_space;
pub mod fault;
pub mod file;
pub mod loader;
pub mod spt;
pub mod user;


pub use address_space::{AddressSpace, Pid};
pub use fault::{handle_page_fault, PageFault};
pub use file::VmFile;
pub use loader::{load_segment, setup_stack, LoadSegment};
pub use spt::{Origin, Residency, Spte, SpteId, SupplementalPageTable};
pub use user::{check_user_range, copy_from_user, copy_to_user};
