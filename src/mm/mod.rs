//! Memory management module for PantherOS
//!
//! Provides:
//! - Physical page management (buddy zone)
//! - Frame sources for page table pages
//! - ARM64 translation table encoding and management
//!
//! # Security Principles
//! - All page indices and table levels are bounds-checked
//! - Table pages are zeroed before they are linked
//! - Unsafe code is minimal and audited

pub mod address;
pub mod buddy;
pub mod frame;
pub mod mapper;
pub mod paging;

pub use address::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use buddy::{AllocError, Page, PageIdx, PageState, Zone, DEFAULT_MAX_ORDER};
pub use frame::{FrameAllocator, LockedZone};
#[cfg(target_arch = "aarch64")]
pub use mapper::Aarch64Mmu;
pub use mapper::{set_active, KernelLinearMap, Mmu, PageTableManager, PhysMap, Walk};
pub use paging::{
    Descriptor, Granularity, MapFlags, MappingError, PageFlags, PageTable, PageTableEntry,
};
