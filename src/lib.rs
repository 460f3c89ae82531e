//! PantherOS Memory Management Core
//!
//! Physical page allocation and ARM64 translation tables for the
//! PantherOS microkernel.
//!
//! # Components
//! - Buddy allocator over a contiguous zone of 4KB frames
//! - 4-level VMSA page tables with 4KB pages, 2MB and 1GB blocks
//! - Typed physical/virtual addresses
//!
//! # Security Features
//! - Descriptors are built from a closed sum type, never from loose bits
//! - User mappings are never executable at EL1
//! - Kernel mappings are never executable at EL0
//! - TLB invalidation after every mapping change
//!
//! # Architecture
//! - Target: AArch64 (ARM64), 48-bit virtual addresses
//! - Host builds run the unit tests against host memory

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod mm;

pub use mm::address::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use mm::buddy::{AllocError, Zone};
pub use mm::mapper::{PageTableManager, PhysMap};
pub use mm::paging::{Descriptor, MapFlags, MappingError};
