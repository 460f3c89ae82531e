//! ARM64 Page Table Management
//!
//! Implements 4-level page tables for the ARM64 VMSA (Virtual Memory System Architecture).
//!
//! # Page Table Structure (4KB granule)
//! - L0 (PGD): 512 entries, each covers 512GB
//! - L1 (PUD): 512 entries, each covers 1GB
//! - L2 (PMD): 512 entries, each covers 2MB
//! - L3 (PTE): 512 entries, each covers 4KB
//!
//! # Entry Format
//! Raw 64-bit descriptors are only read and written through
//! [`PageTableEntry::decode`] and [`Descriptor::encode`]. Everything above
//! this module works with [`Descriptor`] and [`MapFlags`].
//!
//! # Security Properties
//! - Kernel leaves are never executable from EL0 (UXN always set)
//! - User leaves are never executable from EL1 (PXN always set)
//! - Every leaf has the access flag set, so no access-flag faults

use core::fmt;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{
    level_entry_size, PhysAddr, VirtAddr, ENTRIES_PER_TABLE, L1_BLOCK_SIZE, L2_BLOCK_SIZE,
    LEVELS, PAGE_SIZE,
};

bitflags! {
    /// Descriptor bits for ARM64 translation table entries.
    ///
    /// The layout follows the ARMv8-A architecture reference manual.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageFlags: u64 {
        /// Entry is valid.
        const VALID = 1 << 0;
        /// Table descriptor at L0-L2, page descriptor at L3.
        /// Clear on a valid L1/L2 entry means block descriptor.
        const TABLE_OR_PAGE = 1 << 1;
        /// Attribute Index [4:2] = 1, selects the MAIR device slot.
        const ATTR_DEVICE = 1 << 2;
        /// Non-Secure bit [5].
        const NS = 1 << 5;
        /// AP[1] [6]: EL0 may access the page.
        const AP_EL0 = 1 << 6;
        /// AP[2] [7]: read-only at every level that may access the page.
        const AP_RO = 1 << 7;
        /// Shareability [9:8] = inner shareable.
        const SH_INNER = 0b11 << 8;
        /// Access Flag [10].
        const AF = 1 << 10;
        /// Not Global [11].
        const NG = 1 << 11;
        /// Contiguous hint [52].
        const CONTIGUOUS = 1 << 52;
        /// Privileged Execute Never [53].
        const PXN = 1 << 53;
        /// User Execute Never [54].
        const UXN = 1 << 54;
    }
}

bitflags! {
    /// Attributes requested for a mapping.
    ///
    /// These are the architecture-neutral axes callers choose from: target
    /// privilege, writability, executability and leaf granularity.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MapFlags: u64 {
        /// Readable. Every valid leaf is readable at its privilege level.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable at the mapping's privilege level only.
        const EXEC = 1 << 2;
        /// Kernel mapping; user (EL0) otherwise.
        const KERNEL = 1 << 3;
        /// Map with 1GB level-1 blocks.
        const L1_BLOCK = 1 << 4;
        /// Map with 2MB level-2 blocks.
        const L2_BLOCK = 1 << 5;

        /// Kernel text: read-only, executable at EL1.
        const KERNEL_CODE = Self::KERNEL.bits() | Self::READ.bits() | Self::EXEC.bits();
        /// Kernel data: read-write, never executable.
        const KERNEL_DATA = Self::KERNEL.bits() | Self::READ.bits() | Self::WRITE.bits();
        /// User text: read-only, executable at EL0.
        const USER_CODE = Self::READ.bits() | Self::EXEC.bits();
        /// User data: read-write, never executable.
        const USER_DATA = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MapFlags {
    /// Leaf size selected by these flags. A level-1 block wins over a
    /// level-2 block if both are requested.
    #[inline]
    pub const fn granularity(self) -> Granularity {
        if self.contains(Self::L1_BLOCK) {
            Granularity::L1Block
        } else if self.contains(Self::L2_BLOCK) {
            Granularity::L2Block
        } else {
            Granularity::Page
        }
    }

    /// The flags without any granularity request.
    #[inline]
    pub const fn permissions(self) -> Self {
        self.difference(Self::L1_BLOCK.union(Self::L2_BLOCK))
    }
}

/// Leaf size of a mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Granularity {
    /// 4KB page at level 3.
    Page,
    /// 2MB block at level 2.
    L2Block,
    /// 1GB block at level 1.
    L1Block,
}

impl Granularity {
    /// Bytes mapped by one leaf.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Page => PAGE_SIZE,
            Self::L2Block => L2_BLOCK_SIZE,
            Self::L1Block => L1_BLOCK_SIZE,
        }
    }

    /// Table level holding the leaf.
    #[inline]
    pub const fn level(self) -> usize {
        match self {
            Self::Page => 3,
            Self::L2Block => 2,
            Self::L1Block => 1,
        }
    }

    /// The [`MapFlags`] bit requesting this granularity.
    #[inline]
    pub const fn flag(self) -> MapFlags {
        match self {
            Self::Page => MapFlags::empty(),
            Self::L2Block => MapFlags::L2_BLOCK,
            Self::L1Block => MapFlags::L1_BLOCK,
        }
    }

    const fn of_block_level(level: usize) -> Self {
        match level {
            1 => Self::L1Block,
            2 => Self::L2Block,
            _ => panic!("block descriptors only exist at levels 1 and 2"),
        }
    }
}

/// Decoded form of a translation table entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Descriptor {
    /// No translation.
    Invalid,
    /// Points to the next level table (L0-L2).
    Table { next: PhysAddr },
    /// Maps a naturally aligned block directly (L1 or L2).
    Block {
        level: usize,
        addr: PhysAddr,
        attrs: MapFlags,
    },
    /// Maps a 4KB page (L3).
    Page { addr: PhysAddr, attrs: MapFlags },
}

impl Descriptor {
    /// Encode into a raw entry.
    ///
    /// # Panics
    /// Panics on a block descriptor outside levels 1-2.
    pub fn encode(self) -> PageTableEntry {
        let bits = match self {
            Self::Invalid => PageFlags::empty(),
            Self::Table { next } => {
                debug_assert!(next.is_aligned());
                PageFlags::from_bits_retain(next.as_u64() & PageTableEntry::ADDR_MASK)
                    | PageFlags::VALID
                    | PageFlags::TABLE_OR_PAGE
            }
            Self::Block { level, addr, attrs } => {
                let size = Granularity::of_block_level(level).size();
                debug_assert!(addr.offset_in(size) == 0);
                PageFlags::from_bits_retain(addr.as_u64() & PageTableEntry::ADDR_MASK)
                    | leaf_bits(attrs)
            }
            Self::Page { addr, attrs } => {
                debug_assert!(addr.is_aligned());
                PageFlags::from_bits_retain(addr.as_u64() & PageTableEntry::ADDR_MASK)
                    | leaf_bits(attrs)
                    | PageFlags::TABLE_OR_PAGE
            }
        };
        PageTableEntry(bits.bits())
    }

    /// Check if the descriptor translates anything.
    #[inline]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }

    /// Attributes of a leaf (block or page) descriptor.
    #[inline]
    pub const fn attributes(self) -> Option<MapFlags> {
        match self {
            Self::Block { attrs, .. } | Self::Page { attrs, .. } => Some(attrs),
            Self::Invalid | Self::Table { .. } => None,
        }
    }

    /// Physical address `va` resolves to through this leaf.
    ///
    /// Returns `None` for tables and invalid entries.
    pub fn output_address(self, va: VirtAddr) -> Option<PhysAddr> {
        match self {
            Self::Block { level, addr, .. } => {
                let size = Granularity::of_block_level(level).size();
                Some(addr.add(va.offset_in(size)))
            }
            Self::Page { addr, .. } => Some(addr.add(va.page_offset())),
            Self::Invalid | Self::Table { .. } => None,
        }
    }
}

/// Leaf descriptor bits for the requested attributes.
fn leaf_bits(attrs: MapFlags) -> PageFlags {
    let mut bits = PageFlags::VALID | PageFlags::AF | PageFlags::SH_INNER;
    if !attrs.contains(MapFlags::WRITE) {
        bits |= PageFlags::AP_RO;
    }
    if attrs.contains(MapFlags::KERNEL) {
        bits |= PageFlags::UXN;
        if !attrs.contains(MapFlags::EXEC) {
            bits |= PageFlags::PXN;
        }
    } else {
        bits |= PageFlags::AP_EL0 | PageFlags::PXN;
        if !attrs.contains(MapFlags::EXEC) {
            bits |= PageFlags::UXN;
        }
    }
    bits
}

/// Attributes carried by leaf descriptor bits. Valid leaves are always
/// readable at their privilege level.
fn leaf_attrs(bits: PageFlags) -> MapFlags {
    let mut attrs = MapFlags::READ;
    let kernel = !bits.contains(PageFlags::AP_EL0);
    if kernel {
        attrs |= MapFlags::KERNEL;
    }
    if !bits.contains(PageFlags::AP_RO) {
        attrs |= MapFlags::WRITE;
    }
    let execute_never = if kernel { PageFlags::PXN } else { PageFlags::UXN };
    if !bits.contains(execute_never) {
        attrs |= MapFlags::EXEC;
    }
    attrs
}

/// A single page table entry.
///
/// This is a 64-bit descriptor that either points to a next-level table
/// or maps a physical page/block to a virtual address.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Address mask for page table entries (bits [47:12]).
    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Check if the entry is valid (present).
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Interpret the entry as found in a table at `level`.
    ///
    /// # Panics
    /// Panics if `level` is not a valid translation level.
    pub fn decode(self, level: usize) -> Descriptor {
        assert!(level < LEVELS, "invalid page table level {}", level);
        let bits = PageFlags::from_bits_retain(self.0);
        if !bits.contains(PageFlags::VALID) {
            return Descriptor::Invalid;
        }

        let addr = PhysAddr::new((self.0 & Self::ADDR_MASK) as usize);
        match (level, bits.contains(PageFlags::TABLE_OR_PAGE)) {
            (3, true) => Descriptor::Page {
                addr,
                attrs: leaf_attrs(bits),
            },
            // Reserved encoding at L3, no blocks at L0
            (3, false) | (0, false) => Descriptor::Invalid,
            (_, true) => Descriptor::Table { next: addr },
            (_, false) => Descriptor::Block {
                level,
                addr: addr.align_down_to(level_entry_size(level)),
                attrs: leaf_attrs(bits) | Granularity::of_block_level(level).flag(),
            },
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(
                f,
                "PTE(addr={:#x}, flags={:?})",
                self.0 & Self::ADDR_MASK,
                PageFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
            )
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// A page table (one level of the 4-level hierarchy).
///
/// Each page table is 4KB and contains 512 entries.
/// The table must be 4KB aligned in physical memory.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all valid entries with their indices.
    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.is_valid())
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter_valid()).finish()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is not mapped.
    NotMapped,
    /// The virtual and physical address differ in their offset within
    /// the requested leaf size.
    MisalignedAddress,
    /// The range wraps around the end of the address space.
    AddressOverflow,
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
            Self::AddressOverflow => write!(f, "range overflows the address space"),
        }
    }
}
