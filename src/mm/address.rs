//! Physical and Virtual Address Types
//!
//! Type-safe wrappers for memory addresses that prevent mixing
//! physical and virtual addresses at compile time, plus the
//! translation-granule constants shared by the allocator and the
//! page table code.
//!
//! # Translation Regime (4KB granule, 48-bit VA)
//! ```text
//! | 47-39 | 38-30 | 29-21 | 20-12 | 11-0   |
//! |  L0   |  L1   |  L2   |  L3   | offset |
//! ```

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table (512 for 4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of translation levels (L0..=L3).
pub const LEVELS: usize = 4;

/// Index bits consumed by each level.
const INDEX_BITS: usize = 9;

/// Bits [47:0] of a virtual address; the rest select the translation root.
const VA_MASK: usize = (1 << 48) - 1;

/// Size of the region mapped by a level-1 block descriptor (1 GiB).
pub const L1_BLOCK_SIZE: usize = 1 << 30;
/// Size of the region mapped by a level-2 block descriptor (2 MiB).
pub const L2_BLOCK_SIZE: usize = 1 << 21;

/// Kernel virtual address base (higher-half)
/// Using the highest 256TB of the 48-bit address space
pub const KERNEL_VIRT_BASE: usize = 0xFFFF_0000_0000_0000;

/// Physical memory base for QEMU virt machine
pub const PHYS_MEM_BASE: usize = 0x4000_0000;

/// Bytes of address space covered by one entry of a table at `level`.
///
/// Level 0 entries cover 512 GiB, level 3 entries a single page.
///
/// # Panics
/// Panics if `level` is not a valid translation level.
#[inline]
pub const fn level_entry_size(level: usize) -> usize {
    assert!(level < LEVELS, "invalid page table level");
    1 << (PAGE_SHIFT + INDEX_BITS * (LEVELS - 1 - level))
}

/// A physical memory address.
///
/// This is a newtype wrapper that prevents accidental mixing of
/// physical and virtual addresses. Physical addresses cannot be
/// directly dereferenced - they must be mapped to virtual addresses first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    ///
    /// # Panics
    /// Panics in debug mode if the address uses more than 48 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        // ARM64 with 48-bit physical addressing
        debug_assert!(addr <= 0x0000_FFFF_FFFF_FFFF);
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Get the raw address as u64 (for page table entries).
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to a power-of-two boundary.
    #[inline]
    pub const fn align_down_to(self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Offset of this address within a power-of-two sized region.
    #[inline]
    pub const fn offset_in(self, align: usize) -> usize {
        self.0 & (align - 1)
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A virtual memory address.
///
/// ARM64 splits the 64-bit space between two translation roots: bits
/// [63:48] are all zeros for TTBR0 (user) addresses and all ones for
/// TTBR1 (kernel) addresses. Any other value faults on access.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address.
    ///
    /// # Panics
    /// Panics in debug mode if bits [63:48] are neither all zeros nor all
    /// ones.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        debug_assert!(Self::is_canonical(addr), "non-canonical virtual address");
        Self(addr)
    }

    /// Whether `addr` selects one of the two translation roots.
    #[inline]
    pub const fn is_canonical(addr: usize) -> bool {
        let top = addr & !VA_MASK;
        top == 0 || top == !VA_MASK
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Get the raw address as u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to a power-of-two boundary.
    #[inline]
    pub const fn align_down_to(self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Offset of this address within a power-of-two sized region.
    #[inline]
    pub const fn offset_in(self, align: usize) -> usize {
        self.0 & (align - 1)
    }

    /// Index into the page table at `level` selected by this address.
    ///
    /// # Panics
    /// Panics if `level` is not a valid translation level.
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        assert!(level < LEVELS, "invalid page table level");
        let shift = PAGE_SHIFT + INDEX_BITS * (LEVELS - 1 - level);
        (self.0 >> shift) & (ENTRIES_PER_TABLE - 1)
    }

    /// Get the page table indices for this address.
    ///
    /// Returns (L0, L1, L2, L3) indices for 4-level paging.
    #[inline]
    pub const fn page_table_indices(self) -> (usize, usize, usize, usize) {
        (
            self.table_index(0),
            self.table_index(1),
            self.table_index(2),
            self.table_index(3),
        )
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add an offset to this address, wrapping at the top of the space.
    ///
    /// The upper bits are carried along unchanged by the addition, so a
    /// cursor stepped past the end of a range may be non-canonical.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Add an offset, returning `None` if the raw value overflows.
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Check if this is a kernel address (higher-half).
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_VIRT_BASE
    }

    /// Convert to a mutable raw pointer.
    ///
    /// # Safety
    /// The caller must ensure the address is valid, properly mapped,
    /// and that mutable access is safe.
    #[inline]
    pub const unsafe fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Convert a kernel virtual address to its corresponding physical address.
///
/// This only works for addresses in the direct-mapped kernel region.
#[inline]
pub const fn kernel_virt_to_phys(virt: VirtAddr) -> PhysAddr {
    debug_assert!(virt.is_kernel());
    PhysAddr::new(virt.as_usize() - KERNEL_VIRT_BASE + PHYS_MEM_BASE)
}

/// Convert a physical address to its kernel virtual address.
///
/// This creates an address in the direct-mapped kernel region.
#[inline]
pub const fn phys_to_kernel_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_usize() - PHYS_MEM_BASE + KERNEL_VIRT_BASE)
}
