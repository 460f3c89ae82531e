//! Page Table Mapper
//!
//! High-level API for managing virtual memory mappings: walking and
//! building the 4-level table tree, translating addresses, and mapping or
//! unmapping ranges at page or block granularity.
//!
//! # Capabilities
//! The mapper needs two things it cannot do itself:
//! - [`PhysMap`]: reach a table page given its physical address
//! - [`Mmu`]: invalidate cached translations and install a root table
//!
//! # Security Properties
//! - Every `map`/`unmap` ends with a cluster-wide TLB invalidation, so no
//!   processor keeps using a stale translation after the call returns
//! - New table pages are zeroed before they are linked into the tree
//! - The mapper validates its inputs before modifying page tables

use log::{debug, trace, warn};

use super::address::{
    kernel_virt_to_phys, level_entry_size, phys_to_kernel_virt, PhysAddr, VirtAddr, LEVELS,
    PAGE_SIZE,
};
use super::frame::FrameAllocator;
use super::paging::{Descriptor, Granularity, MapFlags, MappingError, PageTable, PageTableEntry};

/// Converts between physical addresses and the kernel virtual addresses
/// through which that memory is reachable.
pub trait PhysMap {
    /// Kernel virtual address of a physical address.
    fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr;

    /// Physical address behind a kernel virtual address.
    fn virt_to_phys(&self, va: VirtAddr) -> PhysAddr;
}

/// The kernel's direct map of physical memory at [`KERNEL_VIRT_BASE`](super::address::KERNEL_VIRT_BASE).
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelLinearMap;

impl PhysMap for KernelLinearMap {
    #[inline]
    fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr {
        phys_to_kernel_virt(pa)
    }

    #[inline]
    fn virt_to_phys(&self, va: VirtAddr) -> PhysAddr {
        kernel_virt_to_phys(va)
    }
}

/// Translation hardware operations.
pub trait Mmu {
    /// Invalidate all cached translations on every processor and wait for
    /// the invalidation to complete.
    fn flush_tlb_all(&self);

    /// Install `root` as the active translation table.
    ///
    /// # Safety
    /// `root` must be the physical address of a valid level-0 table that
    /// maps everything the running code needs.
    unsafe fn set_root(&self, root: PhysAddr);
}

/// The AArch64 EL1 translation regime (TTBR0_EL1, inner-shareable TLBI).
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Aarch64Mmu;

#[cfg(target_arch = "aarch64")]
impl Mmu for Aarch64Mmu {
    #[inline]
    fn flush_tlb_all(&self) {
        // SAFETY: Invalidating the TLB only costs refills; it cannot break
        // a consistent translation table.
        unsafe {
            core::arch::asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb");
        }
    }

    #[inline]
    unsafe fn set_root(&self, root: PhysAddr) {
        // SAFETY: The caller guarantees `root` is a valid level-0 table.
        unsafe {
            core::arch::asm!(
                "msr ttbr0_el1, {root}",
                "isb",
                root = in(reg) root.as_u64(),
            );
        }
    }
}

/// Install the table at `table` as the current translation root.
///
/// # Safety
/// See [`Mmu::set_root`].
pub unsafe fn set_active<H: Mmu>(mmu: &H, table: PhysAddr) {
    debug!("mmu: switching root table to {}", table);
    // SAFETY: Forwarded from the caller.
    unsafe { mmu.set_root(table) }
}

/// Last byte of `[start, start + len)`.
///
/// The outer `None` means the range wraps past the top of the address
/// space; the inner `None` means the range is empty. A range may end
/// exactly at the top.
fn last_byte(start: usize, len: usize) -> Option<Option<usize>> {
    match len.checked_sub(1) {
        None => Some(None),
        Some(extent) => start.checked_add(extent).map(Some),
    }
}

/// Outcome of looking at one level of the tree.
#[derive(Debug)]
pub enum Walk<'t> {
    /// The entry points to a next-level table.
    Table(&'t mut PageTable),
    /// The entry is a level-1/level-2 block; translation stops here.
    Block(&'t mut PageTableEntry),
    /// The entry is a level-3 page.
    Page(&'t mut PageTableEntry),
    /// Nothing is mapped; the entry is returned for inspection.
    NoMapping(&'t mut PageTableEntry),
}

/// Handle to one translation table tree.
///
/// The manager performs no locking: callers hold the address-space lock
/// for the duration of each call.
pub struct PageTableManager<'m, P: PhysMap, H: Mmu> {
    root: VirtAddr,
    phys: &'m P,
    mmu: &'m H,
}

impl<'m, P: PhysMap, H: Mmu> PageTableManager<'m, P, H> {
    /// Manage the tree rooted at the level-0 table at `root`.
    ///
    /// # Safety
    /// - `root` must be a zeroed or valid level-0 table that nobody else
    ///   modifies while the manager exists
    /// - `phys` must describe the memory every table in the tree lives in
    pub unsafe fn new(root: VirtAddr, phys: &'m P, mmu: &'m H) -> Self {
        debug_assert!(root.is_aligned());
        Self { root, phys, mmu }
    }

    /// Allocate a fresh, empty root table from `alloc`.
    ///
    /// Returns `None` if no frame is available.
    ///
    /// # Safety
    /// Frames handed out by `alloc` must be exclusively owned memory that
    /// `phys` can translate.
    pub unsafe fn create<A: FrameAllocator>(alloc: &mut A, phys: &'m P, mmu: &'m H) -> Option<Self> {
        let root = alloc.allocate_frame()?;
        // SAFETY: The frame was just allocated so we have exclusive access.
        unsafe { (*root.as_mut_ptr::<PageTable>()).clear() };
        // SAFETY: Freshly zeroed table, contract forwarded from the caller.
        Some(unsafe { Self::new(root, phys, mmu) })
    }

    /// Kernel virtual address of the level-0 table.
    #[inline]
    pub fn root(&self) -> VirtAddr {
        self.root
    }

    /// Physical address of the level-0 table.
    #[inline]
    pub fn root_phys(&self) -> PhysAddr {
        self.phys.virt_to_phys(self.root)
    }

    /// Make this tree the active translation root.
    ///
    /// # Safety
    /// The tree must map everything the running code needs.
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded from the caller.
        unsafe { set_active(self.mmu, self.root_phys()) }
    }

    fn root_table<'t>(&self) -> &'t mut PageTable {
        // SAFETY: `new` requires the root to be a table we manage exclusively.
        unsafe { &mut *self.root.as_mut_ptr::<PageTable>() }
    }

    /// # Safety
    /// `pa` must be a table page of this tree.
    unsafe fn table_at<'t>(&self, pa: PhysAddr) -> &'t mut PageTable {
        // SAFETY: Forwarded from the caller; `phys` reaches all table pages.
        unsafe { &mut *self.phys.phys_to_virt(pa).as_mut_ptr::<PageTable>() }
    }

    /// Look at the entry for `va` in `table`, a table at `level`.
    ///
    /// With an allocator, a missing entry above level 3 gets a new zeroed
    /// table page; without one it is reported as [`Walk::NoMapping`].
    ///
    /// # Panics
    /// Panics on an invalid level, or if the allocator runs dry while a
    /// table page is needed.
    pub fn walk<'t>(
        &self,
        table: &'t mut PageTable,
        level: usize,
        va: VirtAddr,
        alloc: Option<&mut dyn FrameAllocator>,
    ) -> Walk<'t> {
        assert!(level < LEVELS, "walk: invalid page table level {}", level);
        let entry = &mut table[va.table_index(level)];

        let mut descriptor = entry.decode(level);
        if descriptor == Descriptor::Invalid {
            match alloc {
                Some(alloc) if level < LEVELS - 1 => {
                    let next = self.alloc_table(alloc);
                    descriptor = Descriptor::Table { next };
                    *entry = descriptor.encode();
                    trace!("walk: new level-{} table {} for {}", level + 1, next, va);
                }
                _ => return Walk::NoMapping(entry),
            }
        }

        match descriptor {
            // SAFETY: Table descriptors in this tree point at its own table pages.
            Descriptor::Table { next } => Walk::Table(unsafe { self.table_at(next) }),
            Descriptor::Block { .. } => Walk::Block(entry),
            Descriptor::Page { .. } => Walk::Page(entry),
            Descriptor::Invalid => Walk::NoMapping(entry),
        }
    }

    /// Allocate and zero a table page, returning its physical address.
    fn alloc_table(&self, alloc: &mut dyn FrameAllocator) -> PhysAddr {
        let Some(frame) = alloc.allocate_frame() else {
            panic!("page table: out of memory while allocating a table page");
        };
        // SAFETY: The frame was just allocated so we have exclusive access.
        unsafe { (*frame.as_mut_ptr::<PageTable>()).clear() };
        self.phys.virt_to_phys(frame)
    }

    /// Translate `va` to a physical address.
    ///
    /// Returns the address together with the leaf descriptor that maps it,
    /// which is a level-1/2 block or a level-3 page.
    pub fn translate(&self, va: VirtAddr) -> Result<(PhysAddr, Descriptor), MappingError> {
        let mut table = self.root_table();
        for level in 0..LEVELS {
            let entry = match self.walk(table, level, va, None) {
                Walk::Table(next) => {
                    table = next;
                    continue;
                }
                Walk::Block(entry) | Walk::Page(entry) => entry,
                Walk::NoMapping(_) => return Err(MappingError::NotMapped),
            };
            let descriptor = entry.decode(level);
            let pa = descriptor.output_address(va).ok_or(MappingError::NotMapped)?;
            return Ok((pa, descriptor));
        }
        Err(MappingError::NotMapped)
    }

    /// Map `[va, va + len)` to `[pa, pa + len)`.
    ///
    /// The granularity comes from `flags`. Both addresses are aligned down
    /// to it and the length grows by the same slack, so the mapping may
    /// cover more than requested at both ends.
    ///
    /// # Errors
    /// Rejects the request before touching any table if `va` and `pa` have
    /// different offsets within one leaf, or if the range overflows.
    ///
    /// # Panics
    /// Panics if the allocator runs dry or if a smaller mapping is requested
    /// inside an existing block. Entries written before that point stay.
    pub fn map<A: FrameAllocator>(
        &mut self,
        alloc: &mut A,
        va: VirtAddr,
        pa: PhysAddr,
        len: usize,
        flags: MapFlags,
    ) -> Result<(), MappingError> {
        let granularity = flags.granularity();
        let size = granularity.size();
        let slack = va.offset_in(size);
        if pa.offset_in(size) != slack {
            return Err(MappingError::MisalignedAddress);
        }
        let (Some(last), Some(_)) = (last_byte(va.as_usize(), len), last_byte(pa.as_usize(), len))
        else {
            return Err(MappingError::AddressOverflow);
        };

        debug!("map: {} -> {} ({:#x} bytes, {:?})", va, pa, len, flags);

        let attrs = flags.permissions();
        let mut va = va.align_down_to(size);
        let mut pa = pa.align_down_to(size);
        let leaves = match last {
            Some(last) => (last - va.as_usize()) / size + 1,
            None => usize::from(slack > 0),
        };
        for _ in 0..leaves {
            let entry = self.leaf_entry(&mut *alloc, va, granularity);
            *entry = match granularity {
                Granularity::Page => Descriptor::Page { addr: pa, attrs },
                Granularity::L2Block | Granularity::L1Block => Descriptor::Block {
                    level: granularity.level(),
                    addr: pa,
                    attrs: attrs | granularity.flag(),
                },
            }
            .encode();

            va = va.add(size);
            pa = pa.add(size);
        }

        self.mmu.flush_tlb_all();
        Ok(())
    }

    /// Walk down to the entry that holds the leaf for `va`, building
    /// missing tables on the way.
    fn leaf_entry<'t>(
        &self,
        alloc: &mut dyn FrameAllocator,
        va: VirtAddr,
        granularity: Granularity,
    ) -> &'t mut PageTableEntry {
        let leaf_level = granularity.level();
        let mut table = self.root_table();
        for level in 0..leaf_level {
            table = match self.walk(table, level, va, Some(&mut *alloc)) {
                Walk::Table(next) => next,
                Walk::Block(_) => {
                    panic!("map: {} lies inside an existing level-{} block", va, level)
                }
                Walk::Page(_) | Walk::NoMapping(_) => {
                    panic!("map: no table at level {} for {}", level, va)
                }
            };
        }

        let entry = &mut table[va.table_index(leaf_level)];
        if let Descriptor::Table { next } = entry.decode(leaf_level) {
            warn!(
                "map: level-{} table {} replaced by a block at {}; the table page is not reclaimed",
                leaf_level + 1,
                next,
                va
            );
        }
        entry
    }

    /// Remove every mapping that covers `[va, va + len)`.
    ///
    /// The range is scanned in 4KB steps. A missing entry skips the whole
    /// region that entry would cover, and a block is cleared as a whole,
    /// with the scan resuming after its end. Table pages that become empty
    /// are left in place.
    ///
    /// # Errors
    /// Returns [`MappingError::AddressOverflow`] if the range wraps.
    pub fn unmap(&mut self, va: VirtAddr, len: usize) -> Result<(), MappingError> {
        let Some(last) = last_byte(va.as_usize(), len) else {
            return Err(MappingError::AddressOverflow);
        };

        let mut cleared = 0usize;
        let mut cursor = va.align_down_to(PAGE_SIZE).as_usize();
        while last.is_some_and(|last| cursor <= last) {
            let (level, was_mapped) = self.clear_entry(VirtAddr::new(cursor));
            if was_mapped {
                cleared += 1;
            }
            let region = level_entry_size(level);
            match (cursor & !(region - 1)).checked_add(region) {
                Some(next) => cursor = next,
                None => break,
            }
        }

        debug!("unmap: {} ({:#x} bytes), {} entries cleared", va, len, cleared);
        self.mmu.flush_tlb_all();
        Ok(())
    }

    /// Clear the leaf covering `va`, if any.
    ///
    /// Returns the level whose entry ended the walk and whether a leaf
    /// was cleared.
    fn clear_entry(&self, va: VirtAddr) -> (usize, bool) {
        let mut table = self.root_table();
        for level in 0..LEVELS {
            match self.walk(table, level, va, None) {
                Walk::Table(next) => table = next,
                Walk::Block(entry) | Walk::Page(entry) => {
                    trace!("unmap: clearing level-{} entry for {}", level, va);
                    entry.clear();
                    return (level, true);
                }
                Walk::NoMapping(_) => return (level, false),
            }
        }
        (LEVELS - 1, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::{L1_BLOCK_SIZE, L2_BLOCK_SIZE, PAGE_MASK, PHYS_MEM_BASE};
    use crate::mm::buddy::{Page, Zone};
    use core::cell::Cell;

    /// A 4 KiB-aligned frame of host memory standing in for physical RAM.
    #[repr(C, align(4096))]
    struct Frame(#[allow(dead_code)] [u8; PAGE_SIZE]);

    /// Host memory is reachable at its own address.
    struct IdentityMap;

    impl PhysMap for IdentityMap {
        fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr {
            VirtAddr::new(pa.as_usize())
        }

        fn virt_to_phys(&self, va: VirtAddr) -> PhysAddr {
            PhysAddr::new(va.as_usize())
        }
    }

    #[derive(Default)]
    struct RecordingMmu {
        flushes: Cell<usize>,
        root: Cell<Option<PhysAddr>>,
    }

    impl Mmu for RecordingMmu {
        fn flush_tlb_all(&self) {
            self.flushes.set(self.flushes.get() + 1);
        }

        unsafe fn set_root(&self, root: PhysAddr) {
            self.root.set(Some(root));
        }
    }

    type TestZone<'a> = Zone<'a, 6>;

    const FRAMES: usize = 32;

    fn ram(frames: usize) -> Vec<Frame> {
        (0..frames).map(|_| Frame([0; PAGE_SIZE])).collect()
    }

    fn zone<'a>(ram: &mut [Frame], meta: &'a mut [Page]) -> TestZone<'a> {
        let frames = ram.len();
        TestZone::init(meta, VirtAddr::new(ram.as_mut_ptr() as usize), frames)
    }

    fn manager<'m>(
        zone: &mut TestZone<'_>,
        mmu: &'m RecordingMmu,
    ) -> PageTableManager<'m, IdentityMap, RecordingMmu> {
        // SAFETY: The zone hands out frames of test RAM that outlives the manager.
        unsafe { PageTableManager::create(zone, &IdentityMap, mmu) }.expect("root table")
    }

    #[test]
    fn test_map_single_user_page() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let flags = MapFlags::USER_DATA;
        pt.map(&mut zone, VirtAddr::new(0x40_0000), PhysAddr::new(0x8000_0000), 0x1000, flags)
            .unwrap();

        let (pa, descriptor) = pt.translate(VirtAddr::new(0x40_0000)).unwrap();
        assert_eq!(pa, PhysAddr::new(0x8000_0000));
        assert_eq!(descriptor.attributes(), Some(flags));
        assert!(matches!(descriptor, Descriptor::Page { .. }));

        let (pa, _) = pt.translate(VirtAddr::new(0x40_0FFF)).unwrap();
        assert_eq!(pa, PhysAddr::new(0x8000_0FFF));

        assert_eq!(pt.translate(VirtAddr::new(0x40_1000)), Err(MappingError::NotMapped));
        assert_eq!(mmu.flushes.get(), 1);
        // Root plus L1, L2 and L3 tables
        assert_eq!(zone.free_page_count(), FRAMES - 4);
    }

    #[test]
    fn test_map_range_translates_every_page() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let va = VirtAddr::new(0x1000_0000);
        let pa = PhysAddr::new(0x4800_0000);
        // Five pages and one byte: the tail page must be mapped too
        let len = 5 * PAGE_SIZE + 1;
        pt.map(&mut zone, va, pa, len, MapFlags::KERNEL_DATA).unwrap();

        for page in 0..6 {
            let offset = page * PAGE_SIZE;
            let (got, descriptor) = pt.translate(va.add(offset)).unwrap();
            assert_eq!(got, pa.add(offset));
            assert_eq!(descriptor.attributes(), Some(MapFlags::KERNEL_DATA));
        }
        assert!(pt.translate(va.add(6 * PAGE_SIZE)).is_err());
    }

    #[test]
    fn test_unaligned_start_rounds_outward() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        pt.map(
            &mut zone,
            VirtAddr::new(0x40_0800),
            PhysAddr::new(0x8000_0800),
            0x1000,
            MapFlags::USER_CODE,
        )
        .unwrap();

        assert_eq!(
            pt.translate(VirtAddr::new(0x40_0000)).unwrap().0,
            PhysAddr::new(0x8000_0000)
        );
        assert_eq!(
            pt.translate(VirtAddr::new(0x40_1FFF)).unwrap().0,
            PhysAddr::new(0x8000_1FFF)
        );
        assert!(pt.translate(VirtAddr::new(0x40_2000)).is_err());
    }

    #[test]
    fn test_map_l2_block() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let flags = MapFlags::KERNEL_DATA | MapFlags::L2_BLOCK;
        let va = VirtAddr::new(0x4000_0000);
        let pa = PhysAddr::new(0x8000_0000);
        pt.map(&mut zone, va, pa, 0x1000, flags).unwrap();

        let (got, descriptor) = pt.translate(va.add(0x12_3456)).unwrap();
        assert_eq!(got, PhysAddr::new(0x8012_3456));
        assert_eq!(
            descriptor,
            Descriptor::Block {
                level: 2,
                addr: pa,
                attrs: flags
            }
        );
        assert!(pt.translate(va.add(L2_BLOCK_SIZE)).is_err());
        // Root plus L1 and L2 tables, no L3
        assert_eq!(zone.free_page_count(), FRAMES - 3);
    }

    #[test]
    fn test_map_l1_block() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let flags = MapFlags::KERNEL_CODE | MapFlags::L1_BLOCK;
        let va = VirtAddr::new(0x8000_0000);
        let pa = PhysAddr::new(0x4000_0000);
        pt.map(&mut zone, va, pa, L1_BLOCK_SIZE + 1, flags).unwrap();

        let (got, descriptor) = pt.translate(va.add(0x3FFF_FFFF)).unwrap();
        assert_eq!(got, PhysAddr::new(0x7FFF_FFFF));
        assert!(matches!(descriptor, Descriptor::Block { level: 1, .. }));
        // The extra byte pulled in a second block
        let (got, _) = pt.translate(va.add(L1_BLOCK_SIZE)).unwrap();
        assert_eq!(got, pa.add(L1_BLOCK_SIZE));
    }

    #[test]
    fn test_unmap_range() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let va = VirtAddr::new(0x40_0000);
        pt.map(&mut zone, va, PhysAddr::new(0x8000_0000), 8 * PAGE_SIZE, MapFlags::USER_DATA)
            .unwrap();
        pt.unmap(va.add(2 * PAGE_SIZE), 3 * PAGE_SIZE).unwrap();

        for page in 0..8 {
            let mapped = pt.translate(va.add(page * PAGE_SIZE)).is_ok();
            assert_eq!(mapped, !(2..5).contains(&page), "page {}", page);
        }

        pt.unmap(va, 8 * PAGE_SIZE).unwrap();
        for page in 0..8 {
            assert_eq!(
                pt.translate(va.add(page * PAGE_SIZE)),
                Err(MappingError::NotMapped)
            );
        }
        assert_eq!(mmu.flushes.get(), 3);
    }

    #[test]
    fn test_unmap_clears_whole_block_and_resumes_after_it() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let va = VirtAddr::new(0x4000_0000);
        let flags = MapFlags::USER_DATA | MapFlags::L2_BLOCK;
        pt.map(&mut zone, va, PhysAddr::new(0x8000_0000), 2 * L2_BLOCK_SIZE, flags)
            .unwrap();

        // One page in the middle of the first block takes the whole block
        pt.unmap(va.add(0x10_0000), PAGE_SIZE).unwrap();
        assert!(pt.translate(va).is_err());
        assert!(pt.translate(va.add(L2_BLOCK_SIZE - 1)).is_err());
        assert_eq!(
            pt.translate(va.add(L2_BLOCK_SIZE)).unwrap().0,
            PhysAddr::new(0x8000_0000 + L2_BLOCK_SIZE)
        );
    }

    #[test]
    fn test_unmap_l1_block_resumes_after_one_gib() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let va = VirtAddr::new(0x8000_0000);
        let pa = PhysAddr::new(0x4000_0000);
        let flags = MapFlags::KERNEL_DATA | MapFlags::L1_BLOCK;
        pt.map(&mut zone, va, pa, 2 * L1_BLOCK_SIZE, flags).unwrap();

        pt.unmap(va.add(0x1000_0000), PAGE_SIZE).unwrap();
        assert!(pt.translate(va).is_err());
        assert!(pt.translate(va.add(L1_BLOCK_SIZE - 1)).is_err());
        assert_eq!(pt.translate(va.add(L1_BLOCK_SIZE)).unwrap().0, pa.add(L1_BLOCK_SIZE));

        // Straddles the cleared first block into the second one
        pt.unmap(va.add(L1_BLOCK_SIZE - PAGE_SIZE), 2 * PAGE_SIZE).unwrap();
        assert_eq!(pt.translate(va.add(L1_BLOCK_SIZE)), Err(MappingError::NotMapped));
        assert_eq!(
            pt.translate(va.add(2 * L1_BLOCK_SIZE - 1)),
            Err(MappingError::NotMapped)
        );
    }

    #[test]
    fn test_map_and_unmap_last_page() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let top = VirtAddr::new(usize::MAX & !PAGE_MASK);
        let pa = PhysAddr::new(0x8000_0000);
        pt.map(&mut zone, top, pa, PAGE_SIZE, MapFlags::KERNEL_DATA).unwrap();
        assert_eq!(
            pt.translate(VirtAddr::new(usize::MAX)).unwrap().0,
            PhysAddr::new(0x8000_0FFF)
        );

        pt.unmap(top, PAGE_SIZE).unwrap();
        assert_eq!(pt.translate(top), Err(MappingError::NotMapped));
        assert_eq!(
            pt.map(&mut zone, top, pa, 2 * PAGE_SIZE, MapFlags::KERNEL_DATA),
            Err(MappingError::AddressOverflow)
        );
        assert_eq!(mmu.flushes.get(), 2);
    }

    #[test]
    fn test_map_kernel_linear_addresses() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let linear = KernelLinearMap;
        let pa = PhysAddr::new(PHYS_MEM_BASE + 0x20_0000);
        let va = linear.phys_to_virt(pa);
        assert_eq!(va.as_usize(), 0xFFFF_0000_0020_0000);

        pt.map(&mut zone, va, pa, 2 * PAGE_SIZE, MapFlags::KERNEL_DATA).unwrap();
        for offset in [0, 0x1234, 2 * PAGE_SIZE - 1] {
            let (got, _) = pt.translate(va.add(offset)).unwrap();
            assert_eq!(got, linear.virt_to_phys(va.add(offset)));
        }
        assert!(pt.translate(va.add(2 * PAGE_SIZE)).is_err());
        assert_eq!(va.table_index(2), 1);
    }

    #[test]
    fn test_unmap_unmapped_range_is_harmless() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);
        let free = zone.free_page_count();

        assert_eq!(pt.unmap(VirtAddr::new(0x7000_0000), 64 * L2_BLOCK_SIZE), Ok(()));
        assert_eq!(mmu.flushes.get(), 1);
        assert_eq!(zone.free_page_count(), free);
        assert_eq!(
            pt.unmap(VirtAddr::new(usize::MAX & !0xFFF), 2 * PAGE_SIZE),
            Err(MappingError::AddressOverflow)
        );
    }

    #[test]
    fn test_misaligned_request_is_rejected_untouched() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);
        let free = zone.free_page_count();

        let result = pt.map(
            &mut zone,
            VirtAddr::new(0x4000_0000),
            PhysAddr::new(0x8000_1000),
            PAGE_SIZE,
            MapFlags::KERNEL_DATA | MapFlags::L2_BLOCK,
        );
        assert_eq!(result, Err(MappingError::MisalignedAddress));
        assert_eq!(zone.free_page_count(), free);
        assert_eq!(mmu.flushes.get(), 0);
    }

    #[test]
    fn test_remap_replaces_leaf() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let va = VirtAddr::new(0x40_0000);
        pt.map(&mut zone, va, PhysAddr::new(0x8000_0000), PAGE_SIZE, MapFlags::USER_DATA)
            .unwrap();
        let free = zone.free_page_count();
        pt.map(&mut zone, va, PhysAddr::new(0x9000_0000), PAGE_SIZE, MapFlags::USER_CODE)
            .unwrap();

        let (pa, descriptor) = pt.translate(va).unwrap();
        assert_eq!(pa, PhysAddr::new(0x9000_0000));
        assert_eq!(descriptor.attributes(), Some(MapFlags::USER_CODE));
        // Existing tables were reused
        assert_eq!(zone.free_page_count(), free);
    }

    #[test]
    fn test_walk_without_allocator_reports_no_mapping() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let pt = manager(&mut zone, &mmu);

        let root = pt.root_table();
        match pt.walk(root, 0, VirtAddr::new(0x40_0000), None) {
            Walk::NoMapping(entry) => assert!(!entry.is_valid()),
            other => panic!("unexpected walk result {:?}", other),
        }

        let root = pt.root_table();
        assert!(matches!(
            pt.walk(root, 0, VirtAddr::new(0x40_0000), Some(&mut zone)),
            Walk::Table(_)
        ));
        assert_eq!(pt.root_table().iter_valid().count(), 1);
    }

    #[test]
    fn test_activate_installs_root() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let pt = manager(&mut zone, &mmu);

        // SAFETY: The recording MMU only stores the address.
        unsafe { pt.activate() };
        assert_eq!(mmu.root.get(), Some(PhysAddr::new(pt.root().as_usize())));
    }

    #[test]
    #[should_panic(expected = "invalid page table level")]
    fn test_walk_rejects_bad_level() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let pt = manager(&mut zone, &mmu);
        let root = pt.root_table();
        let _ = pt.walk(root, 4, VirtAddr::new(0), None);
    }

    #[test]
    #[should_panic(expected = "inside an existing level-2 block")]
    fn test_page_inside_block_is_fatal() {
        let mut ram = ram(FRAMES);
        let mut meta = vec![Page::EMPTY; FRAMES];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        let va = VirtAddr::new(0x4000_0000);
        pt.map(&mut zone, va, PhysAddr::new(0x8000_0000), PAGE_SIZE, MapFlags::KERNEL_DATA | MapFlags::L2_BLOCK)
            .unwrap();
        let _ = pt.map(&mut zone, va, PhysAddr::new(0x9000_0000), PAGE_SIZE, MapFlags::KERNEL_DATA);
    }

    #[test]
    #[should_panic(expected = "out of memory while allocating a table page")]
    fn test_table_allocation_failure_is_fatal() {
        let mut ram = ram(2);
        let mut meta = vec![Page::EMPTY; 2];
        let mut zone = zone(&mut ram, &mut meta);
        let mmu = RecordingMmu::default();
        let mut pt = manager(&mut zone, &mmu);

        // Root plus one frame: the L2 table cannot be allocated
        let _ = pt.map(&mut zone, VirtAddr::new(0x40_0000), PhysAddr::new(0x8000_0000), PAGE_SIZE, MapFlags::USER_DATA);
    }
}
