//! Buddy Page Allocator
//!
//! Manages a contiguous pool of physical frames as power-of-two sized
//! blocks. Each order `k` has a free list of blocks of `2^k` frames.
//!
//! # Design
//! - The zone owns one [`Page`] record per frame; a "page" is always a
//!   [`PageIdx`] into that array, never a raw pointer
//! - Free lists are intrusive doubly-linked lists threaded through the
//!   records, so a buddy can be unlinked in O(1) when it merges
//! - Blocks are naturally aligned in index space: the buddy of block `i`
//!   at order `k` is `i ^ (1 << k)`, and a merge always keeps the lower index
//!
//! # Locking
//! The zone performs no internal locking. Callers serialize access, see
//! [`LockedZone`](super::frame::LockedZone).

use core::fmt;

use bitflags::bitflags;
use log::{debug, error, trace, warn};

use super::address::{VirtAddr, PAGE_SHIFT, PAGE_SIZE};

/// Number of free lists used by the kernel zone (blocks up to 4 MiB).
pub const DEFAULT_MAX_ORDER: usize = 11;

/// Index of a frame (and its metadata record) inside a [`Zone`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct PageIdx(usize);

impl PageIdx {
    /// Create an index. Range checks happen when the zone uses it.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the raw index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// State bits of a frame's metadata record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PageState: u8 {
        /// Head of a free block, linked into the free list of its order.
        const FREE = 1 << 0;
        /// Head of a block handed out by [`Zone::allocate`].
        const HEAD = 1 << 1;
    }
}

/// Per-frame metadata record.
///
/// `order` and the list links are only meaningful while the frame heads a
/// free block; allocated heads keep their order so they can be released.
#[derive(Clone, Copy, Debug, Default)]
pub struct Page {
    order: u8,
    state: PageState,
    prev: Option<PageIdx>,
    next: Option<PageIdx>,
}

impl Page {
    /// A zeroed record.
    pub const EMPTY: Self = Self {
        order: 0,
        state: PageState::empty(),
        prev: None,
        next: None,
    };

    /// Order recorded for this frame.
    #[inline]
    pub const fn order(&self) -> usize {
        self.order as usize
    }

    /// State bits of this frame.
    #[inline]
    pub const fn state(&self) -> PageState {
        self.state
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FreeList {
    head: Option<PageIdx>,
    nr_free: usize,
}

impl FreeList {
    const EMPTY: Self = Self {
        head: None,
        nr_free: 0,
    };
}

/// Error type for buddy allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The requested order is not below the zone's maximum order.
    InvalidOrder,
    /// No free block large enough is left.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOrder => write!(f, "requested order exceeds maximum order"),
            Self::OutOfMemory => write!(f, "no free block of the requested order"),
        }
    }
}

/// A contiguous region of frames managed by the buddy system.
///
/// `MAX_ORDER` is the number of free lists; the largest block holds
/// `2^(MAX_ORDER - 1)` frames.
pub struct Zone<'a, const MAX_ORDER: usize = DEFAULT_MAX_ORDER> {
    pages: &'a mut [Page],
    page_size: usize,
    start_addr: VirtAddr,
    end_addr: VirtAddr,
    free_lists: [FreeList; MAX_ORDER],
}

impl<'a, const MAX_ORDER: usize> Zone<'a, MAX_ORDER> {
    /// Initialize a zone of `page_num` frames starting at `start_addr`.
    ///
    /// The first `page_num` records of `metadata` are zeroed and every frame
    /// is released one at a time, leaving the region free and maximally
    /// coalesced.
    ///
    /// # Panics
    /// Panics if `metadata` is shorter than `page_num`, if `start_addr` is
    /// not page aligned, or if `MAX_ORDER` is unusable.
    pub fn init(metadata: &'a mut [Page], start_addr: VirtAddr, page_num: usize) -> Self {
        assert!(
            MAX_ORDER > 0 && MAX_ORDER < usize::BITS as usize,
            "buddy: unsupported maximum order {}",
            MAX_ORDER
        );
        assert!(
            metadata.len() >= page_num,
            "buddy: {} metadata records cannot describe {} frames",
            metadata.len(),
            page_num
        );
        assert!(start_addr.is_aligned(), "buddy: unaligned zone start {}", start_addr);

        let pages = &mut metadata[..page_num];
        pages.fill(Page::EMPTY);

        let mut zone = Self {
            pages,
            page_size: PAGE_SIZE,
            start_addr,
            end_addr: start_addr.add(page_num * PAGE_SIZE),
            free_lists: [FreeList::EMPTY; MAX_ORDER],
        };

        for index in 0..page_num {
            zone.free_block(PageIdx(index));
        }

        debug!(
            "buddy: zone {}..{} ready, {} frames, {} blocks at top order",
            zone.start_addr,
            zone.end_addr,
            page_num,
            zone.free_lists[MAX_ORDER - 1].nr_free
        );
        zone
    }

    /// Allocate a block of `2^order` contiguous frames.
    ///
    /// Returns the head of the block. Exhaustion is reported to the caller;
    /// the allocator never retries on its own.
    pub fn allocate(&mut self, order: usize) -> Result<PageIdx, AllocError> {
        if order >= MAX_ORDER {
            return Err(AllocError::InvalidOrder);
        }

        let found = (order..MAX_ORDER)
            .find_map(|high| self.free_lists[high].head.map(|head| (high, head)));
        let Some((high, head)) = found else {
            warn!(
                "buddy: out of memory for order {} ({} frames free)",
                order,
                self.free_page_count()
            );
            return Err(AllocError::OutOfMemory);
        };

        self.list_del(head, high);
        self.clear_free(head);
        self.split(head, order, high);

        let page = &mut self.pages[head.0];
        page.order = order as u8;
        page.state.insert(PageState::HEAD);
        Ok(head)
    }

    /// Give a block back to the zone, merging it with free buddies.
    ///
    /// Releasing a block that is already free is ignored.
    ///
    /// # Panics
    /// Panics if `page` is out of range, or if it is an interior frame of an
    /// allocated block rather than its head.
    pub fn release(&mut self, page: PageIdx) {
        self.check_index(page);
        let state = self.pages[page.0].state;
        if state.contains(PageState::FREE) {
            return;
        }
        if !state.contains(PageState::HEAD) {
            if let Some(block) = self.enclosing_free_block(page) {
                warn!("buddy: ignoring release of {:?}, already free in block {:?}", page, block);
                return;
            }
        }
        assert!(
            state.contains(PageState::HEAD),
            "buddy: release of {:?}, which does not head an allocated block",
            page
        );

        self.pages[page.0].state.remove(PageState::HEAD);
        self.free_block(page);
    }

    /// Kernel virtual address of a frame.
    ///
    /// # Panics
    /// Panics if `page` is out of range.
    #[inline]
    pub fn frame_to_address(&self, page: PageIdx) -> VirtAddr {
        self.check_index(page);
        self.start_addr.add(page.0 * self.page_size)
    }

    /// Frame containing a kernel virtual address.
    ///
    /// # Panics
    /// Addresses outside the zone are a caller bug and panic.
    pub fn address_to_frame(&self, addr: VirtAddr) -> PageIdx {
        if addr < self.start_addr || addr >= self.end_addr {
            error!(
                "buddy: address {} outside zone {}..{}",
                addr, self.start_addr, self.end_addr
            );
            panic!("buddy: address {} does not belong to this zone", addr);
        }
        PageIdx((addr.as_usize() - self.start_addr.as_usize()) >> PAGE_SHIFT)
    }

    /// Number of free blocks of `order`.
    #[inline]
    pub fn nr_free(&self, order: usize) -> usize {
        self.free_lists[order].nr_free
    }

    /// Heads of the free blocks of `order`, in list order.
    pub fn free_blocks(&self, order: usize) -> FreeBlocks<'_> {
        FreeBlocks {
            pages: &*self.pages,
            cursor: self.free_lists[order].head,
        }
    }

    /// Total number of free frames across all orders.
    pub fn free_page_count(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.nr_free << order)
            .sum()
    }

    /// Number of frames managed by the zone.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Size of one frame in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// First address of the zone.
    #[inline]
    pub fn start_addr(&self) -> VirtAddr {
        self.start_addr
    }

    /// One past the last address of the zone.
    #[inline]
    pub fn end_addr(&self) -> VirtAddr {
        self.end_addr
    }

    /// Metadata record of a frame.
    #[inline]
    pub fn page(&self, page: PageIdx) -> &Page {
        self.check_index(page);
        &self.pages[page.0]
    }

    /// Order of the block headed by `page`.
    #[inline]
    pub fn order_of(&self, page: PageIdx) -> usize {
        self.page(page).order()
    }

    /// Whether `page` heads a free block.
    #[inline]
    pub fn is_free(&self, page: PageIdx) -> bool {
        self.page(page).state.contains(PageState::FREE)
    }

    #[inline]
    fn check_index(&self, page: PageIdx) {
        assert!(
            page.0 < self.pages.len(),
            "buddy: frame {} out of range ({} frames)",
            page.0,
            self.pages.len()
        );
    }

    /// Halve the block at `page` from `high` down to `low`, returning each
    /// upper half to the free list one order below.
    fn split(&mut self, page: PageIdx, low: usize, mut high: usize) {
        while high > low {
            high -= 1;
            let upper = PageIdx(page.0 + (1 << high));
            trace!("buddy: split {:?}, {:?} free at order {}", page, upper, high);
            self.set_free(upper, high);
            self.list_add(upper, high);
        }
    }

    /// Return a block to the free lists, coalescing with its buddies.
    fn free_block(&mut self, mut page: PageIdx) {
        let mut order = self.pages[page.0].order();
        while order < MAX_ORDER - 1 {
            let Some(buddy) = self.mergeable_buddy(page, order) else {
                break;
            };
            self.list_del(buddy, order);
            self.clear_free(buddy);
            self.clear_free(page);
            page = PageIdx(page.0 & !(1 << order));
            order += 1;
            trace!("buddy: merged into {:?} at order {}", page, order);
        }
        self.set_free(page, order);
        self.list_add(page, order);
    }

    fn mergeable_buddy(&self, page: PageIdx, order: usize) -> Option<PageIdx> {
        let buddy = page.0 ^ (1 << order);
        let record = self.pages.get(buddy)?;
        (record.state.contains(PageState::FREE) && record.order() == order).then_some(PageIdx(buddy))
    }

    /// Head of the free block containing `page`, if any.
    fn enclosing_free_block(&self, page: PageIdx) -> Option<PageIdx> {
        (0..MAX_ORDER).find_map(|order| {
            let head = page.0 & !((1 << order) - 1);
            let record = &self.pages[head];
            (record.state.contains(PageState::FREE) && record.order() == order)
                .then_some(PageIdx(head))
        })
    }

    #[inline]
    fn set_free(&mut self, page: PageIdx, order: usize) {
        let record = &mut self.pages[page.0];
        record.order = order as u8;
        record.state.insert(PageState::FREE);
    }

    #[inline]
    fn clear_free(&mut self, page: PageIdx) {
        let record = &mut self.pages[page.0];
        record.order = 0;
        record.state.remove(PageState::FREE);
    }

    fn list_add(&mut self, page: PageIdx, order: usize) {
        let list = &mut self.free_lists[order];
        let old_head = list.head;
        if let Some(old_head) = old_head {
            self.pages[old_head.0].prev = Some(page);
        }
        let record = &mut self.pages[page.0];
        record.prev = None;
        record.next = old_head;
        list.head = Some(page);
        list.nr_free += 1;
    }

    fn list_del(&mut self, page: PageIdx, order: usize) {
        let Page { prev, next, .. } = self.pages[page.0];
        let list = &mut self.free_lists[order];
        match prev {
            Some(prev) => self.pages[prev.0].next = next,
            None => {
                debug_assert_eq!(list.head, Some(page));
                list.head = next;
            }
        }
        if let Some(next) = next {
            self.pages[next.0].prev = prev;
        }
        let record = &mut self.pages[page.0];
        record.prev = None;
        record.next = None;
        list.nr_free -= 1;
    }
}

impl<const MAX_ORDER: usize> fmt::Debug for Zone<'_, MAX_ORDER> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("start_addr", &self.start_addr)
            .field("end_addr", &self.end_addr)
            .field("pages", &self.pages.len())
            .field("free_pages", &self.free_page_count())
            .finish()
    }
}

/// Iterator over the heads of one free list.
pub struct FreeBlocks<'z> {
    pages: &'z [Page],
    cursor: Option<PageIdx>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = PageIdx;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = self.pages[current.0].next;
        Some(current)
    }
}
