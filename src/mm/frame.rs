//! Physical Frame Sources
//!
//! The page table code never touches the buddy zone directly: it asks a
//! [`FrameAllocator`] for single frames. [`LockedZone`] is the kernel's
//! frame allocator, a zone behind the whole-allocator spinlock.
//!
//! # Security Properties
//! - Frames are handed out by kernel virtual address only
//! - Releasing an address outside the zone panics

use spin::Mutex;

use super::address::VirtAddr;
use super::buddy::{Zone, DEFAULT_MAX_ORDER};

/// Source of single 4KB frames for page table pages.
pub trait FrameAllocator {
    /// Allocate one frame, returning its kernel virtual address.
    ///
    /// Returns `None` if no frames are available. The frame is not zeroed.
    fn allocate_frame(&mut self) -> Option<VirtAddr>;
}

impl<const MAX_ORDER: usize> FrameAllocator for Zone<'_, MAX_ORDER> {
    fn allocate_frame(&mut self) -> Option<VirtAddr> {
        let page = self.allocate(0).ok()?;
        Some(self.frame_to_address(page))
    }
}

/// A buddy zone protected by a spinlock.
///
/// Each call holds the lock for its whole duration, which serializes all
/// allocator mutations.
pub struct LockedZone<'a, const MAX_ORDER: usize = DEFAULT_MAX_ORDER> {
    inner: Mutex<Zone<'a, MAX_ORDER>>,
}

impl<'a, const MAX_ORDER: usize> LockedZone<'a, MAX_ORDER> {
    /// Wrap an initialized zone.
    pub const fn new(zone: Zone<'a, MAX_ORDER>) -> Self {
        Self {
            inner: Mutex::new(zone),
        }
    }

    /// Allocate `2^order` contiguous frames.
    ///
    /// Returns the kernel virtual address of the first frame, or `None` if
    /// the order is invalid or the zone is exhausted.
    pub fn get_pages(&self, order: usize) -> Option<VirtAddr> {
        let mut zone = self.inner.lock();
        let page = zone.allocate(order).ok()?;
        Some(zone.frame_to_address(page))
    }

    /// Free a block previously returned by [`get_pages`](Self::get_pages).
    ///
    /// # Panics
    /// Panics if `addr` does not belong to the zone.
    pub fn free_pages(&self, addr: VirtAddr) {
        let mut zone = self.inner.lock();
        let page = zone.address_to_frame(addr);
        zone.release(page);
    }

    /// Get the number of free frames remaining.
    pub fn free_page_count(&self) -> usize {
        self.inner.lock().free_page_count()
    }

    /// Run `f` with exclusive access to the zone.
    pub fn with_zone<R>(&self, f: impl FnOnce(&mut Zone<'a, MAX_ORDER>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<const MAX_ORDER: usize> FrameAllocator for &LockedZone<'_, MAX_ORDER> {
    fn allocate_frame(&mut self) -> Option<VirtAddr> {
        self.get_pages(0)
    }
}
