use std::sync::{Mutex, PoisonError};

use tracing::{trace, warn};

use super::device::Device;
use crate::hw::{HwError, PixelFormat, ResourceAllocator, ResourceHandle};

/// Index of a page inside its surface's pool.
pub type PageId = usize;

/// One buffer slot. `used` only ever changes under its own lock.
#[derive(Debug)]
pub(crate) struct Page {
    resource: ResourceHandle,
    used: Mutex<bool>,
}

impl Page {
    fn claim(&self) -> bool {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if *used {
            return false;
        }
        *used = true;
        true
    }

    fn release(&self) {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    fn is_used(&self) -> bool {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of pages owned by one surface.
#[derive(Debug)]
pub(crate) struct PagePool {
    pages: Vec<Page>,
}

impl PagePool {
    /// Creates `count` resources of `width`x`height`. On failure every
    /// resource created so far is deleted again.
    pub fn allocate(
        hw: &(impl ResourceAllocator + ?Sized),
        format: PixelFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Self, HwError> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match hw.create(format, width, height) {
                Ok(resource) => pages.push(Page {
                    resource,
                    used: Mutex::new(false),
                }),
                Err(err) => {
                    warn!(
                        "Resource allocation failed after {} of {} pages: {}",
                        pages.len(),
                        count,
                        err
                    );
                    for page in &pages {
                        hw.delete(page.resource);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { pages })
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn resource(&self, id: PageId) -> ResourceHandle {
        self.pages[id].resource
    }

    pub fn resources(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.pages.iter().map(|page| page.resource)
    }

    pub fn is_used(&self, id: PageId) -> bool {
        self.pages[id].is_used()
    }

    /// Claims the first free page in index order.
    pub fn try_acquire(&self) -> Option<PageId> {
        self.pages.iter().position(Page::claim)
    }

    /// Blocks until a page is free and claims it. Each wake rescans from the
    /// start; a wake caused by another surface's flip just scans again.
    pub fn acquire(&self, device: &Device) -> PageId {
        device.wait_for(|| {
            let page = self.try_acquire();
            if page.is_none() {
                trace!("no free page among {}, waiting for a flip", self.len());
            }
            page
        })
    }

    pub fn release(&self, id: PageId) {
        self.pages[id].release();
    }

    pub fn release_all(&self) {
        self.pages.iter().for_each(Page::release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::soft::SoftHardware;

    #[test]
    fn acquire_scans_in_index_order() {
        let hw = SoftHardware::manual(640, 480);
        let pool = PagePool::allocate(&hw, PixelFormat::Rgb565, 4, 4, 3).unwrap();

        assert_eq!(pool.try_acquire(), Some(0));
        assert_eq!(pool.try_acquire(), Some(1));
        pool.release(0);
        assert_eq!(pool.try_acquire(), Some(0));
        assert_eq!(pool.try_acquire(), Some(2));
        assert_eq!(pool.try_acquire(), None);
        assert!((0..3).all(|page| pool.is_used(page)));
    }

    #[test]
    fn released_page_is_free_again() {
        let hw = SoftHardware::manual(640, 480);
        let pool = PagePool::allocate(&hw, PixelFormat::Indexed8, 2, 2, 1).unwrap();
        let page = pool.try_acquire().unwrap();
        assert!(pool.is_used(page));
        pool.release(page);
        assert!(!pool.is_used(page));
    }

    #[test]
    fn failed_allocation_deletes_partial_pages() {
        let hw = SoftHardware::manual(640, 480);
        hw.fail_create_after(2);
        let err = PagePool::allocate(&hw, PixelFormat::Xrgb8888, 8, 8, 3).unwrap_err();
        assert!(matches!(err, HwError::ResourceExhausted));
        assert_eq!(hw.live_resources(), 0);
    }
}
