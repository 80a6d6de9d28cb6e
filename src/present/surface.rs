use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use tracing::{debug, trace, warn};

use super::{
    device::Device,
    page::{PageId, PagePool},
    PresentError,
};
use crate::hw::{Alpha, ElementDesc, ElementHandle, PixelFormat, Rect};

static NEXT_SURFACE_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(u32);

/// Parameters of [`Surface::setup`].
#[derive(Debug, Clone, Copy)]
pub struct SurfaceParams {
    pub width: u32,
    pub height: u32,
    /// Bytes per source row, including any padding between rows.
    pub visible_pitch: u32,
    pub bpp: u32,
    pub opacity: u8,
    pub aspect: f32,
    pub pages: usize,
    /// Lower layers render behind higher ones.
    pub layer: i32,
}

/// Scales to fill the display while keeping `aspect`, clamped to the display
/// and centered on both axes.
pub fn dst_rect_for(display_width: u32, display_height: u32, aspect: f32) -> Rect {
    let mut width = (display_height as f32 * aspect) as u32;
    let mut height = (display_width as f32 / aspect) as u32;

    width = width.min(display_width);
    height = height.min(display_height);

    Rect::new(
        ((display_width - width) / 2) as i32,
        ((display_height - height) / 2) as i32,
        width,
        height,
    )
}

/// State reachable from both the producer and the completion handler.
#[derive(Debug)]
pub(crate) struct SurfaceShared {
    pub id: SurfaceId,
    pub device: Arc<Device>,
    pub pool: PagePool,
    current: Mutex<Option<PageId>>,
    pub format: PixelFormat,
    pub pitch: u32,
    pub height: u32,
    pub bmp_rect: Rect,
    pub element: ElementHandle,
}

impl SurfaceShared {
    pub fn lock_current(&self) -> MutexGuard<'_, Option<PageId>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A compositable region with its own page rotation and geometry.
#[derive(Debug)]
pub struct Surface {
    pub(crate) shared: Arc<SurfaceShared>,
    src_rect: Rect,
    dst_rect: Rect,
    layer: i32,
    torn_down: bool,
}

impl Surface {
    /// Validates `params`, allocates every page and registers one element
    /// showing the first page. Nothing is left allocated on failure.
    pub fn setup(device: &Arc<Device>, params: SurfaceParams) -> Result<Self, PresentError> {
        if params.width == 0 || params.height == 0 {
            return Err(PresentError::ZeroDimension);
        }
        if params.pages == 0 {
            return Err(PresentError::ZeroPages);
        }
        let format =
            PixelFormat::from_depth(params.bpp).ok_or(PresentError::UnsupportedDepth(params.bpp))?;

        // Storage stride and logical width differ for sources with row padding.
        let visible_width = params.visible_pitch / format.bytes_per_pixel();
        if visible_width < params.width {
            return Err(PresentError::InvalidPitch {
                pitch: params.visible_pitch,
                width: params.width,
                bpp: params.bpp,
            });
        }

        let (display_width, display_height) = device.size();
        let dst_rect = dst_rect_for(display_width, display_height, params.aspect);
        let bmp_rect = Rect::new(0, 0, params.width, params.height);
        let src_rect = Rect::new(0, 0, params.width << 16, params.height << 16);

        let hw = device.hardware();
        let pool = PagePool::allocate(hw, format, visible_width, params.height, params.pages)?;

        let element = match register_element(device, &pool, params, dst_rect, src_rect) {
            Ok(element) => element,
            Err(err) => {
                pool.resources().for_each(|res| hw.delete(res));
                return Err(err);
            }
        };

        let id = SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed));
        debug!(
            "Surface {:?}: {}x{} {:?}, {} page(s), layer {}, dst {:?}",
            id, params.width, params.height, format, params.pages, params.layer, dst_rect
        );

        Ok(Self {
            shared: Arc::new(SurfaceShared {
                id,
                device: device.clone(),
                pool,
                current: Mutex::new(None),
                format,
                pitch: params.visible_pitch,
                height: params.height,
                bmp_rect,
                element,
            }),
            src_rect,
            dst_rect,
            layer: params.layer,
            torn_down: false,
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.shared.id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    pub fn page_count(&self) -> usize {
        self.shared.pool.len()
    }

    /// The page on screen, unset before the first flip completes.
    pub fn current_page(&self) -> Option<PageId> {
        *self.shared.lock_current()
    }

    pub fn is_page_used(&self, page: PageId) -> bool {
        self.shared.pool.is_used(page)
    }

    pub fn format(&self) -> PixelFormat {
        self.shared.format
    }

    pub fn pitch(&self) -> u32 {
        self.shared.pitch
    }

    pub fn element(&self) -> ElementHandle {
        self.shared.element
    }

    pub fn layer(&self) -> i32 {
        self.layer
    }

    pub fn src_rect(&self) -> Rect {
        self.src_rect
    }

    pub fn dst_rect(&self) -> Rect {
        self.dst_rect
    }

    pub fn resources(&self) -> Vec<crate::hw::ResourceHandle> {
        self.shared.pool.resources().collect()
    }

    /// Blocks until some page is free, claims it and returns its index.
    pub fn acquire_free_page(&self) -> PageId {
        self.shared.pool.acquire(&self.shared.device)
    }

    /// Attaches an RGB565 palette to every page. Indexed surfaces only.
    pub fn set_palette(&self, palette: &[u16]) -> Result<(), PresentError> {
        let hw = self.shared.device.hardware();
        for res in self.shared.pool.resources() {
            hw.set_palette(res, palette)?;
        }
        Ok(())
    }

    /// Waits out any in-flight flip, then releases every page and removes the
    /// element. No completion for this surface can run after it returns.
    pub fn teardown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let shared = &self.shared;
        shared.device.wait_idle();

        let hw = shared.device.hardware();
        for res in shared.pool.resources() {
            hw.delete(res);
        }
        shared.pool.release_all();
        *shared.lock_current() = None;

        let removed = hw.begin().and_then(|update| {
            hw.remove_element(&update, shared.element)?;
            hw.submit_sync(update)
        });
        if let Err(err) = removed {
            warn!("Failed to remove element of surface {:?}: {}", shared.id, err);
        }
        trace!("Surface {:?} torn down", shared.id);
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.release();
    }
}

fn register_element(
    device: &Device,
    pool: &PagePool,
    params: SurfaceParams,
    dst: Rect,
    src: Rect,
) -> Result<ElementHandle, PresentError> {
    let hw = device.hardware();
    let update = hw.begin()?;
    let element = hw.add_element(
        &update,
        ElementDesc {
            display: device.display(),
            layer: params.layer,
            dst,
            src,
            resource: pool.resource(0),
            alpha: Alpha {
                opacity: params.opacity,
            },
        },
    )?;
    hw.submit_sync(update)?;
    Ok(element)
}
