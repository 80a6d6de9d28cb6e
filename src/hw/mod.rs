//! Hardware collaborators consumed by the presentation core.
//!
//! The scheduler never talks to a real display controller directly. It goes
//! through three capabilities:
//! - [`DisplayProvider`]: open/close a physical display and query its size
//! - [`ResourceAllocator`]: off-screen image resources the pages wrap
//! - [`Compositor`]: update transactions that add, retarget and remove elements
//!
//! [`soft::SoftHardware`] implements all of them in memory and is used by the
//! demo binary and the tests.

pub mod soft;

use crate::present::FlipToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub u32);

/// One open compositor transaction. Consumed by a submit call.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Update(pub u32);

#[derive(Debug, thiserror::Error)]
pub enum HwError {
    #[error("failed to open display {0}")]
    DisplayOpen(u32),
    #[error("out of image resources")]
    ResourceExhausted,
    #[error("unknown resource {0:?}")]
    InvalidResource(ResourceHandle),
    #[error("unknown element {0:?}")]
    InvalidElement(ElementHandle),
    #[error("update transaction failed: {0}")]
    UpdateFailed(String),
    #[error("write of {len} bytes does not fit resource {resource:?}")]
    WriteOutOfBounds { resource: ResourceHandle, len: usize },
}

/// Hardware pixel encodings. Only 8, 16 and 32 bit paths exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Indexed8,
    Rgb565,
    Xrgb8888,
}

impl PixelFormat {
    pub fn from_depth(bpp: u32) -> Option<Self> {
        match bpp {
            8 => Some(PixelFormat::Indexed8),
            16 => Some(PixelFormat::Rgb565),
            32 => Some(PixelFormat::Xrgb8888),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Indexed8 => 1,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Xrgb8888 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Fixed opacity applied to every pixel of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alpha {
    pub opacity: u8,
}

/// Everything the compositor needs to place a new element on screen.
#[derive(Debug, Clone, Copy)]
pub struct ElementDesc {
    pub display: DisplayHandle,
    pub layer: i32,
    pub dst: Rect,
    /// Source rectangle in 16.16 fixed point.
    pub src: Rect,
    pub resource: ResourceHandle,
    pub alpha: Alpha,
}

pub trait DisplayProvider {
    fn open(&self, id: u32) -> Result<DisplayHandle, HwError>;
    fn close(&self, display: DisplayHandle);
    /// Physical size in pixels. May report zero on some firmware.
    fn size(&self, display: DisplayHandle) -> Result<(u32, u32), HwError>;
}

pub trait ResourceAllocator {
    fn create(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ResourceHandle, HwError>;
    fn delete(&self, resource: ResourceHandle);
    /// Copies `data`, laid out with `pitch` bytes per row, into `rect` of the
    /// resource. Synchronous.
    fn write(
        &self,
        resource: ResourceHandle,
        format: PixelFormat,
        pitch: u32,
        data: &[u8],
        rect: Rect,
    ) -> Result<(), HwError>;
    /// RGB565 palette for indexed resources.
    fn set_palette(&self, resource: ResourceHandle, palette: &[u16]) -> Result<(), HwError>;
}

pub trait Compositor {
    fn begin(&self) -> Result<Update, HwError>;
    fn add_element(&self, update: &Update, desc: ElementDesc) -> Result<ElementHandle, HwError>;
    fn change_source(
        &self,
        update: &Update,
        element: ElementHandle,
        resource: ResourceHandle,
    ) -> Result<(), HwError>;
    fn remove_element(&self, update: &Update, element: ElementHandle) -> Result<(), HwError>;
    /// Applies the update and blocks until it is on screen.
    fn submit_sync(&self, update: Update) -> Result<(), HwError>;
    /// Queues the update for the next vsync. The binding must call
    /// [`FlipToken::complete`] once the change is visible, from any thread.
    /// Dropping the token instead marks the flip as never having happened.
    fn submit_async(&self, update: Update, token: FlipToken) -> Result<(), HwError>;
}

pub trait Hardware: DisplayProvider + ResourceAllocator + Compositor + Send + Sync {}

impl<T> Hardware for T where T: DisplayProvider + ResourceAllocator + Compositor + Send + Sync {}
