//! Page-flip presentation core.
//!
//! A producer writes a frame into a free page of a [`Surface`], the page is
//! flipped onto the screen at the next vsync, and the page that was visible
//! before is reclaimed when the hardware confirms the flip:
//!
//! - [`submit_frame`] waits for the device's single flip slot, claims a free
//!   page, copies the pixels and submits the flip with a [`FlipToken`]
//! - [`FlipToken::complete`] runs on the hardware's thread, frees the old
//!   visible page, records the new one and wakes every waiter
//! - [`Surface::teardown`] drains the outstanding flip before releasing pages
//!
//! All waits share the [`Device`] condition and re-check their own predicate.

mod device;
mod flip;
mod page;
mod surface;

pub use device::Device;
pub use flip::{submit_frame, FlipReceipt, FlipToken, Presented};
pub use page::PageId;
pub use surface::{dst_rect_for, Surface, SurfaceId, SurfaceParams};

use crate::hw::HwError;

#[derive(Debug, thiserror::Error)]
pub enum PresentError {
    #[error("unsupported pixel depth {0} (expected 8, 16 or 32)")]
    UnsupportedDepth(u32),
    #[error("surface and display dimensions must be non-zero")]
    ZeroDimension,
    #[error("a surface needs at least one page")]
    ZeroPages,
    #[error("pitch {pitch} is too small for {width} pixels at {bpp} bpp")]
    InvalidPitch { pitch: u32, width: u32, bpp: u32 },
    #[error("frame holds {actual} bytes, surface needs {expected}")]
    ShortFrame { expected: usize, actual: usize },
    #[error("every page is in use and no flip is pending to free one")]
    NoFreePage,
    #[error("no video mode has been set")]
    NoSurface,
    #[error(transparent)]
    Hardware(#[from] HwError),
}
