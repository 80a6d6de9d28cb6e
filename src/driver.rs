// Driver lifecycle - mode setting and frame updates on top of the flip core
//
// The device is opened lazily on the first real mode-set: callers that drive
// the display themselves and only set a 0x0 mode never touch the hardware.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    config::Config,
    hw::{Hardware, PixelFormat},
    present::{submit_frame, Device, FlipReceipt, PresentError, Surface, SurfaceParams},
};

/// A palette entry as handed in by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn to_rgb565(self) -> u16 {
        (((self.r as u16) >> 3) << 11) | (((self.g as u16) >> 2) << 5) | ((self.b as u16) >> 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub pitch: u32,
}

const PALETTE_SIZE: usize = 256;

pub struct VideoDriver {
    hw: Arc<dyn Hardware>,
    config: Config,
    device: Option<Arc<Device>>,
    main: Option<Surface>,
    background: Option<Surface>,
    mode: Option<ModeInfo>,
    pixels: Vec<u8>,
    palette: [u16; PALETTE_SIZE],
}

impl VideoDriver {
    pub fn new(hw: Arc<dyn Hardware>, config: Config) -> Self {
        Self {
            hw,
            config,
            device: None,
            main: None,
            background: None,
            mode: None,
            pixels: Vec::new(),
            palette: [0; PALETTE_SIZE],
        }
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn main_surface(&self) -> Option<&Surface> {
        self.main.as_ref()
    }

    pub fn background_surface(&self) -> Option<&Surface> {
        self.background.as_ref()
    }

    pub fn mode(&self) -> Option<ModeInfo> {
        self.mode
    }

    /// Sets a `width`x`height` mode at `bpp` bits per pixel.
    ///
    /// A 0x0 mode leaves the hardware alone and returns `Ok(None)`. Any
    /// previous main surface is drained and replaced.
    pub fn set_mode(
        &mut self,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> Result<Option<ModeInfo>, PresentError> {
        if width == 0 || height == 0 {
            debug!("Empty mode requested, leaving the display to the caller");
            return Ok(None);
        }
        // Reject before anything is torn down, so the current mode survives.
        if PixelFormat::from_depth(bpp).is_none() {
            return Err(PresentError::UnsupportedDepth(bpp));
        }

        let device = self.open_device()?;
        let aspect = self.config.aspect_for(width, height, device.size());
        let pitch = width * bpp / 8;

        if let Some(previous) = self.main.take() {
            previous.teardown();
        }
        self.mode = None;
        self.pixels.clear();

        let surface = Surface::setup(
            &device,
            SurfaceParams {
                width,
                height,
                visible_pitch: pitch,
                bpp,
                opacity: self.config.surface.opacity,
                aspect,
                pages: self.config.surface.pages,
                layer: self.config.surface.layer,
            },
        )?;

        let mode = ModeInfo {
            width,
            height,
            bpp,
            pitch,
        };
        info!(
            "Mode set to {}x{}x{} (aspect {:.3}, dst {:?})",
            width,
            height,
            bpp,
            aspect,
            surface.dst_rect()
        );
        self.pixels = vec![0; (pitch * height) as usize];
        self.main = Some(surface);
        self.mode = Some(mode);
        Ok(Some(mode))
    }

    fn open_device(&mut self) -> Result<Arc<Device>, PresentError> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }

        let display = &self.config.display;
        let device = Device::open(self.hw.clone(), display.id, (display.width, display.height))?;
        self.device = Some(device.clone());

        if self.config.surface.blank_console {
            match blank_console(&device) {
                Ok(surface) => self.background = Some(surface),
                Err(err) => warn!("Failed to blank the console: {}", err),
            }
        }
        Ok(device)
    }

    /// The frame buffer the application draws into, `pitch * height` bytes.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Presents the current contents of [`Self::pixels_mut`].
    pub fn update(&self) -> Result<FlipReceipt, PresentError> {
        let surface = self.main.as_ref().ok_or(PresentError::NoSurface)?;
        submit_frame(surface, &self.pixels)
    }

    /// Loads `colors` into the palette starting at `first` and attaches it to
    /// every page of the main surface.
    pub fn set_colors(&mut self, first: usize, colors: &[Rgb]) -> Result<(), PresentError> {
        let surface = self.main.as_ref().ok_or(PresentError::NoSurface)?;
        for (slot, color) in self.palette.iter_mut().skip(first).zip(colors) {
            *slot = color.to_rgb565();
        }
        surface.set_palette(&self.palette)
    }

    /// Drains and releases both surfaces, then closes the display.
    pub fn quit(&mut self) {
        if let Some(main) = self.main.take() {
            main.teardown();
        }
        if let Some(background) = self.background.take() {
            background.teardown();
        }
        self.mode = None;
        self.pixels = Vec::new();
        if self.device.take().is_some() {
            debug!("Video driver shut down");
        }
    }
}

impl Drop for VideoDriver {
    fn drop(&mut self) {
        self.quit();
    }
}

/// A 2x2 black surface behind everything else, flipped once. A single pixel
/// does not write correctly on all firmware, hence two.
fn blank_console(device: &Arc<Device>) -> Result<Surface, PresentError> {
    let (width, height) = device.size();
    let surface = Surface::setup(
        device,
        SurfaceParams {
            width: 2,
            height: 2,
            visible_pitch: 4,
            bpp: 16,
            opacity: 255,
            aspect: width as f32 / height as f32,
            pages: 1,
            layer: -1,
        },
    )?;
    submit_frame(&surface, &[0u8; 8])?;
    Ok(surface)
}
