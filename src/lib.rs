pub mod config;
pub mod driver;
pub mod hw;
pub mod present;

pub use config::Config;
pub use driver::{ModeInfo, Rgb, VideoDriver};
pub use present::{submit_frame, FlipReceipt, FlipToken, PresentError, Presented, Surface};
