use std::sync::Arc;

use anyhow::{bail, Context};
use pageflip::{hw::soft::SoftHardware, Config, VideoDriver};

const DEFAULT_FRAMES: u32 = 120;
const REFRESH_HZ: f64 = 60.0;

static USAGE: &[&str] = &[
    "--frames N : number of frames to present (default 120).",
    "--manual : fire every vsync by hand right after submission.",
];

struct Args {
    frames: u32,
    manual: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        frames: DEFAULT_FRAMES,
        manual: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--frames" => {
                let value = iter.next().context("--frames needs a value")?;
                args.frames = value
                    .parse()
                    .with_context(|| format!("invalid frame count {value:?}"))?;
            }
            "--manual" => args.manual = true,
            other => {
                tracing::error!("Unknown argument: {}", other);
                println!("USAGE: pageflip [options]");
                println!();
                for line in USAGE {
                    println!("\t{}", line);
                }
                bail!("unknown argument {other:?}");
            }
        }
    }
    Ok(args)
}

/// Horizontal gradient scrolling one column per frame, RGB565.
fn draw(pixels: &mut [u8], width: u32, pitch: u32, frame: u32) {
    for (y, row) in pixels.chunks_exact_mut(pitch as usize).enumerate() {
        for x in 0..width as usize {
            let shade = ((x as u32 + frame) * 31 / width.max(1)) as u16 & 0x1f;
            let pixel = (shade << 11) | ((y as u16 & 0x3f) << 5) | (31 - shade);
            row[x * 2..x * 2 + 2].copy_from_slice(&pixel.to_le_bytes());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .compact()
            .init();
    }

    profiling::register_thread!("Main Thread");

    let args = parse_args()?;
    let config = Config::with(|c| c.clone());
    let (width, height) = (
        if config.display.width > 0 { config.display.width } else { 1280 },
        if config.display.height > 0 { config.display.height } else { 720 },
    );

    let hw = Arc::new(if args.manual {
        SoftHardware::manual(width, height)
    } else {
        SoftHardware::with_vsync(width, height, REFRESH_HZ)
    });

    let producer_hw = hw.clone();
    let presented = tokio::task::spawn_blocking(move || -> anyhow::Result<u32> {
        let mut driver = VideoDriver::new(producer_hw.clone(), config);
        let mode = driver
            .set_mode(320, 240, 16)
            .context("failed to set video mode")?
            .context("video mode was not applied")?;
        if args.manual {
            producer_hw.fire_next();
        }

        let mut presented = 0;
        for frame in 0..args.frames {
            draw(driver.pixels_mut(), mode.width, mode.pitch, frame);
            let receipt = driver.update().context("failed to submit frame")?;
            if args.manual {
                producer_hw.fire_next();
            }
            if let Some(done) = receipt.wait() {
                tracing::debug!("frame {} on page {} (flip #{})", frame, done.page, done.sequence);
                presented += 1;
            }
        }
        driver.quit();
        Ok(presented)
    })
    .await
    .context("producer thread panicked")??;

    tracing::info!(
        "Presented {} of {} frames ({} flips total)",
        presented,
        args.frames,
        hw.flips_presented()
    );
    Ok(())
}
