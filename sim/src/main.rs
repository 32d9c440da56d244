use std::sync::Arc;

use anyhow::Context;
use scanout_kms::drivers::gem::{Bo, BoRequest};
use scanout_kms::{DisplayMode, KmsConfig, ModeSwitchEngine, Rotation, VirtualDrm};
use tracing::info;
use tracing_subscriber::EnvFilter;

const HEAD_MODES: [(u16, u16); 3] = [(1920, 1080), (1280, 1024), (1024, 768)];

fn arg_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter().position(|a| a == name).and_then(|i| args.get(i + 1)).map(String::as_str)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let heads: usize = arg_value(&args, "--heads").unwrap_or("2").parse().context("--heads expects a number")?;
    let frames: usize = arg_value(&args, "--frames").unwrap_or("4").parse().context("--frames expects a number")?;
    let config = KmsConfig::parse(arg_value(&args, "--options").unwrap_or("")).context("invalid --options")?;
    let driver = arg_value(&args, "--driver").unwrap_or("vkms");

    if heads == 0 || heads > HEAD_MODES.len() {
        anyhow::bail!("--heads must be between 1 and {}", HEAD_MODES.len());
    }

    let mut builder = VirtualDrm::builder().driver(driver).crtcs(heads);
    for &(w, h) in &HEAD_MODES[..heads] {
        builder = builder.connector(11, w, h);
    }
    let drm = Arc::new(builder.build());

    let width: u32 = HEAD_MODES[..heads].iter().map(|&(w, _)| w as u32).sum();
    let height: u32 = HEAD_MODES[..heads].iter().map(|&(_, h)| h as u32).max().unwrap_or(0);
    let mut engine = ModeSwitchEngine::new(drm.clone(), config, width, height).context("bringing up the display")?;

    let mut x = 0;
    for (crtc, &(w, h)) in HEAD_MODES[..heads].iter().enumerate() {
        engine
            .set_mode(crtc, DisplayMode::new(w, h, 60), Rotation::ROTATE_0, x, 0)
            .with_context(|| format!("mode set on head {}", crtc))?;
        x += w as i32;
    }
    engine.root().clear().context("clearing the root buffer")?;

    if engine.config().flip {
        engine.enter_flip_mode().context("entering flip mode")?;
        for frame in 0..frames {
            for crtc in 0..heads {
                let rect = engine.crtc(crtc)?.geometry();
                let request = BoRequest::Dimensions { width: rect.width, height: rect.height, depth: 24, bpp: 32 };
                let bo = Bo::create(engine.device(), request).context("allocating a client buffer")?;
                engine.page_flip(crtc, &bo).with_context(|| format!("flip {} on head {}", frame, crtc))?;
            }
            let completed = engine.handle_events().context("reading flip events")?;
            info!("sim: frame {} completed {} flips", frame, completed);
        }
        engine.enter_blit_mode().context("returning to blit mode")?;
    }

    if engine.cursor().is_some() {
        engine.show_cursor(0)?;
        engine.move_cursor(0, 100, 100)?;
    }

    let pitch = engine.resize(width + 256, height + 128).context("resizing the screen")?;
    info!("sim: resized to {}x{} pitch {}", width + 256, height + 128, pitch);

    for notification in engine.take_notifications() {
        info!("sim: {:?}", notification);
    }
    info!(
        "sim: done, {} buffers live, {} destroyed, {} set_crtc calls",
        drm.buffer_count(),
        drm.destroyed_handles().len(),
        drm.set_crtc_calls()
    );
    Ok(())
}
