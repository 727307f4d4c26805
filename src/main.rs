//! v4l2-capturer binary: acquires a bounded number of frames and reports their sizes.
//!
//! Usage: `v4l2-capturer [config.toml]`. `CAPTURE_*` environment variables
//! override file values, `RUST_LOG` controls verbosity.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use v4l2_capturer::{CaptureConfig, CaptureError, CaptureSession, Result};

/// Consecutive retryable outcomes tolerated before giving up.
const MAX_IDLE_WAITS: u32 = 10;

#[derive(Default)]
struct FrameStats {
    frames: AtomicU64,
    bytes: AtomicU64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        error!(error = %err, "capture failed");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = CaptureConfig::load(config_path.as_deref())?;
    config.validate()?;

    let mut session = CaptureSession::open(&config.device)?;
    info!(
        driver = %session.capabilities().driver,
        card = %session.capabilities().card,
        "capturing from {}",
        session.device_path()
    );

    session.configure(config.width, config.height, config.format, config.bitrate)?;

    let stats = Arc::new(FrameStats::default());
    let sink = Arc::clone(&stats);
    session.set_frame_callback(move |data| {
        let frame = sink.frames.fetch_add(1, Ordering::Relaxed);
        sink.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!(frame, size = data.len(), "frame");
    });

    session.start_streaming()?;
    let captured = capture(&mut session, &config, &stats);
    let stopped = session.stop_streaming();
    let closed = session.close();
    captured.and(stopped).and(closed)?;

    info!(
        frames = stats.frames.load(Ordering::Relaxed),
        bytes = stats.bytes.load(Ordering::Relaxed),
        "capture finished"
    );
    Ok(())
}

fn capture(session: &mut CaptureSession, config: &CaptureConfig, stats: &FrameStats) -> Result<()> {
    let mut idle = 0;
    while stats.frames.load(Ordering::Relaxed) < u64::from(config.frame_count) {
        match session.run(config.timeout()) {
            Ok(()) => idle = 0,
            Err(err) if err.is_retryable() => {
                idle += 1;
                if idle >= MAX_IDLE_WAITS {
                    return Err(CaptureError::Timeout);
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
