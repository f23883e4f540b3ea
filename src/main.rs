//! # mir-compositor - headless demo
//!
//! Runs the compositing threads against in-memory outputs while a handful of
//! simulated clients render frames at jittery rates, then reports what every
//! output showed.
//!
//! ## Architecture Overview
//!
//! - `compositor`: swapper, arbiter, buffer stream, and compositing threads
//! - `scene`: surface stack
//! - `display`: headless outputs
//! - `time`: alarms on the tokio runtime for frame dropping
//! - `config`: configuration parsing and management

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use mir_compositor::compositor::{
    BufferStream, CompositorSettings, FrameDroppingPolicyFactory, MultiThreadedCompositor,
    SwapperError, TimeoutFrameDroppingPolicyFactory,
};
use mir_compositor::display::HeadlessDisplay;
use mir_compositor::geometry::Rectangle;
use mir_compositor::graphics::{GraphicBufferAllocator, ShmAllocator};
use mir_compositor::scene::SurfaceStack;
use mir_compositor::time::TokioTimer;
use mir_compositor::MirConfig;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

const REFRESH: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(name = "mir-compositor")]
#[command(about = "Headless demo of the buffer swapping and compositing core")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/mir/mir.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Number of simulated clients
    #[arg(long, default_value_t = 3)]
    clients: usize,

    /// Number of headless outputs, laid out left to right
    #[arg(long, default_value_t = 2)]
    outputs: usize,

    /// Frames each client renders before exiting
    #[arg(long, default_value_t = 120)]
    frames: usize,

    /// Let clients overwrite frames the compositor has not shown yet
    #[arg(long)]
    framedropping: bool,

    /// Put every output in one sync group
    #[arg(long)]
    mirrored: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting mir-compositor headless demo");
    info!(
        "📄 Version: {} ({}, {}, built {})",
        mir_compositor::VERSION,
        option_env!("GIT_COMMIT").unwrap_or("unknown commit"),
        env!("TARGET_TRIPLE"),
        env!("BUILD_DATE")
    );

    // Load configuration
    let mut config = match MirConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            warn!("⚠️ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            MirConfig::default()
        }
    };

    // Override config with CLI flags
    if cli.framedropping {
        config.buffers.framedropping = true;
        info!("🏎️ Framedropping enabled via CLI flag");
    }
    config.validate().context("Invalid configuration")?;

    let outputs = cli.outputs.max(1);
    let (width, height) = (config.buffers.width, config.buffers.height);
    let areas: Vec<Rectangle> = (0..outputs)
        .map(|i| Rectangle::new(i as i32 * width as i32, 0, width, height))
        .collect();
    let display = Arc::new(if cli.mirrored {
        HeadlessDisplay::mirrored(&areas, REFRESH)
    } else {
        HeadlessDisplay::new(&areas, REFRESH)
    });

    let scene = Arc::new(SurfaceStack::new());
    let allocator: Arc<dyn GraphicBufferAllocator> = Arc::new(ShmAllocator::new());
    let policies: Option<Arc<dyn FrameDroppingPolicyFactory>> = if config.frame_dropping.enabled {
        info!(
            "⏱️ Frame dropping policy armed with a {:?} timeout",
            config.frame_dropping.timeout()
        );
        Some(Arc::new(TimeoutFrameDroppingPolicyFactory::new(
            Arc::new(TokioTimer::current()),
            config.frame_dropping.timeout(),
        )))
    } else {
        None
    };

    let mut streams = Vec::new();
    for i in 0..cli.clients {
        let stream = Arc::new(
            BufferStream::new(
                (&config.buffers).into(),
                config.buffers.properties(),
                Arc::clone(&allocator),
                policies.clone(),
            )
            .with_context(|| format!("Failed to create stream for client {}", i))?,
        );
        let area = areas[i % outputs];
        scene.add_surface(Arc::clone(&stream), area);
        streams.push(stream);
    }

    let compositor = MultiThreadedCompositor::new(
        display.clone(),
        scene.clone(),
        scene.clone(),
        CompositorSettings::from(&config),
    );
    compositor.start().context("Failed to start compositor")?;
    info!("✨ Compositing {} outputs for {} clients", outputs, cli.clients);

    let clients: Vec<_> = streams
        .iter()
        .enumerate()
        .map(|(index, stream)| {
            let stream = Arc::clone(stream);
            let frames = cli.frames;
            tokio::task::spawn_blocking(move || run_client(index, &stream, frames))
        })
        .collect();

    let all_done = async {
        let mut rendered = 0;
        for client in clients {
            match client.await {
                Ok(Ok(frames)) => rendered += frames,
                Ok(Err(e)) => warn!("⚠️ Client stopped early: {}", e),
                Err(e) => error!("❌ Client task failed: {}", e),
            }
        }
        rendered
    };
    tokio::pin!(all_done);

    let rendered = tokio::select! {
        rendered = &mut all_done => rendered,
        _ = tokio::signal::ctrl_c() => {
            info!("📨 Received Ctrl+C, shutting down gracefully");
            for stream in &streams {
                stream.force_client_abort();
            }
            all_done.await
        }
    };

    for (group, stats) in compositor.frame_stats().iter().enumerate() {
        info!(
            "⏲️ Group {}: {:.1} fps, avg pass {:?}, {} of {} passes over budget",
            group, stats.current_fps, stats.avg_frame_time, stats.missed_frames, stats.total_frames
        );
    }

    compositor.stop();
    report(&display, &compositor, rendered);
    Ok(())
}

/// Renders `frames` frames into the stream, pausing a random few ms between them
fn run_client(index: usize, stream: &BufferStream, frames: usize) -> Result<usize, SwapperError> {
    let mut rng = rand::thread_rng();
    let color = 0xff00_0000 | rng.gen_range(0..0x00ff_ffff);
    let mut buffer = stream.swap_buffers_blocking(None)?;

    for frame in 0..frames {
        if let Ok(mut mapping) = buffer.map() {
            mapping.fill(color ^ frame as u32);
        }
        buffer = stream.swap_buffers_blocking(Some(buffer))?;
        std::thread::sleep(Duration::from_millis(rng.gen_range(4..24)));
    }

    info!("🎨 Client {} rendered {} frames", index, frames);
    Ok(frames)
}

fn report(display: &HeadlessDisplay, compositor: &MultiThreadedCompositor, rendered: usize) {
    let stats = compositor.stats();
    info!("📊 Clients rendered {} frames", rendered);
    info!(
        "📊 Compositor: {} passes, {} composited, {} bypassed, {} post failures",
        stats.passes(),
        stats.frames_composited(),
        stats.frames_bypassed(),
        stats.post_failures()
    );

    for (index, output) in display.outputs().iter().enumerate() {
        let record = output.record();
        info!(
            "🖥️ Output {}: {} rendered, {} bypassed, last frame had {} layers",
            index,
            record.frames_rendered,
            record.frames_bypassed,
            record.last_layers.len()
        );
    }
}
