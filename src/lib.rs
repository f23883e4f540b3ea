//! # mir-compositor
//!
//! Buffer exchange and compositor scheduling for a display server: client
//! threads render into a small pool of buffers per surface, compositing
//! threads (one per group of outputs that flip together) pull the newest
//! frames and post them, and a timer-driven policy keeps clients moving when
//! the compositor stops consuming.
//!
//! ## Architecture
//!
//! - `graphics`: buffers, ids, and the allocator seam
//! - `compositor`: swapper, multi-monitor arbiter, buffer stream, frame
//!   dropping policy, bypass predicate, and the compositing threads
//! - `scene`: the surface stack compositing threads draw from
//! - `display`: output/sync group seam and a headless backend
//! - `time`: alarms on a tokio runtime, plus a fake clock for tests
//! - `config`: configuration parsing and management
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mir_compositor::compositor::{BufferStream, CompositorSettings, MultiThreadedCompositor};
//! use mir_compositor::display::HeadlessDisplay;
//! use mir_compositor::geometry::Rectangle;
//! use mir_compositor::graphics::ShmAllocator;
//! use mir_compositor::scene::SurfaceStack;
//! use mir_compositor::MirConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = MirConfig::default();
//!     let display = Arc::new(HeadlessDisplay::side_by_side(2, 1920, 1080, Duration::from_millis(16)));
//!     let scene = Arc::new(SurfaceStack::new());
//!
//!     let stream = Arc::new(BufferStream::new(
//!         (&config.buffers).into(),
//!         config.buffers.properties(),
//!         Arc::new(ShmAllocator::new()),
//!         None,
//!     )?);
//!     scene.add_surface(Arc::clone(&stream), Rectangle::new(0, 0, 1920, 1080));
//!
//!     let compositor = MultiThreadedCompositor::new(
//!         display,
//!         scene.clone(),
//!         scene,
//!         CompositorSettings::from(&config),
//!     );
//!     compositor.start()?;
//!
//!     let buffer = stream.swap_buffers_blocking(None)?;
//!     buffer.map()?.fill(0xff336699);
//!     stream.submit_buffer(&buffer, buffer.size(), Rectangle::from_size(buffer.size()))?;
//!
//!     compositor.stop();
//!     Ok(())
//! }
//! ```

pub mod compositor;
pub mod config;
pub mod display;
pub mod geometry;
pub mod graphics;
pub mod scene;
pub mod time;

// Re-export main types for easy access
pub use compositor::{BufferStream, BufferSwapper, MultiThreadedCompositor};
pub use config::MirConfig;
pub use scene::SurfaceStack;

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for mir-compositor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
