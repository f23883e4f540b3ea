//! Display backend seam
//!
//! Outputs that must flip together form a [`DisplaySyncGroup`]; the
//! compositor runs one thread per group. Each output is a [`DisplayBuffer`]
//! that either scans a client buffer out directly or renders a list of
//! layers. Nothing reaches the screen until the group is committed.

use crate::geometry::Rectangle;
use crate::graphics::Buffer;
use cgmath::Matrix4;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod headless;

pub use headless::{HeadlessDisplay, HeadlessOutput, HeadlessSyncGroup, OutputRecord};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("post to output {area} failed: {reason}")]
    PostFailed { area: Rectangle, reason: String },

    #[error("display sync group commit failed: {0}")]
    CommitFailed(String),
}

/// One buffer placed on an output for composition
#[derive(Debug, Clone)]
pub struct Layer {
    pub buffer: Arc<Buffer>,
    pub position: Rectangle,
    /// Part of the buffer shown, scaled to fill `position`
    pub src_bounds: Rectangle,
    pub alpha: f32,
    pub transformation: Matrix4<f32>,
}

pub trait DisplayBuffer: Send + Sync {
    /// Area of the global layout this output shows
    fn view_area(&self) -> Rectangle;

    /// Scans `buffer` out directly, skipping composition
    fn post(&self, buffer: &Arc<Buffer>) -> Result<(), DisplayError>;

    /// Composites `layers` (bottom to top) into the output's back buffer
    fn render_and_post(&self, layers: &[Layer]) -> Result<(), DisplayError>;
}

pub trait DisplaySyncGroup: Send + Sync {
    fn display_buffers(&self) -> Vec<Arc<dyn DisplayBuffer>>;

    /// Flips every output of the group at once
    fn commit(&self) -> Result<(), DisplayError>;

    /// How long to wait after a commit before compositing again
    fn recommended_sleep(&self) -> Duration;
}

pub trait Display: Send + Sync {
    fn sync_groups(&self) -> Vec<Arc<dyn DisplaySyncGroup>>;
}

/// Told when compositing starts and stops on an output
pub trait DisplayListener: Send + Sync {
    fn add_display(&self, area: &Rectangle);
    fn remove_display(&self, area: &Rectangle);
}
