//! Buffer exchange between clients and the compositor, and the threads that
//! drive composition
//!
//! # Layers
//!
//! - [`arbiter`]: per-consumer frame cursors for one stream
//! - [`swapper`]: the buffer pool state machine for one stream, one lock
//! - [`stream`]: what clients and the scene talk to; owns and replaces the
//!   swapper, hands out RAII compositor buffers
//! - [`frame_dropping`]: timeout policy that unsticks blocked clients
//! - [`bypass`]: decides when a single fullscreen buffer can be scanned out
//! - [`multi_threaded`]: one compositing thread per display sync group
//! - [`frame_pacing`]: per-thread composition timing statistics

use crate::graphics::{AllocError, BufferId};
use std::fmt;
use thiserror::Error;

pub mod arbiter;
pub mod bypass;
pub mod frame_dropping;
pub mod frame_pacing;
pub mod multi_threaded;
pub mod stream;
pub mod swapper;

pub use arbiter::MultiMonitorArbiter;
pub use bypass::{BypassMatch, CompositingCriteria};
pub use frame_dropping::{
    DropFrame, FrameDroppingPolicy, FrameDroppingPolicyFactory, TimeoutFrameDroppingPolicy,
    TimeoutFrameDroppingPolicyFactory,
};
pub use frame_pacing::{FramePacer, FrameStats};
pub use multi_threaded::{CompositorSettings, CompositorStats, MultiThreadedCompositor};
pub use stream::{BufferStream, CompositorBuffer, FrameObserverId, SnapshotBuffer, StreamConfig};
pub use swapper::{BufferSwapper, DropOutcome, SwapPolicy, SwapperCensus};

/// Identity of one buffer consumer, typically one output's compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Errors surfaced by the swap paths
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwapperError {
    #[error("buffer swapper stopped")]
    Stopped,

    #[error("a swapper needs at least 2 buffers, got {0}")]
    InvalidBufferCount(usize),

    #[error("buffer {0} is not owned by the client")]
    NotOwnedByClient(BufferId),

    #[error("client released buffer {released} before {expected}")]
    OutOfOrderRelease {
        expected: BufferId,
        released: BufferId,
    },

    #[error("buffer {0} is not held by this compositor")]
    NotHeldByCompositor(BufferId),

    #[error("no buffer has been submitted yet")]
    NothingSubmitted,

    #[error("buffer {0} is already queued for composition")]
    AlreadySubmitted(BufferId),

    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] AllocError),
}

/// Errors from compositor lifecycle management
#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("compositing thread for sync group {group} failed to start: {reason}")]
    ThreadStartFailed { group: usize, reason: String },

    #[error("failed to spawn compositing thread: {0}")]
    Spawn(#[from] std::io::Error),
}
