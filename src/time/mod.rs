//! One-shot alarms
//!
//! The frame dropping policy needs "call me back in N ms unless I cancel
//! first". [`Timer`] is the seam: production code runs alarms on the tokio
//! runtime, tests drive a [`FakeTimer`] by hand.
//!
//! Callbacks never run while an alarm's own lock is held, so a callback may
//! reschedule or cancel the alarm that fired it.

use std::time::Duration;

mod fake;
mod tokio_timer;

pub use fake::FakeTimer;
pub use tokio_timer::TokioTimer;

/// Boxed alarm callback
pub type AlarmCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    /// Armed and waiting for its deadline
    Pending,
    /// Fired, or never armed
    Triggered,
    Cancelled,
}

pub trait Alarm: Send + Sync {
    /// Arms (or re-arms) the alarm `delay` from now. Returns true if the
    /// alarm was already pending.
    fn reschedule_in(&self, delay: Duration) -> bool;

    /// Disarms a pending alarm. Returns false if it was not pending.
    fn cancel(&self) -> bool;

    fn state(&self) -> AlarmState;
}

pub trait Timer: Send + Sync {
    /// Creates a disarmed alarm that runs `callback` each time it fires
    fn create_alarm(&self, callback: AlarmCallback) -> Box<dyn Alarm>;
}
