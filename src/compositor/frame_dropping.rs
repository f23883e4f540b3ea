//! Timeout-based frame dropping
//!
//! A client stuck waiting for a buffer (because an output stopped consuming)
//! is released after a timeout by dropping the oldest unheld frame. The
//! swapper tells the policy when a request starts waiting and when one is
//! satisfied; the policy arms an alarm for the first waiter and re-arms it
//! while more are queued. A drop that finds every frame held leaves the
//! waiter queued and the alarm armed for another try.

use crate::time::{Alarm, Timer};
use log::debug;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Hooks the swapper calls around client waits. Called with the swapper's
/// lock held, so implementations must not call back into the swapper.
pub trait FrameDroppingPolicy: Send + Sync {
    fn swap_now_blocking(&self);
    fn swap_unblocked(&self);
}

/// Called when the timeout expires. Returns false while a client is still
/// waiting because nothing could be dropped.
pub type DropFrame = Box<dyn Fn() -> bool + Send + Sync>;

/// Builds one policy per swapper. `drop_frame` is what the policy calls when
/// its timeout expires.
pub trait FrameDroppingPolicyFactory: Send + Sync {
    fn create_policy(&self, drop_frame: DropFrame) -> Box<dyn FrameDroppingPolicy>;
}

struct PolicyState {
    pending_swaps: u32,
    alarm: Option<Box<dyn Alarm>>,
}

pub struct TimeoutFrameDroppingPolicy {
    state: Arc<Mutex<PolicyState>>,
    timeout: Duration,
}

impl TimeoutFrameDroppingPolicy {
    pub fn new(timer: &dyn Timer, timeout: Duration, drop_frame: DropFrame) -> Self {
        let state = Arc::new(Mutex::new(PolicyState {
            pending_swaps: 0,
            alarm: None,
        }));

        let weak: Weak<Mutex<PolicyState>> = Arc::downgrade(&state);
        let alarm = timer.create_alarm(Box::new(move || {
            let settled = drop_frame();

            let Some(state) = weak.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if settled {
                state.pending_swaps = state.pending_swaps.saturating_sub(1);
            } else {
                debug!("⏲️ Nothing to drop yet, retrying in {:?}", timeout);
            }
            if state.pending_swaps > 0 {
                if let Some(alarm) = &state.alarm {
                    alarm.reschedule_in(timeout);
                }
            }
        }));
        state.lock().alarm = Some(alarm);

        Self { state, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Client requests still waiting as far as the policy knows
    pub fn pending_swaps(&self) -> u32 {
        self.state.lock().pending_swaps
    }
}

impl FrameDroppingPolicy for TimeoutFrameDroppingPolicy {
    fn swap_now_blocking(&self) {
        let mut state = self.state.lock();
        state.pending_swaps += 1;
        if state.pending_swaps == 1 {
            if let Some(alarm) = &state.alarm {
                alarm.reschedule_in(self.timeout);
            }
            debug!("⏲️ Frame drop armed for {:?}", self.timeout);
        }
    }

    fn swap_unblocked(&self) {
        let mut state = self.state.lock();
        let cancelled = state.alarm.as_ref().map(|alarm| alarm.cancel()).unwrap_or(false);
        if !cancelled {
            // Already fired; the alarm callback does the bookkeeping
            return;
        }

        state.pending_swaps = state.pending_swaps.saturating_sub(1);
        if state.pending_swaps > 0 {
            if let Some(alarm) = &state.alarm {
                alarm.reschedule_in(self.timeout);
            }
        }
    }
}

impl Drop for TimeoutFrameDroppingPolicy {
    fn drop(&mut self) {
        if let Some(alarm) = self.state.lock().alarm.take() {
            alarm.cancel();
        }
    }
}

pub struct TimeoutFrameDroppingPolicyFactory {
    timer: Arc<dyn Timer>,
    timeout: Duration,
}

impl TimeoutFrameDroppingPolicyFactory {
    pub fn new(timer: Arc<dyn Timer>, timeout: Duration) -> Self {
        Self { timer, timeout }
    }
}

impl FrameDroppingPolicyFactory for TimeoutFrameDroppingPolicyFactory {
    fn create_policy(&self, drop_frame: DropFrame) -> Box<dyn FrameDroppingPolicy> {
        Box::new(TimeoutFrameDroppingPolicy::new(
            self.timer.as_ref(),
            self.timeout,
            drop_frame,
        ))
    }
}
