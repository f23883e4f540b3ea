use super::{Alarm, AlarmCallback, AlarmState, Timer};
use log::trace;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Runs alarms as sleeping tasks on a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Timer for TokioTimer {
    fn create_alarm(&self, callback: AlarmCallback) -> Box<dyn Alarm> {
        Box::new(TokioAlarm {
            handle: self.handle.clone(),
            callback: Arc::from(callback),
            inner: Arc::new(Mutex::new(AlarmInner {
                state: AlarmState::Triggered,
                task: None,
                generation: 0,
            })),
        })
    }
}

struct AlarmInner {
    state: AlarmState,
    task: Option<JoinHandle<()>>,
    /// Bumped on every reschedule so a task that lost the race to `abort`
    /// does not fire
    generation: u64,
}

struct TokioAlarm {
    handle: Handle,
    callback: Arc<dyn Fn() + Send + Sync>,
    inner: Arc<Mutex<AlarmInner>>,
}

impl Alarm for TokioAlarm {
    fn reschedule_in(&self, delay: Duration) -> bool {
        let mut inner = self.inner.lock();
        let was_pending = inner.state == AlarmState::Pending;
        if let Some(task) = inner.task.take() {
            task.abort();
        }

        inner.generation += 1;
        inner.state = AlarmState::Pending;

        let generation = inner.generation;
        let shared = Arc::clone(&self.inner);
        let callback = Arc::clone(&self.callback);
        inner.task = Some(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = shared.lock();
                if inner.generation != generation || inner.state != AlarmState::Pending {
                    return;
                }
                inner.state = AlarmState::Triggered;
                inner.task = None;
            }
            trace!("⏰ Alarm fired after {:?}", delay);
            callback();
        }));

        was_pending
    }

    fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != AlarmState::Pending {
            return false;
        }

        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.state = AlarmState::Cancelled;
        true
    }

    fn state(&self) -> AlarmState {
        self.inner.lock().state
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        self.cancel();
    }
}
