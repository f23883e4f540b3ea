use super::{Alarm, AlarmCallback, AlarmState, Timer};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Manually advanced clock for deterministic tests
#[derive(Default, Clone)]
pub struct FakeTimer {
    clock: Arc<Mutex<FakeClock>>,
}

#[derive(Default)]
struct FakeClock {
    now: Duration,
    alarms: Vec<Weak<FakeAlarmShared>>,
}

struct FakeAlarmShared {
    slot: Mutex<AlarmSlot>,
    callback: AlarmCallback,
}

struct AlarmSlot {
    state: AlarmState,
    deadline: Duration,
}

impl FakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    /// Moves the clock forward and fires every alarm that came due, in
    /// deadline order. Callbacks run on the calling thread.
    pub fn advance_by(&self, step: Duration) {
        let due = {
            let mut clock = self.clock.lock();
            clock.now += step;
            let now = clock.now;
            clock.alarms.retain(|alarm| alarm.strong_count() > 0);

            let mut due: Vec<(Duration, Arc<FakeAlarmShared>)> = clock
                .alarms
                .iter()
                .filter_map(Weak::upgrade)
                .filter_map(|alarm| {
                    let mut slot = alarm.slot.lock();
                    if slot.state == AlarmState::Pending && slot.deadline <= now {
                        slot.state = AlarmState::Triggered;
                        let deadline = slot.deadline;
                        drop(slot);
                        Some((deadline, alarm))
                    } else {
                        None
                    }
                })
                .collect();
            due.sort_by_key(|(deadline, _)| *deadline);
            due
        };

        for (_, alarm) in due {
            (alarm.callback)();
        }
    }

    /// Number of alarms currently armed
    pub fn pending_alarms(&self) -> usize {
        self.clock
            .lock()
            .alarms
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|alarm| alarm.slot.lock().state == AlarmState::Pending)
            .count()
    }
}

impl Timer for FakeTimer {
    fn create_alarm(&self, callback: AlarmCallback) -> Box<dyn Alarm> {
        let shared = Arc::new(FakeAlarmShared {
            slot: Mutex::new(AlarmSlot {
                state: AlarmState::Triggered,
                deadline: Duration::ZERO,
            }),
            callback,
        });
        self.clock.lock().alarms.push(Arc::downgrade(&shared));

        Box::new(FakeAlarm {
            clock: Arc::clone(&self.clock),
            shared,
        })
    }
}

struct FakeAlarm {
    clock: Arc<Mutex<FakeClock>>,
    shared: Arc<FakeAlarmShared>,
}

impl Alarm for FakeAlarm {
    fn reschedule_in(&self, delay: Duration) -> bool {
        let now = self.clock.lock().now;
        let mut slot = self.shared.slot.lock();
        let was_pending = slot.state == AlarmState::Pending;
        slot.state = AlarmState::Pending;
        slot.deadline = now + delay;
        was_pending
    }

    fn cancel(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state != AlarmState::Pending {
            return false;
        }
        slot.state = AlarmState::Cancelled;
        true
    }

    fn state(&self) -> AlarmState {
        self.shared.slot.lock().state
    }
}
