//! Injected wall-clock and sleep source
//!
//! Every read of "now" and every suspension in the control loop goes through
//! a [Clock] handle, so the whole run can be driven by a virtual clock in
//! tests instead of hours of real time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

/// The real thing: `SystemTime::now` plus `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

type TimeAction = Box<dyn Fn(SystemTime) + Send>;

/// Virtual clock whose `sleep` advances time instead of blocking.
///
/// Registered actions run after every advancement, which lets a test evolve a
/// simulated vessel (drift, acid production) in step with the schedule.
pub struct MockClock {
    now: Mutex<SystemTime>,
    actions: Mutex<Vec<TimeAction>>,
}

impl MockClock {
    pub fn starting_at(start: SystemTime) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
            actions: Mutex::new(Vec::new()),
        })
    }

    pub fn add_time_dependent_action<F: Fn(SystemTime) + Send + 'static>(&self, action: F) {
        self.actions.lock().unwrap().push(Box::new(action));
    }

    pub fn advance(&self, duration: Duration) {
        let now = {
            let mut guard = self.now.lock().unwrap();
            *guard += duration;
            *guard
        };
        for action in self.actions.lock().unwrap().iter() {
            action(now);
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use super::{Clock, MockClock};

    #[test]
    fn sleep_advances_instead_of_blocking() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let clock = MockClock::starting_at(start);
        clock.sleep(Duration::from_secs(3600));
        assert_eq!(clock.now(), start + Duration::from_secs(3600));
    }

    #[test]
    fn actions_observe_every_advancement() {
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        clock.add_time_dependent_action(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        clock.sleep(Duration::from_secs(1));
        clock.sleep(Duration::from_secs(1));
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
