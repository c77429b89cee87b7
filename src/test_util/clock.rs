use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::test_util::lock;
use crate::util::clock::Clock;

/// Wall clock that only moves when told to
pub struct ManualClock {
    now: Mutex<SystemTime>,
}
impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock::starting_at(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    pub fn starting_at(now: SystemTime) -> ManualClock {
        ManualClock {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *lock(&self.now) += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *lock(&self.now)
    }
}
