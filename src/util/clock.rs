use std::time::SystemTime;

/// Source of wall-clock time. Check-in scheduling and persisted timestamps are wall-clock based,
///  so they go through this trait to allow tests to move time explicitly.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock {}
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
