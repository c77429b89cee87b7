use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Eq, PartialEq)]
pub enum HeartbeatAction {
    None,
    SendPing,
    /// a ping was not acknowledged in time
    ConnectionDead,
}

/// Decides when to ping the server and when to give up on a connection. Apps can ask for a
///  tighter cadence by registering an interval under a scope; the shortest registered interval
///  wins.
pub struct HeartbeatManager {
    default_interval: Duration,
    min_interval: Duration,
    ack_timeout: Duration,
    scoped_intervals: BTreeMap<String, Duration>,
    /// the point in time the current interval is measured from, `None` while stopped
    last_reset: Option<Instant>,
    ack_deadline: Option<Instant>,
}
impl HeartbeatManager {
    pub fn new(default_interval: Duration, min_interval: Duration, ack_timeout: Duration) -> HeartbeatManager {
        HeartbeatManager {
            default_interval,
            min_interval,
            ack_timeout,
            scoped_intervals: Default::default(),
            last_reset: None,
            ack_deadline: None,
        }
    }

    pub fn add_interval(&mut self, scope: &str, interval: Duration) -> bool {
        if interval < self.min_interval {
            warn!("heartbeat interval {:?} for {} is below the minimum of {:?} - ignoring", interval, scope, self.min_interval);
            return false;
        }
        debug!("heartbeat interval for {}: {:?}", scope, interval);
        self.scoped_intervals.insert(scope.to_string(), interval);
        true
    }

    pub fn remove_interval(&mut self, scope: &str) {
        self.scoped_intervals.remove(scope);
    }

    pub fn effective_interval(&self) -> Duration {
        self.scoped_intervals.values()
            .min()
            .copied()
            .unwrap_or(self.default_interval)
    }

    pub fn is_running(&self) -> bool {
        self.last_reset.is_some()
    }

    pub fn start(&mut self, now: Instant) {
        self.last_reset = Some(now);
        self.ack_deadline = None;
    }

    pub fn stop(&mut self) {
        self.last_reset = None;
        self.ack_deadline = None;
    }

    pub fn on_heartbeat_ack(&mut self, now: Instant) {
        if self.is_running() {
            self.start(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.ack_deadline {
            Some(deadline) => Some(deadline),
            None => self.last_reset.map(|t| t + self.effective_interval()),
        }
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        let Some(last_reset) = self.last_reset else {
            return HeartbeatAction::None;
        };

        if let Some(deadline) = self.ack_deadline {
            if now >= deadline {
                self.stop();
                return HeartbeatAction::ConnectionDead;
            }
            return HeartbeatAction::None;
        }

        if now >= last_reset + self.effective_interval() {
            self.ack_deadline = Some(now + self.ack_timeout);
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::None
    }
}
