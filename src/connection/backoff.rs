use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// number of initial failures that do not cause any delay
    pub num_errors_to_ignore: u32,
    pub initial_delay: Duration,
    pub multiply_factor: f64,
    /// number between 0.0 and 1.0: the fraction of a delay that is randomly shaved off
    pub jitter_factor: f64,
    pub maximum_delay: Duration,
}
impl BackoffPolicy {
    pub fn new() -> BackoffPolicy {
        BackoffPolicy {
            num_errors_to_ignore: 0,
            initial_delay: Duration::from_secs(15),
            multiply_factor: 2.0,
            jitter_factor: 0.5,
            maximum_delay: Duration::from_secs(5 * 60),
        }
    }
}

/// Tracks consecutive failures of some operation and derives a randomized, exponentially growing
///  delay from them.
pub struct BackoffEntry {
    policy: BackoffPolicy,
    failure_count: u32,
}
impl BackoffEntry {
    pub fn new(policy: BackoffPolicy) -> BackoffEntry {
        BackoffEntry {
            policy,
            failure_count: 0,
        }
    }

    pub fn inform_of_request(&mut self, succeeded: bool) {
        if succeeded {
            self.failure_count = 0;
        }
        else {
            self.failure_count = self.failure_count.saturating_add(1);
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn time_until_release(&self) -> Duration {
        self.delay_with_jitter(rand::thread_rng().gen_range(0.0..1.0))
    }

    fn delay_with_jitter(&self, random: f64) -> Duration {
        let effective_failures = self.failure_count.saturating_sub(self.policy.num_errors_to_ignore);
        if effective_failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (effective_failures - 1).min(i32::MAX as u32) as i32;
        let delay = self.policy.initial_delay.as_secs_f64() * self.policy.multiply_factor.powi(exponent);
        let delay = delay * (1.0 - self.policy.jitter_factor * random);
        let delay = delay.min(self.policy.maximum_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(delay)
    }
}
