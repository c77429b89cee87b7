use std::time::Duration;

use anyhow::bail;

use crate::checkin::server_settings::MAXIMUM_CHECKIN_INTERVAL;
use crate::connection::backoff::BackoffPolicy;
use crate::connection::transport::Endpoint;

#[derive(Debug)]
pub struct ClientConfig {
    /// used until the check-in server provides a `checkin_interval` setting
    pub default_checkin_interval: Duration,
    /// lower bound for server-provided check-in intervals
    pub minimum_checkin_interval: Duration,
    /// used until the check-in server provides a `checkin_url` setting
    pub default_checkin_url: String,
    /// used until the check-in server provides a `registration_url` setting
    pub default_registration_url: String,

    /// used until the check-in server provides MCS host / port settings
    pub default_mcs_endpoints: Vec<Endpoint>,
    pub connection_backoff: BackoffPolicy,
    /// a connection that breaks down before it was up this long counts as a failed attempt for
    ///  reconnect backoff
    pub connection_stable_after: Duration,
    pub max_frame_size: usize,

    pub default_heartbeat_interval: Duration,
    pub minimum_heartbeat_interval: Duration,
    pub heartbeat_ack_timeout: Duration,

    pub max_send_queue_size: usize,
    pub max_app_send_queue_size: usize,
    /// maximum encoded size of an outgoing data message
    pub max_message_size: usize,
    /// number of received stanzas after which the client acknowledges them explicitly rather than
    ///  waiting for an outgoing frame to piggyback on
    pub unacked_messages_before_stream_ack: u32,

    /// sender address of upstream messages
    pub send_from: String,
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig {
            default_checkin_interval: Duration::from_secs(2 * 24 * 60 * 60),
            minimum_checkin_interval: Duration::from_secs(12 * 60 * 60),
            default_checkin_url: "https://android.clients.google.com/checkin".to_string(),
            default_registration_url: "https://android.clients.google.com/c2dm/register3".to_string(),
            default_mcs_endpoints: vec![
                Endpoint::new("mtalk.google.com", 5228),
                Endpoint::new("mtalk.google.com", 443),
            ],
            connection_backoff: BackoffPolicy::new(),
            connection_stable_after: Duration::from_secs(60),
            max_frame_size: 64 * 1024,
            default_heartbeat_interval: Duration::from_secs(28 * 60),
            minimum_heartbeat_interval: Duration::from_secs(2 * 60),
            heartbeat_ack_timeout: Duration::from_secs(60),
            max_send_queue_size: 1024,
            max_app_send_queue_size: 20,
            max_message_size: 4096,
            unacked_messages_before_stream_ack: 10,
            send_from: "gcm@chrome.com".to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.minimum_checkin_interval > self.default_checkin_interval {
            bail!("minimum check-in interval must not exceed the default check-in interval");
        }
        if self.minimum_checkin_interval > MAXIMUM_CHECKIN_INTERVAL {
            bail!("minimum check-in interval must not exceed {:?}", MAXIMUM_CHECKIN_INTERVAL);
        }
        if self.default_checkin_url.is_empty() || self.default_registration_url.is_empty() {
            bail!("check-in and registration URLs are required");
        }
        if self.default_mcs_endpoints.is_empty() {
            bail!("at least one MCS endpoint is required");
        }
        if self.minimum_heartbeat_interval > self.default_heartbeat_interval {
            bail!("minimum heartbeat interval must not exceed the default heartbeat interval");
        }
        if self.heartbeat_ack_timeout.is_zero() {
            bail!("heartbeat ack timeout must be positive");
        }
        if self.max_app_send_queue_size > self.max_send_queue_size {
            bail!("per-app send queue size must not exceed the total send queue size");
        }
        if self.max_message_size >= self.max_frame_size {
            bail!("maximum message size must be smaller than the maximum frame size");
        }
        if self.unacked_messages_before_stream_ack == 0 {
            bail!("unacked message threshold must be positive");
        }
        if !(0.0..=1.0).contains(&self.connection_backoff.jitter_factor) {
            bail!("backoff jitter factor must be between 0.0 and 1.0");
        }
        if self.connection_backoff.multiply_factor < 1.0 {
            bail!("backoff multiply factor must be at least 1.0");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ClientConfig::new().validate().is_ok());
    }

    #[test]
    fn test_invalid() {
        let mut config = ClientConfig::new();
        config.default_mcs_endpoints.clear();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new();
        config.minimum_heartbeat_interval = Duration::from_secs(60 * 60);
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new();
        config.max_app_send_queue_size = config.max_send_queue_size + 1;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new();
        config.default_registration_url.clear();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new();
        config.connection_backoff.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }
}
