use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::checkin::checkin_messages::CheckinResponse;
use crate::client::client_config::ClientConfig;
use crate::connection::transport::Endpoint;

const CHECKIN_INTERVAL_KEY: &str = "checkin_interval";
const CHECKIN_URL_KEY: &str = "checkin_url";
const MCS_HOSTNAME_KEY: &str = "mcs_hostname";
const MCS_SECURE_PORT_KEY: &str = "mcs_secure_port";
const MCS_FALLBACK_PORT_KEY: &str = "mcs_fallback_port";
const REGISTRATION_URL_KEY: &str = "registration_url";

const DELETE_SETTING_PREFIX: &str = "delete_";
const DIGEST_VERSION_PREFIX: &str = "1-";

/// upper bound for server-provided check-in intervals
pub const MAXIMUM_CHECKIN_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Settings pushed by the check-in server, identified by a digest that is sent back with every
///  check-in request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerSettings {
    settings: BTreeMap<String, String>,
    digest: String,
}
impl ServerSettings {
    pub fn new() -> ServerSettings {
        Default::default()
    }

    pub fn calculate_digest(settings: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in settings {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }

        let mut result = DIGEST_VERSION_PREFIX.to_string();
        for b in hasher.finalize() {
            let _ = write!(result, "{:02x}", b);
        }
        result
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Applies settings read from the store. They are ignored unless they match their digest.
    pub fn update_from_load(&mut self, settings: &BTreeMap<String, String>, digest: &str) -> bool {
        if settings.is_empty() && digest.is_empty() {
            return false;
        }
        if Self::calculate_digest(settings) != digest {
            warn!("stored server settings do not match their digest - ignoring");
            return false;
        }
        if let Err(e) = Self::validate(settings) {
            warn!("stored server settings are invalid: {} - ignoring", e);
            return false;
        }

        self.settings = settings.clone();
        self.digest = digest.to_string();
        true
    }

    /// Returns `true` if the settings changed and need to be persisted
    pub fn update_from_checkin_response(&mut self, response: &CheckinResponse) -> bool {
        let Some(response_digest) = &response.digest else {
            return false;
        };
        if response_digest == &self.digest {
            debug!("server settings unchanged");
            return false;
        }

        let mut new_settings = if response.settings_diff {
            self.settings.clone()
        }
        else {
            BTreeMap::new()
        };

        for (key, value) in &response.settings {
            match key.strip_prefix(DELETE_SETTING_PREFIX) {
                Some(deleted) if response.settings_diff => {
                    new_settings.remove(deleted);
                }
                _ => {
                    new_settings.insert(key.clone(), value.clone());
                }
            }
        }

        if let Err(e) = Self::validate(&new_settings) {
            warn!("server settings from check-in response are invalid: {} - ignoring", e);
            return false;
        }

        self.digest = Self::calculate_digest(&new_settings);
        self.settings = new_settings;
        true
    }

    fn validate(settings: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(interval) = settings.get(CHECKIN_INTERVAL_KEY) {
            if interval.parse::<u64>()? > MAXIMUM_CHECKIN_INTERVAL.as_secs() {
                anyhow::bail!("check-in interval of {} seconds is out of range", interval);
            }
        }
        for key in [MCS_SECURE_PORT_KEY, MCS_FALLBACK_PORT_KEY] {
            if let Some(port) = settings.get(key) {
                if port.parse::<u16>()? == 0 {
                    anyhow::bail!("{} must not be 0", key);
                }
            }
        }
        for key in [MCS_HOSTNAME_KEY, CHECKIN_URL_KEY, REGISTRATION_URL_KEY] {
            if settings.get(key).is_some_and(|s| s.is_empty()) {
                anyhow::bail!("{} must not be empty", key);
            }
        }
        Ok(())
    }

    pub fn checkin_interval(&self, config: &ClientConfig) -> Duration {
        let interval = self.settings.get(CHECKIN_INTERVAL_KEY)
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.default_checkin_interval);
        interval
            .min(MAXIMUM_CHECKIN_INTERVAL)
            .max(config.minimum_checkin_interval)
    }

    pub fn checkin_url(&self, config: &ClientConfig) -> String {
        self.settings.get(CHECKIN_URL_KEY)
            .cloned()
            .unwrap_or_else(|| config.default_checkin_url.clone())
    }

    pub fn registration_url(&self, config: &ClientConfig) -> String {
        self.settings.get(REGISTRATION_URL_KEY)
            .cloned()
            .unwrap_or_else(|| config.default_registration_url.clone())
    }

    /// main endpoint first, fallback second
    pub fn mcs_endpoints(&self, config: &ClientConfig) -> Vec<Endpoint> {
        let Some(host) = self.settings.get(MCS_HOSTNAME_KEY) else {
            return config.default_mcs_endpoints.clone();
        };

        let mut result = Vec::new();
        for key in [MCS_SECURE_PORT_KEY, MCS_FALLBACK_PORT_KEY] {
            if let Some(port) = self.settings.get(key).and_then(|s| s.parse().ok()) {
                result.push(Endpoint::new(host, port));
            }
        }

        if result.is_empty() {
            config.default_mcs_endpoints.iter()
                .map(|e| Endpoint::new(host, e.port))
                .collect()
        }
        else {
            result
        }
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn response(diff: bool, entries: &[(&str, &str)], digest: Option<&str>) -> CheckinResponse {
        CheckinResponse {
            android_id: Some(1),
            security_token: Some(2),
            settings_diff: diff,
            settings: entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            digest: digest.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_digest() {
        let digest = ServerSettings::calculate_digest(&map(&[("a", "1"), ("b", "2")]));
        assert!(digest.starts_with("1-"));
        assert_eq!(digest.len(), 2 + 64);

        // key / value boundaries are part of the digest
        assert_ne!(digest, ServerSettings::calculate_digest(&map(&[("a", "1b"), ("", "2")])));
        assert_eq!(digest, ServerSettings::calculate_digest(&map(&[("b", "2"), ("a", "1")])));
    }

    #[test]
    fn test_full_update() {
        let mut settings = ServerSettings::new();
        assert!(settings.update_from_checkin_response(&response(false, &[("checkin_interval", "86400")], Some("x"))));
        assert_eq!(settings.settings(), &map(&[("checkin_interval", "86400")]));
        assert_eq!(settings.digest(), ServerSettings::calculate_digest(settings.settings()));

        assert!(settings.update_from_checkin_response(&response(false, &[("mcs_hostname", "mcs.example.com")], Some("y"))));
        assert_eq!(settings.settings(), &map(&[("mcs_hostname", "mcs.example.com")]));
    }

    #[test]
    fn test_diff_update() {
        let mut settings = ServerSettings::new();
        settings.update_from_checkin_response(&response(false, &[("checkin_interval", "86400"), ("mcs_hostname", "a.example.com")], Some("x")));

        assert!(settings.update_from_checkin_response(&response(true, &[("delete_checkin_interval", ""), ("mcs_secure_port", "5229")], Some("y"))));
        assert_eq!(settings.settings(), &map(&[("mcs_hostname", "a.example.com"), ("mcs_secure_port", "5229")]));
    }

    #[test]
    fn test_unchanged_digest() {
        let mut settings = ServerSettings::new();
        settings.update_from_checkin_response(&response(false, &[("checkin_interval", "86400")], Some("x")));
        let digest = settings.digest().to_string();

        assert!(!settings.update_from_checkin_response(&response(false, &[("checkin_interval", "1")], Some(&digest))));
        assert!(!settings.update_from_checkin_response(&response(false, &[("checkin_interval", "1")], None)));
        assert_eq!(settings.settings(), &map(&[("checkin_interval", "86400")]));
    }

    #[rstest]
    #[case::interval(&[("checkin_interval", "soon")])]
    #[case::port(&[("mcs_secure_port", "70000")])]
    #[case::zero_port(&[("mcs_fallback_port", "0")])]
    #[case::huge_interval(&[("checkin_interval", "18446744073709551615")])]
    #[case::interval_above_maximum(&[("checkin_interval", "31536001")])]
    #[case::empty_host(&[("mcs_hostname", "")])]
    fn test_invalid_update(#[case] entries: &[(&str, &str)]) {
        let mut settings = ServerSettings::new();
        assert!(!settings.update_from_checkin_response(&response(false, entries, Some("x"))));
        assert!(settings.settings().is_empty());
    }

    #[test]
    fn test_load() {
        let stored = map(&[("checkin_interval", "86400")]);
        let digest = ServerSettings::calculate_digest(&stored);

        let mut settings = ServerSettings::new();
        assert!(!settings.update_from_load(&stored, "1-bogus"));
        assert!(settings.settings().is_empty());

        assert!(settings.update_from_load(&stored, &digest));
        assert_eq!(settings.settings(), &stored);
        assert_eq!(settings.digest(), digest);
    }

    #[rstest]
    #[case::default(&[], 2 * 24 * 3600)]
    #[case::server(&[("checkin_interval", "86400")], 86400)]
    #[case::below_minimum(&[("checkin_interval", "60")], 12 * 3600)]
    #[case::maximum(&[("checkin_interval", "31536000")], 365 * 24 * 3600)]
    fn test_checkin_interval(#[case] entries: &[(&str, &str)], #[case] expected_secs: u64) {
        let mut settings = ServerSettings::new();
        settings.update_from_checkin_response(&response(false, entries, Some("x")));
        assert_eq!(settings.checkin_interval(&ClientConfig::new()), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_huge_stored_interval_is_ignored() {
        let stored = map(&[("checkin_interval", "18446744073709551615")]);
        let digest = ServerSettings::calculate_digest(&stored);

        let mut settings = ServerSettings::new();
        assert!(!settings.update_from_load(&stored, &digest));
        assert_eq!(settings.checkin_interval(&ClientConfig::new()), Duration::from_secs(2 * 24 * 3600));
    }

    #[test]
    fn test_urls() {
        let config = ClientConfig::new();
        let mut settings = ServerSettings::new();
        assert_eq!(settings.checkin_url(&config), config.default_checkin_url);
        assert_eq!(settings.registration_url(&config), config.default_registration_url);

        settings.update_from_checkin_response(&response(false, &[
            ("checkin_url", "https://checkin.example.com/checkin"),
            ("registration_url", "https://register.example.com/register"),
        ], Some("x")));
        assert_eq!(settings.checkin_url(&config), "https://checkin.example.com/checkin");
        assert_eq!(settings.registration_url(&config), "https://register.example.com/register");
    }

    #[test]
    fn test_mcs_endpoints() {
        let config = ClientConfig::new();
        let mut settings = ServerSettings::new();
        assert_eq!(settings.mcs_endpoints(&config), config.default_mcs_endpoints);

        settings.update_from_checkin_response(&response(false, &[("mcs_hostname", "mcs.example.com"), ("mcs_secure_port", "5229"), ("mcs_fallback_port", "444")], Some("x")));
        assert_eq!(settings.mcs_endpoints(&config), vec![Endpoint::new("mcs.example.com", 5229), Endpoint::new("mcs.example.com", 444)]);

        settings.update_from_checkin_response(&response(false, &[("mcs_hostname", "other.example.com")], Some("y")));
        assert_eq!(settings.mcs_endpoints(&config), vec![Endpoint::new("other.example.com", 5228), Endpoint::new("other.example.com", 443)]);
    }
}
