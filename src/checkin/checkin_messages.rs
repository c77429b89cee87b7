use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::checkin::checkin_state::DeviceIdentity;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    Windows,
    Mac,
    Linux,
    ChromeOs,
    Android,
    Ios,
    Unspecified,
}
impl Platform {
    /// The check-in server has no notion of an unspecified platform, it is reported as Linux
    pub fn checkin_platform(self) -> Platform {
        match self {
            Platform::Unspecified => Platform::Linux,
            p => p,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Channel {
    Stable,
    Beta,
    Dev,
    Canary,
    Unknown,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildInfo {
    pub platform: Platform,
    pub channel: Channel,
    /// dotted version string, e.g. "121.0.6167.85"
    pub version: String,
}
impl BuildInfo {
    pub fn new(platform: Platform, channel: Channel, version: &str) -> BuildInfo {
        BuildInfo {
            platform,
            channel,
            version: version.to_string(),
        }
    }

    /// major component of the version, sent with registration requests. `0` if the version string
    ///  does not start with a number.
    pub fn major_version(&self) -> u32 {
        self.version
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// version string sent in the login request of the message stream
    pub fn client_version(&self) -> String {
        format!("chrome-{}", self.version)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountTokenInfo {
    pub account_id: String,
    pub email: String,
    pub access_token: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckinRequest {
    pub identity: DeviceIdentity,
    /// email -> OAuth token
    pub account_tokens: BTreeMap<String, String>,
    pub settings_digest: String,
    pub build_info: BuildInfo,
    /// where to send the request, from the server settings if they provide one
    pub url: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CheckinResponse {
    pub android_id: Option<u64>,
    pub security_token: Option<u64>,
    /// `true` if `settings` is a diff against the settings the request's digest referred to
    pub settings_diff: bool,
    pub settings: Vec<(String, String)>,
    pub digest: Option<String>,
}

/// The HTTP check-in exchange. Retries with backoff are the implementation's business, an `Err`
///  means the check-in ultimately failed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CheckinService: Send + Sync + 'static {
    async fn checkin(&self, request: CheckinRequest) -> anyhow::Result<CheckinResponse>;
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::regular("121.0.6167.85", 121)]
    #[case::major_only("45", 45)]
    #[case::empty("", 0)]
    #[case::garbage("dev-build", 0)]
    fn test_major_version(#[case] version: &str, #[case] expected: u32) {
        assert_eq!(BuildInfo::new(Platform::Linux, Channel::Dev, version).major_version(), expected);
    }

    #[test]
    fn test_checkin_platform() {
        assert_eq!(Platform::Unspecified.checkin_platform(), Platform::Linux);
        assert_eq!(Platform::Mac.checkin_platform(), Platform::Mac);
    }
}
