use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::checkin::checkin_state::DeviceIdentity;
use crate::registration::registration_key::RegistrationKey;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistrationRequest {
    pub identity: DeviceIdentity,
    pub key: RegistrationKey,
    /// instance id of the app, only present for token registrations of apps that have one
    pub instance_id: Option<String>,
    /// major version of the embedding build
    pub gcm_version: u32,
    pub url: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistrationStatus {
    Success,
    /// the server rejected the sender id / authorized entity
    InvalidSender,
    AuthenticationFailed,
    ServerError,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistrationResponse {
    pub status: RegistrationStatus,
    /// empty unless the registration succeeded
    pub registration_id: String,
}
impl RegistrationResponse {
    pub fn success(registration_id: &str) -> RegistrationResponse {
        RegistrationResponse {
            status: RegistrationStatus::Success,
            registration_id: registration_id.to_string(),
        }
    }

    pub fn failure(status: RegistrationStatus) -> RegistrationResponse {
        RegistrationResponse {
            status,
            registration_id: String::new(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnregistrationRequest {
    pub identity: DeviceIdentity,
    pub key: RegistrationKey,
    pub instance_id: Option<String>,
    pub url: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnregistrationStatus {
    Success,
    InvalidParameters,
    ServerError,
}

/// The HTTP registration / deletion exchanges. Retries are the implementation's business, an
///  `Err` is treated as a server error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistrationService: Send + Sync + 'static {
    async fn register(&self, request: RegistrationRequest) -> anyhow::Result<RegistrationResponse>;
    async fn unregister(&self, request: UnregistrationRequest) -> anyhow::Result<UnregistrationStatus>;
}
