use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::checkin::checkin_state::DeviceIdentity;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountMapping {
    pub account_id: String,
    pub email: String,
    pub last_message_id: Option<String>,
}

/// Everything that survives a restart of the client
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LoadResult {
    pub identity: DeviceIdentity,
    /// serialized registration key -> serialized registration value
    pub registrations: BTreeMap<String, String>,
    pub last_checkin_time: Option<SystemTime>,
    pub last_checkin_accounts: BTreeSet<String>,
    pub gservices_settings: BTreeMap<String, String>,
    pub gservices_digest: String,
    /// app id -> serialized instance id data
    pub instance_id_data: BTreeMap<String, String>,
    pub account_mappings: Vec<AccountMapping>,
    pub last_token_fetch_time: Option<SystemTime>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadError {
    /// The store does not exist and was not supposed to be created
    NotFound,
    /// The store exists but is unreadable or corrupt
    Io(String),
}
impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::NotFound => write!(f, "store not found"),
            LoadError::Io(msg) => write!(f, "store corrupt or unreadable: {}", msg),
        }
    }
}

/// Durable storage for credentials, registrations and server settings. Write operations return
///  `true` on success.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn load(&self, create_if_missing: bool) -> Result<LoadResult, LoadError>;
    /// Removes the store and all of its contents
    async fn destroy(&self) -> bool;
    async fn close(&self);

    async fn set_device_credentials(&self, identity: DeviceIdentity) -> bool;
    async fn add_registration(&self, serialized_key: &str, serialized_value: &str) -> bool;
    async fn remove_registration(&self, serialized_key: &str) -> bool;
    async fn set_last_checkin_info(&self, time: SystemTime, accounts: &BTreeSet<String>) -> bool;
    async fn set_gservices(&self, settings: &BTreeMap<String, String>, digest: &str) -> bool;
    async fn add_instance_id_data(&self, app_id: &str, serialized_data: &str) -> bool;
    async fn remove_instance_id_data(&self, app_id: &str) -> bool;
    async fn add_account_mapping(&self, mapping: &AccountMapping) -> bool;
    async fn remove_account_mapping(&self, account_id: &str) -> bool;
    async fn set_last_token_fetch_time(&self, time: SystemTime) -> bool;
}
