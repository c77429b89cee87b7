use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::checkin::checkin_state::DeviceIdentity;
use crate::store::credential_store::{AccountMapping, CredentialStore, LoadError, LoadResult};
use crate::test_util::lock;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreOperation {
    Load { create_if_missing: bool },
    Destroy,
    Close,
    SetDeviceCredentials(DeviceIdentity),
    AddRegistration(String, String),
    RemoveRegistration(String),
    SetLastCheckinInfo(BTreeSet<String>),
    SetGServices(String),
    AddInstanceIdData(String, String),
    RemoveInstanceIdData(String),
    AddAccountMapping(String),
    RemoveAccountMapping(String),
    SetLastTokenFetchTime(SystemTime),
}

struct StoreData {
    exists: bool,
    data: LoadResult,
    load_failures: VecDeque<LoadError>,
    fail_destroy: bool,
    operations: Vec<StoreOperation>,
}

/// A [CredentialStore] in memory that records every operation
pub struct InMemoryCredentialStore {
    inner: Mutex<StoreData>,
}
impl InMemoryCredentialStore {
    /// a store that does not exist yet
    pub fn new() -> Arc<InMemoryCredentialStore> {
        Self::create(false, LoadResult::default())
    }

    pub fn with_data(data: LoadResult) -> Arc<InMemoryCredentialStore> {
        Self::create(true, data)
    }

    fn create(exists: bool, data: LoadResult) -> Arc<InMemoryCredentialStore> {
        Arc::new(InMemoryCredentialStore {
            inner: Mutex::new(StoreData {
                exists,
                data,
                load_failures: Default::default(),
                fail_destroy: false,
                operations: Vec::new(),
            }),
        })
    }

    /// the next loads fail with these errors, in order
    pub fn fail_next_loads(&self, errors: Vec<LoadError>) {
        lock(&self.inner).load_failures.extend(errors);
    }

    pub fn fail_destroy(&self) {
        lock(&self.inner).fail_destroy = true;
    }

    pub fn exists(&self) -> bool {
        lock(&self.inner).exists
    }

    pub fn data(&self) -> LoadResult {
        lock(&self.inner).data.clone()
    }

    pub fn operations(&self) -> Vec<StoreOperation> {
        lock(&self.inner).operations.clone()
    }

    fn write(&self, operation: StoreOperation, f: impl FnOnce(&mut LoadResult)) -> bool {
        let mut inner = lock(&self.inner);
        inner.operations.push(operation);
        if !inner.exists {
            return false;
        }
        f(&mut inner.data);
        true
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, create_if_missing: bool) -> Result<LoadResult, LoadError> {
        let mut inner = lock(&self.inner);
        inner.operations.push(StoreOperation::Load { create_if_missing });
        if let Some(error) = inner.load_failures.pop_front() {
            return Err(error);
        }
        if !inner.exists {
            if !create_if_missing {
                return Err(LoadError::NotFound);
            }
            inner.exists = true;
        }
        Ok(inner.data.clone())
    }

    async fn destroy(&self) -> bool {
        let mut inner = lock(&self.inner);
        inner.operations.push(StoreOperation::Destroy);
        if inner.fail_destroy {
            return false;
        }
        inner.exists = false;
        inner.data = Default::default();
        true
    }

    async fn close(&self) {
        lock(&self.inner).operations.push(StoreOperation::Close);
    }

    async fn set_device_credentials(&self, identity: DeviceIdentity) -> bool {
        self.write(StoreOperation::SetDeviceCredentials(identity), |data| data.identity = identity)
    }

    async fn add_registration(&self, serialized_key: &str, serialized_value: &str) -> bool {
        self.write(StoreOperation::AddRegistration(serialized_key.to_string(), serialized_value.to_string()), |data| {
            data.registrations.insert(serialized_key.to_string(), serialized_value.to_string());
        })
    }

    async fn remove_registration(&self, serialized_key: &str) -> bool {
        self.write(StoreOperation::RemoveRegistration(serialized_key.to_string()), |data| {
            data.registrations.remove(serialized_key);
        })
    }

    async fn set_last_checkin_info(&self, time: SystemTime, accounts: &BTreeSet<String>) -> bool {
        self.write(StoreOperation::SetLastCheckinInfo(accounts.clone()), |data| {
            data.last_checkin_time = Some(time);
            data.last_checkin_accounts = accounts.clone();
        })
    }

    async fn set_gservices(&self, settings: &std::collections::BTreeMap<String, String>, digest: &str) -> bool {
        self.write(StoreOperation::SetGServices(digest.to_string()), |data| {
            data.gservices_settings = settings.clone();
            data.gservices_digest = digest.to_string();
        })
    }

    async fn add_instance_id_data(&self, app_id: &str, serialized_data: &str) -> bool {
        self.write(StoreOperation::AddInstanceIdData(app_id.to_string(), serialized_data.to_string()), |data| {
            data.instance_id_data.insert(app_id.to_string(), serialized_data.to_string());
        })
    }

    async fn remove_instance_id_data(&self, app_id: &str) -> bool {
        self.write(StoreOperation::RemoveInstanceIdData(app_id.to_string()), |data| {
            data.instance_id_data.remove(app_id);
        })
    }

    async fn add_account_mapping(&self, mapping: &AccountMapping) -> bool {
        self.write(StoreOperation::AddAccountMapping(mapping.account_id.clone()), |data| {
            data.account_mappings.retain(|m| m.account_id != mapping.account_id);
            data.account_mappings.push(mapping.clone());
        })
    }

    async fn remove_account_mapping(&self, account_id: &str) -> bool {
        self.write(StoreOperation::RemoveAccountMapping(account_id.to_string()), |data| {
            data.account_mappings.retain(|m| m.account_id != account_id);
        })
    }

    async fn set_last_token_fetch_time(&self, time: SystemTime) -> bool {
        self.write(StoreOperation::SetLastTokenFetchTime(time), |data| data.last_token_fetch_time = Some(time))
    }
}
