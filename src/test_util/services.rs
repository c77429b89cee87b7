use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::checkin::checkin_messages::{CheckinRequest, CheckinResponse, CheckinService};
use crate::registration::registration_key::RegistrationKey;
use crate::registration::registration_service::{RegistrationRequest, RegistrationResponse, RegistrationService, RegistrationStatus, UnregistrationRequest, UnregistrationStatus};
use crate::test_util::lock;

struct CheckinData {
    /// `None` makes check-ins fail
    response: Option<CheckinResponse>,
    requests: Vec<CheckinRequest>,
}

/// Answers every check-in with the same response and remembers the requests
pub struct FakeCheckinService {
    inner: Mutex<CheckinData>,
}
impl FakeCheckinService {
    pub fn new(android_id: u64, security_token: u64) -> Arc<FakeCheckinService> {
        let response = CheckinResponse {
            android_id: Some(android_id),
            security_token: Some(security_token),
            ..Default::default()
        };
        Arc::new(FakeCheckinService {
            inner: Mutex::new(CheckinData {
                response: Some(response),
                requests: Vec::new(),
            }),
        })
    }

    pub fn set_response(&self, response: Option<CheckinResponse>) {
        lock(&self.inner).response = response;
    }

    pub fn requests(&self) -> Vec<CheckinRequest> {
        lock(&self.inner).requests.clone()
    }
}

#[async_trait]
impl CheckinService for FakeCheckinService {
    async fn checkin(&self, request: CheckinRequest) -> anyhow::Result<CheckinResponse> {
        let mut inner = lock(&self.inner);
        inner.requests.push(request);
        match &inner.response {
            Some(response) => Ok(response.clone()),
            None => bail!("check-in server unavailable"),
        }
    }
}


struct RegistrationData {
    delay: Duration,
    invalid_senders: BTreeSet<String>,
    register_requests: Vec<RegistrationRequest>,
    unregister_requests: Vec<UnregistrationRequest>,
}

/// Issues registration ids of the form `reg-<app id>-<n>`, optionally after a delay
pub struct FakeRegistrationService {
    inner: Mutex<RegistrationData>,
}
impl FakeRegistrationService {
    pub fn new() -> Arc<FakeRegistrationService> {
        Arc::new(FakeRegistrationService {
            inner: Mutex::new(RegistrationData {
                delay: Duration::ZERO,
                invalid_senders: BTreeSet::new(),
                register_requests: Vec::new(),
                unregister_requests: Vec::new(),
            }),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.inner).delay = delay;
    }

    /// registrations involving this sender (or authorized entity) are rejected
    pub fn reject_sender(&self, sender_id: &str) {
        lock(&self.inner).invalid_senders.insert(sender_id.to_string());
    }

    pub fn register_requests(&self) -> Vec<RegistrationRequest> {
        lock(&self.inner).register_requests.clone()
    }

    pub fn unregister_requests(&self) -> Vec<UnregistrationRequest> {
        lock(&self.inner).unregister_requests.clone()
    }

    fn is_rejected(&self, key: &RegistrationKey) -> bool {
        let inner = lock(&self.inner);
        match key {
            RegistrationKey::Classic { sender_ids, .. } => sender_ids.iter().any(|s| inner.invalid_senders.contains(s)),
            RegistrationKey::Token { authorized_entity, .. } => inner.invalid_senders.contains(authorized_entity),
        }
    }
}

#[async_trait]
impl RegistrationService for FakeRegistrationService {
    async fn register(&self, request: RegistrationRequest) -> anyhow::Result<RegistrationResponse> {
        let (delay, n) = {
            let mut inner = lock(&self.inner);
            inner.register_requests.push(request.clone());
            (inner.delay, inner.register_requests.len())
        };
        tokio::time::sleep(delay).await;

        if self.is_rejected(&request.key) {
            return Ok(RegistrationResponse::failure(RegistrationStatus::InvalidSender));
        }
        Ok(RegistrationResponse::success(&format!("reg-{}-{}", request.key.app_id(), n)))
    }

    async fn unregister(&self, request: UnregistrationRequest) -> anyhow::Result<UnregistrationStatus> {
        let delay = {
            let mut inner = lock(&self.inner);
            inner.unregister_requests.push(request);
            inner.delay
        };
        tokio::time::sleep(delay).await;
        Ok(UnregistrationStatus::Success)
    }
}
