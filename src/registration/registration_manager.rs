use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::client::client_events::ResultCode;
use crate::registration::registration_key::RegistrationKey;
use crate::registration::registration_service::{RegistrationResponse, RegistrationStatus, UnregistrationStatus};

/// registrations of this app id are managed on behalf of accounts, they do not count as an app
///  using the client on its own
pub const ACCOUNT_MAPPER_APP_ID: &str = "com.google.android.gms";

/// scope of token registrations that receive regular data messages
pub const DATA_MESSAGE_SCOPE: &str = "GCM";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CachedRegistration {
    pub key: RegistrationKey,
    pub registration_id: String,
}

#[derive(Debug, Eq, PartialEq)]
pub enum RegisterDecision {
    CacheHit(String),
    AlreadyPending,
    Issue(u64),
}

#[derive(Debug, Eq, PartialEq)]
pub enum UnregisterDecision {
    AlreadyPending,
    Issue {
        request_id: u64,
        /// serialized keys to remove from the store
        removed_keys: Vec<String>,
    },
}

#[derive(Debug, Eq, PartialEq)]
pub struct RegisterOutcome {
    pub result: ResultCode,
    pub registration_id: String,
    /// serialized key / value to write to the store
    pub persist: Option<(String, String)>,
}

struct PendingRequest {
    key: RegistrationKey,
    request_id: u64,
}

/// Registration cache and bookkeeping of requests in flight. At most one registration and one
///  unregistration request per serialized key are in flight at any time.
pub struct RegistrationManager {
    registrations: FxHashMap<String, CachedRegistration>,
    pending_registrations: FxHashMap<String, PendingRequest>,
    pending_unregistrations: FxHashMap<String, PendingRequest>,
    next_request_id: u64,
}
impl RegistrationManager {
    pub fn new() -> RegistrationManager {
        RegistrationManager {
            registrations: Default::default(),
            pending_registrations: Default::default(),
            pending_unregistrations: Default::default(),
            next_request_id: 1,
        }
    }

    /// Loads persisted registrations, skipping entries that do not parse. Returns the number of
    ///  registrations loaded.
    pub fn load(&mut self, persisted: &BTreeMap<String, String>) -> usize {
        for (serialized_key, serialized_value) in persisted {
            match RegistrationKey::parse(serialized_key, serialized_value) {
                Ok((key, registration_id)) => {
                    self.registrations.insert(serialized_key.clone(), CachedRegistration { key, registration_id });
                }
                Err(e) => {
                    warn!("skipping persisted registration {:?}: {}", serialized_key, e);
                }
            }
        }
        self.registrations.len()
    }

    pub fn get(&self, key: &RegistrationKey) -> Option<&CachedRegistration> {
        self.registrations.get(&key.serialized_key())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn register(&mut self, key: &RegistrationKey) -> RegisterDecision {
        let serialized_key = key.serialized_key();

        if let Some(cached) = self.registrations.get(&serialized_key) {
            let matches = match (key, &cached.key) {
                (RegistrationKey::Classic { sender_ids: requested, .. }, RegistrationKey::Classic { sender_ids: cached, .. }) => requested == cached,
                _ => true,
            };
            if matches {
                debug!("registration {} is cached", key);
                return RegisterDecision::CacheHit(cached.registration_id.clone());
            }
        }

        if self.pending_registrations.contains_key(&serialized_key) {
            debug!("registration {} is already in progress", key);
            return RegisterDecision::AlreadyPending;
        }

        let request_id = self.new_request_id();
        self.pending_registrations.insert(serialized_key, PendingRequest { key: key.clone(), request_id });
        RegisterDecision::Issue(request_id)
    }

    /// Returns `None` if the completion does not belong to the request in flight for the key
    pub fn on_register_completed(&mut self, key: &RegistrationKey, request_id: u64, response: RegistrationResponse) -> Option<RegisterOutcome> {
        let serialized_key = key.serialized_key();
        match self.pending_registrations.get(&serialized_key) {
            Some(pending) if pending.request_id == request_id => {}
            _ => {
                debug!("no pending registration #{} for {} - ignoring completion", request_id, key);
                return None;
            }
        }
        let pending = self.pending_registrations.remove(&serialized_key)?;

        let result = if response.status == RegistrationStatus::InvalidSender {
            ResultCode::InvalidParameter
        }
        else if response.registration_id.is_empty() {
            ResultCode::ServerError
        }
        else {
            ResultCode::Success
        };

        let persist = if result == ResultCode::Success {
            info!("registered {}", key);
            self.registrations.insert(serialized_key.clone(), CachedRegistration {
                key: pending.key.clone(),
                registration_id: response.registration_id.clone(),
            });
            Some((serialized_key, pending.key.serialized_value(&response.registration_id)))
        }
        else {
            warn!("registration of {} failed: {:?}", key, response.status);
            None
        };

        let registration_id = if result == ResultCode::Success {
            response.registration_id
        }
        else {
            String::new()
        };
        Some(RegisterOutcome {
            result,
            registration_id,
            persist,
        })
    }

    /// Removes the key from the cache right away - a wildcard token key removes all token
    ///  registrations of its app.
    pub fn unregister(&mut self, key: &RegistrationKey) -> UnregisterDecision {
        let serialized_key = key.serialized_key();
        if self.pending_unregistrations.contains_key(&serialized_key) {
            debug!("unregistration of {} is already in progress", key);
            return UnregisterDecision::AlreadyPending;
        }

        self.registrations.remove(&serialized_key);
        let mut removed_keys = vec![serialized_key.clone()];

        if key.is_wildcard() {
            let mut matching = self.registrations.iter()
                .filter(|(_, cached)| matches!(&cached.key, RegistrationKey::Token { app_id, .. } if app_id == key.app_id()))
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();
            matching.sort();

            for k in matching {
                self.registrations.remove(&k);
                removed_keys.push(k);
            }
        }

        let request_id = self.new_request_id();
        self.pending_unregistrations.insert(serialized_key, PendingRequest { key: key.clone(), request_id });
        UnregisterDecision::Issue { request_id, removed_keys }
    }

    pub fn on_unregister_completed(&mut self, key: &RegistrationKey, request_id: u64, status: UnregistrationStatus) -> Option<ResultCode> {
        let serialized_key = key.serialized_key();
        match self.pending_unregistrations.get(&serialized_key) {
            Some(pending) if pending.request_id == request_id => {}
            _ => {
                debug!("no pending unregistration #{} for {} - ignoring completion", request_id, key);
                return None;
            }
        }
        self.pending_unregistrations.remove(&serialized_key);

        Some(match status {
            UnregistrationStatus::Success => ResultCode::Success,
            UnregistrationStatus::InvalidParameters => ResultCode::InvalidParameter,
            UnregistrationStatus::ServerError => ResultCode::ServerError,
        })
    }

    /// Forgets all requests in flight without reporting them. Returns the keys that were pending.
    pub fn clear_pending(&mut self) -> Vec<RegistrationKey> {
        self.pending_registrations.drain()
            .chain(self.pending_unregistrations.drain())
            .map(|(_, pending)| pending.key)
            .collect()
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
        self.clear_pending();
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.pending_registrations.is_empty() || !self.pending_unregistrations.is_empty()
    }

    /// Is there a registration of an app on its own behalf (rather than on behalf of an account)?
    pub fn has_standalone_registered_app(&self) -> bool {
        self.registrations.values()
            .any(|cached| cached.key.app_id() != ACCOUNT_MAPPER_APP_ID)
    }

    /// Should a data message from `sender_id` be delivered to `app_id`?
    pub fn is_registered_for(&self, app_id: &str, sender_id: &str) -> bool {
        let classic = match self.registrations.get(app_id) {
            Some(CachedRegistration { key: RegistrationKey::Classic { sender_ids, .. }, .. }) => sender_ids.contains(sender_id),
            _ => false,
        };
        classic || self.registrations.contains_key(&RegistrationKey::token(app_id, sender_id, DATA_MESSAGE_SCOPE).serialized_key())
    }

    pub fn registered_app_ids(&self) -> Vec<String> {
        let mut result = self.registrations.values()
            .map(|cached| cached.key.app_id().to_string())
            .collect::<Vec<_>>();
        result.sort();
        result.dedup();
        result
    }

    fn new_request_id(&mut self) -> u64 {
        let result = self.next_request_id;
        self.next_request_id += 1;
        result
    }
}
