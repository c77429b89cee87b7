use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};

const TOKEN_KEY_PREFIX: &str = "iid-";
pub const WILDCARD: &str = "*";

/// Identifies a registration: either the legacy per-app form with a set of sender ids, or the
///  instance-id form with an authorized entity and a scope.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum RegistrationKey {
    Classic {
        app_id: String,
        sender_ids: BTreeSet<String>,
    },
    Token {
        app_id: String,
        authorized_entity: String,
        scope: String,
    },
}

impl RegistrationKey {
    pub fn classic<S: Into<String>>(app_id: &str, sender_ids: impl IntoIterator<Item=S>) -> RegistrationKey {
        RegistrationKey::Classic {
            app_id: app_id.to_string(),
            sender_ids: sender_ids.into_iter().map(|s| s.into()).collect(),
        }
    }

    pub fn token(app_id: &str, authorized_entity: &str, scope: &str) -> RegistrationKey {
        RegistrationKey::Token {
            app_id: app_id.to_string(),
            authorized_entity: authorized_entity.to_string(),
            scope: scope.to_string(),
        }
    }

    pub fn app_id(&self) -> &str {
        match self {
            RegistrationKey::Classic { app_id, .. } => app_id,
            RegistrationKey::Token { app_id, .. } => app_id,
        }
    }

    /// `*` / `*` token keys stand for all token registrations of the app
    pub fn is_wildcard(&self) -> bool {
        match self {
            RegistrationKey::Classic { .. } => false,
            RegistrationKey::Token { authorized_entity, scope, .. } => authorized_entity == WILDCARD && scope == WILDCARD,
        }
    }

    /// Two keys with the same serialized key occupy the same registration slot
    pub fn serialized_key(&self) -> String {
        match self {
            RegistrationKey::Classic { app_id, .. } => app_id.clone(),
            RegistrationKey::Token { app_id, authorized_entity, scope } => format!("{}{},{},{}", TOKEN_KEY_PREFIX, app_id, authorized_entity, scope),
        }
    }

    pub fn serialized_value(&self, registration_id: &str) -> String {
        match self {
            RegistrationKey::Classic { sender_ids, .. } => {
                let senders = sender_ids.iter().map(|s| s.as_str()).collect::<Vec<_>>();
                format!("{}={}", senders.join(","), registration_id)
            }
            RegistrationKey::Token { .. } => format!("={}", registration_id),
        }
    }

    /// Parses a persisted registration, returning the key and the registration id
    pub fn parse(serialized_key: &str, serialized_value: &str) -> anyhow::Result<(RegistrationKey, String)> {
        let (senders, registration_id) = serialized_value.split_once('=')
            .ok_or_else(|| anyhow!("registration value without '='"))?;
        if registration_id.is_empty() {
            bail!("empty registration id");
        }

        let key = match serialized_key.strip_prefix(TOKEN_KEY_PREFIX) {
            Some(token_key) => {
                let parts = token_key.splitn(3, ',').collect::<Vec<_>>();
                if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
                    bail!("malformed token registration key {:?}", serialized_key);
                }
                RegistrationKey::token(parts[0], parts[1], parts[2])
            }
            None => {
                if serialized_key.is_empty() {
                    bail!("empty app id");
                }
                let sender_ids = senders.split(',')
                    .filter(|s| !s.is_empty())
                    .collect::<BTreeSet<_>>();
                if sender_ids.is_empty() {
                    bail!("classic registration without sender ids");
                }
                RegistrationKey::classic(serialized_key, sender_ids)
            }
        };
        Ok((key, registration_id.to_string()))
    }
}

impl Display for RegistrationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialized_key())
    }
}
