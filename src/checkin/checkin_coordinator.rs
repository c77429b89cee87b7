use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::checkin::checkin_messages::{AccountTokenInfo, BuildInfo, CheckinRequest, CheckinResponse};
use crate::checkin::checkin_state::{CheckinState, DeviceIdentity};
use crate::checkin::server_settings::ServerSettings;
use crate::client::client_config::ClientConfig;
use crate::store::credential_store::LoadResult;

#[derive(Debug, Eq, PartialEq)]
pub enum CheckinOutcome {
    /// The completion belongs to a request that was superseded or cancelled
    Stale,
    /// The response lacked an android id or security token; nothing was changed
    MissingCredentials,
    /// The server returned an identity that differs from the one established by the first
    ///  check-in. The identity is kept, otherwise the check-in counts as completed.
    IdentityMismatch {
        settings_changed: bool,
    },
    Accepted {
        first_checkin: bool,
        settings_changed: bool,
    },
}

#[derive(Debug, Eq, PartialEq)]
pub enum AccountsUpdate {
    /// an account that took part in the last check-in is gone
    AccountRemoved,
    /// accounts are known for the first time, periodic check-ins can start
    FirstConfirmation,
    Unchanged,
}

/// Owns the device identity and everything around check-in: account tokens, the state of the last
///  check-in, server settings, and the decision when to check in next. It does no I/O itself.
pub struct CheckinCoordinator {
    config: Arc<ClientConfig>,
    identity: DeviceIdentity,
    account_tokens: BTreeMap<String, String>,
    state: CheckinState,
    settings: ServerSettings,
    pending_request: Option<u64>,
    next_request_id: u64,
}
impl CheckinCoordinator {
    pub fn new(config: Arc<ClientConfig>) -> CheckinCoordinator {
        CheckinCoordinator {
            config,
            identity: Default::default(),
            account_tokens: Default::default(),
            state: Default::default(),
            settings: ServerSettings::new(),
            pending_request: None,
            next_request_id: 1,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn state(&self) -> &CheckinState {
        &self.state
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn is_request_pending(&self) -> bool {
        self.pending_request.is_some()
    }

    pub fn on_load(&mut self, loaded: &LoadResult) {
        self.identity = loaded.identity;
        self.state.last_checkin_time = loaded.last_checkin_time;
        self.state.last_checkin_accounts = loaded.last_checkin_accounts.clone();
        // without accounts in the last check-in, there is nothing to wait for
        self.state.accounts_confirmed = loaded.last_checkin_accounts.is_empty();
        self.settings.update_from_load(&loaded.gservices_settings, &loaded.gservices_digest);
    }

    /// Forgets the device identity, e.g. before an initial check-in
    pub fn clear_identity(&mut self) {
        self.identity = Default::default();
    }

    pub fn reset(&mut self) {
        self.identity = Default::default();
        self.account_tokens.clear();
        self.state = Default::default();
        self.pending_request = None;
    }

    /// Returns the request to send, or `None` if a check-in is in flight already
    pub fn start_checkin(&mut self, build_info: &BuildInfo) -> Option<(u64, CheckinRequest)> {
        if self.pending_request.is_some() {
            debug!("check-in already in progress");
            return None;
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending_request = Some(request_id);

        self.state.last_checkin_accounts = self.account_tokens.keys().cloned().collect();

        info!("starting check-in #{}", request_id);
        Some((request_id, CheckinRequest {
            identity: self.identity,
            account_tokens: self.account_tokens.clone(),
            settings_digest: self.settings.digest().to_string(),
            build_info: build_info.clone(),
            url: self.settings.checkin_url(&self.config),
        }))
    }

    /// Drops a check-in in flight; its eventual completion will be reported as [CheckinOutcome::Stale].
    pub fn cancel_pending(&mut self) {
        self.pending_request = None;
    }

    pub fn on_checkin_failed(&mut self, request_id: u64) {
        if self.pending_request == Some(request_id) {
            self.pending_request = None;
        }
    }

    pub fn on_checkin_completed(&mut self, request_id: u64, response: &CheckinResponse, now: SystemTime) -> CheckinOutcome {
        if self.pending_request != Some(request_id) {
            debug!("completion of check-in #{} is stale - ignoring", request_id);
            return CheckinOutcome::Stale;
        }
        self.pending_request = None;

        let received = match (response.android_id, response.security_token) {
            (Some(android_id), Some(security_token)) => DeviceIdentity::new(android_id, security_token),
            _ => {
                warn!("check-in response without device credentials - ignoring");
                return CheckinOutcome::MissingCredentials;
            }
        };
        if !received.is_valid() {
            warn!("check-in response with unassigned device credentials - ignoring");
            return CheckinOutcome::MissingCredentials;
        }

        let first_checkin = !self.identity.is_valid();
        let identity_mismatch = !first_checkin && self.identity != received;
        if first_checkin {
            self.identity = received;
            self.state.accounts_confirmed = true;
        }
        else if identity_mismatch {
            error!("check-in returned android id {} but device is {} - keeping the device identity", received.android_id, self.identity.android_id);
        }

        let settings_changed = self.settings.update_from_checkin_response(response);
        self.state.last_checkin_time = Some(now);

        if identity_mismatch {
            CheckinOutcome::IdentityMismatch { settings_changed }
        }
        else {
            CheckinOutcome::Accepted {
                first_checkin,
                settings_changed,
            }
        }
    }

    /// Delay until the next periodic check-in, or `None` if none should be scheduled right now
    pub fn time_to_next_checkin(&self, now: SystemTime) -> Option<Duration> {
        if self.pending_request.is_some() || !self.state.accounts_confirmed {
            return None;
        }

        let last_checkin = self.state.last_checkin_time.unwrap_or(UNIX_EPOCH);
        let Some(next_checkin) = last_checkin.checked_add(self.settings.checkin_interval(&self.config)) else {
            warn!("next check-in after {:?} is out of range - not scheduling", last_checkin);
            return None;
        };
        Some(next_checkin.duration_since(now).unwrap_or(Duration::ZERO))
    }

    pub fn set_account_tokens(&mut self, tokens: &[AccountTokenInfo]) -> AccountsUpdate {
        self.account_tokens = tokens.iter()
            .map(|t| (t.email.clone(), t.access_token.clone()))
            .collect();

        let was_confirmed = self.state.accounts_confirmed;
        self.state.accounts_confirmed = true;

        let removed = self.state.last_checkin_accounts.iter()
            .any(|account| !self.account_tokens.contains_key(account));

        if removed {
            AccountsUpdate::AccountRemoved
        }
        else if !was_confirmed {
            AccountsUpdate::FirstConfirmation
        }
        else {
            AccountsUpdate::Unchanged
        }
    }

    pub fn last_checkin_accounts(&self) -> &BTreeSet<String> {
        &self.state.last_checkin_accounts
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use rstest::rstest;
    use crate::checkin::checkin_messages::{Channel, Platform};
    use super::*;

    fn build_info() -> BuildInfo {
        BuildInfo::new(Platform::Linux, Channel::Stable, "121.0.1")
    }

    fn response(android_id: u64, security_token: u64) -> CheckinResponse {
        CheckinResponse {
            android_id: Some(android_id),
            security_token: Some(security_token),
            ..Default::default()
        }
    }

    fn account(email: &str) -> AccountTokenInfo {
        AccountTokenInfo {
            account_id: format!("id-{}", email),
            email: email.to_string(),
            access_token: format!("token-{}", email),
        }
    }

    fn time(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn new_coordinator() -> CheckinCoordinator {
        CheckinCoordinator::new(Arc::new(ClientConfig::new()))
    }

    #[test]
    fn test_first_checkin() {
        let mut coordinator = new_coordinator();
        let (request_id, request) = coordinator.start_checkin(&build_info()).unwrap();
        assert_eq!(request.identity, DeviceIdentity::default());
        assert!(coordinator.start_checkin(&build_info()).is_none());

        let outcome = coordinator.on_checkin_completed(request_id, &response(42, 99), time(1000));
        assert_eq!(outcome, CheckinOutcome::Accepted { first_checkin: true, settings_changed: false });
        assert_eq!(coordinator.identity(), DeviceIdentity::new(42, 99));
        assert!(coordinator.state().accounts_confirmed);
        assert_eq!(coordinator.state().last_checkin_time, Some(time(1000)));
        assert!(!coordinator.is_request_pending());
    }

    #[test]
    fn test_identity_is_stable() {
        let mut coordinator = new_coordinator();
        let (request_id, _) = coordinator.start_checkin(&build_info()).unwrap();
        coordinator.on_checkin_completed(request_id, &response(42, 99), time(1000));

        let (request_id, request) = coordinator.start_checkin(&build_info()).unwrap();
        assert_eq!(request.identity, DeviceIdentity::new(42, 99));
        assert_eq!(coordinator.on_checkin_completed(request_id, &response(43, 99), time(2000)), CheckinOutcome::IdentityMismatch { settings_changed: false });
        assert_eq!(coordinator.identity(), DeviceIdentity::new(42, 99));
        assert_eq!(coordinator.state().last_checkin_time, Some(time(2000)));
        assert_eq!(coordinator.time_to_next_checkin(time(2000)), Some(Duration::from_secs(2 * 24 * 3600)));

        let (request_id, _) = coordinator.start_checkin(&build_info()).unwrap();
        assert_eq!(coordinator.on_checkin_completed(request_id, &response(42, 99), time(3000)), CheckinOutcome::Accepted { first_checkin: false, settings_changed: false });
        assert_eq!(coordinator.state().last_checkin_time, Some(time(3000)));
    }

    #[rstest]
    #[case::no_id(None, Some(99))]
    #[case::no_token(Some(42), None)]
    #[case::zero_id(Some(0), Some(99))]
    fn test_missing_credentials(#[case] android_id: Option<u64>, #[case] security_token: Option<u64>) {
        let mut coordinator = new_coordinator();
        let (request_id, _) = coordinator.start_checkin(&build_info()).unwrap();
        let response = CheckinResponse { android_id, security_token, ..Default::default() };

        assert_eq!(coordinator.on_checkin_completed(request_id, &response, time(1000)), CheckinOutcome::MissingCredentials);
        assert!(!coordinator.identity().is_valid());
        assert_eq!(coordinator.state().last_checkin_time, None);
    }

    #[test]
    fn test_cancelled_checkin_is_stale() {
        let mut coordinator = new_coordinator();
        let (first, _) = coordinator.start_checkin(&build_info()).unwrap();
        coordinator.cancel_pending();
        let (second, _) = coordinator.start_checkin(&build_info()).unwrap();

        assert_eq!(coordinator.on_checkin_completed(first, &response(42, 99), time(1000)), CheckinOutcome::Stale);
        assert!(coordinator.is_request_pending());
        assert!(matches!(coordinator.on_checkin_completed(second, &response(42, 99), time(1000)), CheckinOutcome::Accepted { .. }));
    }

    #[test]
    fn test_failed_checkin() {
        let mut coordinator = new_coordinator();
        let (request_id, _) = coordinator.start_checkin(&build_info()).unwrap();
        coordinator.on_checkin_failed(request_id);
        assert!(!coordinator.is_request_pending());
        assert!(coordinator.start_checkin(&build_info()).is_some());
    }

    #[rstest]
    #[case::due_later(1000, 1000 + 3600, Some(2 * 24 * 3600 - 3600))]
    #[case::overdue(1000, 1000 + 3 * 24 * 3600, Some(0))]
    #[case::exactly_due(1000, 1000 + 2 * 24 * 3600, Some(0))]
    fn test_time_to_next_checkin(#[case] last_checkin: u64, #[case] now: u64, #[case] expected_secs: Option<u64>) {
        let mut coordinator = new_coordinator();
        coordinator.on_load(&LoadResult {
            identity: DeviceIdentity::new(42, 99),
            last_checkin_time: Some(time(last_checkin)),
            ..Default::default()
        });

        assert_eq!(coordinator.time_to_next_checkin(time(now)), expected_secs.map(Duration::from_secs));
    }

    #[test]
    fn test_no_schedule_while_pending_or_unconfirmed() {
        let mut coordinator = new_coordinator();
        coordinator.on_load(&LoadResult {
            identity: DeviceIdentity::new(42, 99),
            last_checkin_time: Some(time(1000)),
            last_checkin_accounts: BTreeSet::from(["a@x.com".to_string()]),
            ..Default::default()
        });
        assert!(!coordinator.state().accounts_confirmed);
        assert_eq!(coordinator.time_to_next_checkin(time(2000)), None);

        assert_eq!(coordinator.set_account_tokens(&[account("a@x.com")]), AccountsUpdate::FirstConfirmation);
        assert!(coordinator.time_to_next_checkin(time(2000)).is_some());

        coordinator.start_checkin(&build_info()).unwrap();
        assert_eq!(coordinator.time_to_next_checkin(time(2000)), None);
    }

    #[test]
    fn test_account_removal() {
        let mut coordinator = new_coordinator();
        coordinator.set_account_tokens(&[account("a@x.com"), account("b@x.com")]);
        let (request_id, request) = coordinator.start_checkin(&build_info()).unwrap();
        assert_eq!(request.account_tokens.len(), 2);
        coordinator.on_checkin_completed(request_id, &response(42, 99), time(1000));

        assert_eq!(coordinator.set_account_tokens(&[account("a@x.com"), account("b@x.com"), account("c@x.com")]), AccountsUpdate::Unchanged);
        assert_eq!(coordinator.set_account_tokens(&[account("b@x.com")]), AccountsUpdate::AccountRemoved);
        assert_eq!(coordinator.set_account_tokens(&[]), AccountsUpdate::AccountRemoved);
    }

    #[test]
    fn test_out_of_range_interval_from_server() {
        let mut coordinator = new_coordinator();
        let (request_id, _) = coordinator.start_checkin(&build_info()).unwrap();
        let response = CheckinResponse {
            settings: vec![("checkin_interval".to_string(), u64::MAX.to_string())],
            digest: Some("new".to_string()),
            ..response(42, 99)
        };

        assert_eq!(coordinator.on_checkin_completed(request_id, &response, time(1000)), CheckinOutcome::Accepted { first_checkin: true, settings_changed: false });
        assert_eq!(coordinator.time_to_next_checkin(time(2000)), Some(Duration::from_secs(2 * 24 * 3600 - 1000)));
    }

    #[test]
    fn test_last_checkin_far_in_the_future() {
        let mut coordinator = new_coordinator();
        coordinator.on_load(&LoadResult {
            identity: DeviceIdentity::new(42, 99),
            last_checkin_time: Some(time(u64::MAX / 2)),
            ..Default::default()
        });
        assert_eq!(coordinator.time_to_next_checkin(time(2000)), None);
    }

    #[test]
    fn test_checkin_url() {
        let mut coordinator = new_coordinator();
        let (request_id, request) = coordinator.start_checkin(&build_info()).unwrap();
        assert_eq!(request.url, ClientConfig::new().default_checkin_url);

        let response = CheckinResponse {
            settings: vec![("checkin_url".to_string(), "https://checkin.example.com".to_string())],
            digest: Some("new".to_string()),
            ..response(42, 99)
        };
        coordinator.on_checkin_completed(request_id, &response, time(1000));

        let (_, request) = coordinator.start_checkin(&build_info()).unwrap();
        assert_eq!(request.url, "https://checkin.example.com");
    }

    #[test]
    fn test_load_without_accounts_is_confirmed() {
        let mut coordinator = new_coordinator();
        coordinator.on_load(&LoadResult {
            identity: DeviceIdentity::new(42, 99),
            ..Default::default()
        });
        assert!(coordinator.state().accounts_confirmed);
        assert_eq!(coordinator.time_to_next_checkin(time(10 * 24 * 3600)), Some(Duration::ZERO));
    }
}
