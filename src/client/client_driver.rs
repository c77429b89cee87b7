use std::collections::{BTreeMap, VecDeque};
use std::future::{pending, Future};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::checkin::checkin_coordinator::{AccountsUpdate, CheckinCoordinator, CheckinOutcome};
use crate::checkin::checkin_messages::{AccountTokenInfo, BuildInfo, CheckinResponse, CheckinService};
use crate::client::client_config::ClientConfig;
use crate::client::client_events::{ClientEvent, ClientEventNotifier, ReadyData, RegisterFinishedData, ResultCode, SendFinishedData, UnregisterFinishedData};
use crate::client::client_state::{ClientState, StartMode};
use crate::connection::connection_manager::{ConnectionChange, ConnectionEvent, ConnectionManager, ConnectionState};
use crate::connection::transport::ConnectionFactory;
use crate::registration::registration_key::RegistrationKey;
use crate::registration::registration_manager::{RegisterDecision, RegistrationManager, UnregisterDecision};
use crate::registration::registration_service::{RegistrationRequest, RegistrationResponse, RegistrationService, RegistrationStatus, UnregistrationRequest, UnregistrationStatus};
use crate::router::message_router::MessageRouter;
use crate::router::messages::OutgoingMessage;
use crate::store::credential_store::{AccountMapping, CredentialStore, LoadError, LoadResult};
use crate::stream::stream_client::{StreamClient, StreamEvent};
use crate::util::clock::Clock;

/// The services the client talks to. They are trait objects so tests and embedders can plug
///  in their own.
#[derive(Clone)]
pub struct Collaborators {
    pub checkin_service: Arc<dyn CheckinService>,
    pub registration_service: Arc<dyn RegistrationService>,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientStatistics {
    pub state: ClientState,
    pub connection_state: ConnectionState,
    pub stream_created: bool,
    pub send_queue_size: usize,
    pub resend_queue_size: usize,
    pub android_id: Option<u64>,
    pub registered_app_ids: Vec<String>,
}

/// Requests from [crate::client::push_client::PushClient] handles to the driver
pub enum Command {
    Initialize { build_info: BuildInfo, store: Arc<dyn CredentialStore> },
    Start(StartMode),
    Stop,
    Register(RegistrationKey),
    Unregister(RegistrationKey),
    Send { app_id: String, receiver_id: String, message: OutgoingMessage },
    SetAccountTokens(Vec<AccountTokenInfo>),
    UpdateAccountMapping(AccountMapping),
    RemoveAccountMapping(String),
    SetLastTokenFetchTime(SystemTime),
    AddHeartbeatInterval { scope: String, interval: Duration },
    RemoveHeartbeatInterval(String),
    AddInstanceIdData { app_id: String, instance_id: String, extra_data: String },
    RemoveInstanceIdData(String),
    GetInstanceIdData { app_id: String, reply: oneshot::Sender<Option<(String, String)>> },
    GetStatistics(oneshot::Sender<ClientStatistics>),
}

/// Results of background work, marshalled back to the driver. They are tagged with the epoch
///  they were started in, and `stop()` starts a new epoch.
enum Completion {
    StoreLoaded(Result<LoadResult, LoadError>),
    StoreDestroyed(bool),
    StoreWritten { operation: &'static str, success: bool },
    CheckinFinished { request_id: u64, result: anyhow::Result<CheckinResponse> },
    RegisterFinished { key: RegistrationKey, request_id: u64, result: anyhow::Result<RegistrationResponse> },
    UnregisterFinished { key: RegistrationKey, request_id: u64, result: anyhow::Result<UnregistrationStatus> },
}

enum DeferredRequest {
    Register(RegistrationKey),
    Unregister(RegistrationKey),
}

pub fn spawn_client_driver(
    config: Arc<ClientConfig>,
    collaborators: Collaborators,
    notifier: ClientEventNotifier,
    commands: mpsc::UnboundedReceiver<Command>,
) -> JoinHandle<()> {
    let (completions_send, completions_recv) = mpsc::unbounded_channel();
    let (connection_send, connection_recv) = mpsc::unbounded_channel();
    let driver = ClientDriver::new(config, collaborators, notifier, completions_send, connection_send);
    tokio::spawn(driver.run(commands, completions_recv, connection_recv))
}

/// Owns all client state. Everything that changes state happens on this task, in response to
///  commands, completions of background work, connection events or timers.
struct ClientDriver {
    config: Arc<ClientConfig>,
    collaborators: Collaborators,
    notifier: ClientEventNotifier,

    state: ClientState,
    start_mode: StartMode,
    build_info: Option<BuildInfo>,
    store: Option<Arc<dyn CredentialStore>>,
    /// whether the in-flight load may create the store
    loading_creates_store: bool,
    /// set when the store was destroyed because it could not be loaded, cleared by a successful load
    store_was_reset: bool,

    checkin: CheckinCoordinator,
    registrations: RegistrationManager,
    router: MessageRouter,
    stream: Option<StreamClient>,
    connection: Option<ConnectionManager>,

    account_mappings: Vec<AccountMapping>,
    last_token_fetch_time: Option<SystemTime>,
    /// app id -> (instance id, extra data)
    instance_id_data: BTreeMap<String, (String, String)>,
    heartbeat_intervals: BTreeMap<String, Duration>,
    deferred: VecDeque<DeferredRequest>,
    periodic_checkin_at: Option<Instant>,

    epoch: u64,
    completions: mpsc::UnboundedSender<(u64, Completion)>,
    connection_events: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
    /// last generation used by a connection manager, carried over to the next one
    connection_generation: u64,
}

impl ClientDriver {
    fn new(
        config: Arc<ClientConfig>,
        collaborators: Collaborators,
        notifier: ClientEventNotifier,
        completions: mpsc::UnboundedSender<(u64, Completion)>,
        connection_events: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
    ) -> ClientDriver {
        ClientDriver {
            checkin: CheckinCoordinator::new(config.clone()),
            router: MessageRouter::new(&config.send_from),
            config,
            collaborators,
            notifier,
            state: ClientState::Uninitialized,
            start_mode: StartMode::Delayed,
            build_info: None,
            store: None,
            loading_creates_store: false,
            store_was_reset: false,
            registrations: RegistrationManager::new(),
            stream: None,
            connection: None,
            account_mappings: Vec::new(),
            last_token_fetch_time: None,
            instance_id_data: BTreeMap::new(),
            heartbeat_intervals: BTreeMap::new(),
            deferred: VecDeque::new(),
            periodic_checkin_at: None,
            epoch: 0,
            completions,
            connection_events,
            connection_generation: 0,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<(u64, Completion)>,
        mut connection_events: mpsc::UnboundedReceiver<(u64, ConnectionEvent)>,
    ) {
        loop {
            let checkin_deadline = self.periodic_checkin_at;
            let stream_deadline = self.stream.as_ref().and_then(|s| s.next_deadline());

            select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        info!("all client handles were dropped - shutting down");
                        if let Some(connection) = &mut self.connection {
                            connection.close();
                        }
                        return;
                    }
                },
                Some((epoch, completion)) = completions.recv() => self.on_completion(epoch, completion),
                Some((generation, event)) = connection_events.recv() => self.on_connection_event(generation, event),
                _ = sleep_until_deadline(checkin_deadline) => {
                    debug!("periodic check-in is due");
                    self.periodic_checkin_at = None;
                    self.start_checkin();
                }
                _ = sleep_until_deadline(stream_deadline) => self.on_stream_timer(),
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Initialize { build_info, store } => self.initialize(build_info, store),
            Command::Start(mode) => self.start(mode),
            Command::Stop => self.stop(),
            Command::Register(key) => self.register(key),
            Command::Unregister(key) => self.unregister(key),
            Command::Send { app_id, receiver_id, message } => self.send(&app_id, &receiver_id, message),
            Command::SetAccountTokens(tokens) => self.set_account_tokens(&tokens),
            Command::UpdateAccountMapping(mapping) => self.update_account_mapping(mapping),
            Command::RemoveAccountMapping(account_id) => self.remove_account_mapping(account_id),
            Command::SetLastTokenFetchTime(time) => {
                self.last_token_fetch_time = Some(time);
                self.persist("set last token fetch time", move |store| async move {
                    store.set_last_token_fetch_time(time).await
                });
            }
            Command::AddHeartbeatInterval { scope, interval } => self.add_heartbeat_interval(scope, interval),
            Command::RemoveHeartbeatInterval(scope) => {
                self.heartbeat_intervals.remove(&scope);
                if let Some(stream) = &mut self.stream {
                    stream.remove_heartbeat_interval(&scope);
                }
            }
            Command::AddInstanceIdData { app_id, instance_id, extra_data } => self.add_instance_id_data(app_id, instance_id, extra_data),
            Command::RemoveInstanceIdData(app_id) => {
                self.instance_id_data.remove(&app_id);
                self.persist("remove instance id data", move |store| async move {
                    store.remove_instance_id_data(&app_id).await
                });
            }
            Command::GetInstanceIdData { app_id, reply } => {
                let _ = reply.send(self.instance_id_data.get(&app_id).cloned());
            }
            Command::GetStatistics(reply) => {
                let _ = reply.send(self.statistics());
            }
        }
    }

    fn on_completion(&mut self, epoch: u64, completion: Completion) {
        if epoch != self.epoch {
            debug!("discarding result of work started before the client was stopped");
            return;
        }

        match completion {
            Completion::StoreLoaded(result) => self.on_store_loaded(result),
            Completion::StoreDestroyed(success) => self.on_store_destroyed(success),
            Completion::StoreWritten { operation, success } => {
                if !success {
                    warn!("failed to {} in the credential store", operation);
                }
            }
            Completion::CheckinFinished { request_id, result } => self.on_checkin_finished(request_id, result),
            Completion::RegisterFinished { key, request_id, result } => self.on_register_finished(key, request_id, result),
            Completion::UnregisterFinished { key, request_id, result } => self.on_unregister_finished(key, request_id, result),
        }
    }

    fn spawn_completion(&self, work: impl Future<Output = Completion> + Send + 'static) {
        let epoch = self.epoch;
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let completion = work.await;
            let _ = completions.send((epoch, completion));
        });
    }

    /// Writes to the store in the background. Failures are logged, nothing else depends on them.
    fn persist<F, Fut>(&self, operation: &'static str, write: F)
    where
        F: FnOnce(Arc<dyn CredentialStore>) -> Fut,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let Some(store) = self.store.clone() else {
            warn!("no credential store to {} - ignoring", operation);
            return;
        };
        let write = write(store);
        self.spawn_completion(async move {
            Completion::StoreWritten { operation, success: write.await }
        });
    }

    fn now(&self) -> SystemTime {
        self.collaborators.clock.now()
    }

    // ---------------- lifecycle

    fn initialize(&mut self, build_info: BuildInfo, store: Arc<dyn CredentialStore>) {
        if self.state != ClientState::Uninitialized {
            warn!("initialize() in state {} - ignoring", self.state);
            return;
        }
        info!("initializing client for version {}", build_info.version);
        self.build_info = Some(build_info);
        self.store = Some(store);
        self.store_was_reset = false;
        self.state = ClientState::Initialized;
    }

    fn start(&mut self, mode: StartMode) {
        if self.state == ClientState::Uninitialized {
            warn!("start() before initialize() - ignoring");
            return;
        }
        if mode == StartMode::Immediate {
            self.start_mode = StartMode::Immediate;
        }

        match self.state {
            ClientState::Initialized => self.load_store(),
            ClientState::Loaded if self.start_mode == StartMode::Immediate => self.start_protocol(),
            _ => debug!("start() in state {} - nothing to do", self.state),
        }
    }

    /// Pending registration work counts as demand: go as far as the latched start mode allows
    fn ensure_started(&mut self) {
        match self.state {
            ClientState::Initialized => self.load_store(),
            ClientState::Loaded => self.start_protocol(),
            _ => {}
        }
    }

    fn load_store(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let create_if_missing = self.start_mode == StartMode::Immediate;
        debug!("loading credential store (create if missing: {})", create_if_missing);
        self.state = ClientState::Loading;
        self.loading_creates_store = create_if_missing;
        self.spawn_completion(async move {
            Completion::StoreLoaded(store.load(create_if_missing).await)
        });
    }

    fn on_store_loaded(&mut self, result: Result<LoadResult, LoadError>) {
        if self.state != ClientState::Loading {
            warn!("store load finished in state {} - ignoring", self.state);
            return;
        }

        let loaded = match result {
            Ok(loaded) => loaded,
            Err(LoadError::NotFound) => {
                debug!("no credential store yet");
                self.state = ClientState::Initialized;
                if self.start_mode == StartMode::Immediate && !self.loading_creates_store {
                    // immediate start was requested while loading
                    self.load_store();
                }
                return;
            }
            Err(e) => {
                warn!("{}", e);
                self.reset_store();
                return;
            }
        };

        self.store_was_reset = false;
        self.checkin.on_load(&loaded);
        let num_registrations = self.registrations.load(&loaded.registrations);
        self.load_instance_id_data(&loaded.instance_id_data);
        self.account_mappings = loaded.account_mappings;
        self.last_token_fetch_time = loaded.last_token_fetch_time;
        self.state = ClientState::Loaded;
        info!("credential store loaded with {} registrations", num_registrations);

        if self.start_mode == StartMode::Delayed && !self.registrations.has_standalone_registered_app() && self.deferred.is_empty() {
            debug!("delayed start without registrations - staying offline");
            return;
        }
        self.start_protocol();
    }

    fn load_instance_id_data(&mut self, persisted: &BTreeMap<String, String>) {
        self.instance_id_data.clear();
        for (app_id, serialized) in persisted {
            match serialized.split_once(',') {
                Some((instance_id, extra_data)) => {
                    self.instance_id_data.insert(app_id.clone(), (instance_id.to_string(), extra_data.to_string()));
                }
                None => warn!("skipping unparsable instance id data for {}", app_id),
            }
        }
    }

    fn reset_store(&mut self) {
        if self.store_was_reset {
            error!("credential store is still unusable after it was reset - giving up");
            self.on_store_failed();
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };

        info!("destroying the unusable credential store");
        self.store_was_reset = true;
        self.spawn_completion(async move {
            Completion::StoreDestroyed(store.destroy().await)
        });
    }

    fn on_store_destroyed(&mut self, success: bool) {
        if !success {
            error!("failed to destroy the credential store");
            self.on_store_failed();
            return;
        }
        self.state = ClientState::Initialized;
        self.start(self.start_mode);
    }

    fn on_store_failed(&mut self) {
        self.state = ClientState::Uninitialized;
        self.notifier.send_event(ClientEvent::StoreResetFailed);
    }

    fn start_protocol(&mut self) {
        let Some(build_info) = &self.build_info else {
            return;
        };

        let mut stream = StreamClient::new(self.config.clone(), &build_info.client_version());
        for (scope, interval) in &self.heartbeat_intervals {
            stream.add_heartbeat_interval(scope, *interval);
        }
        self.stream = Some(stream);
        self.connection = Some(ConnectionManager::new(
            self.collaborators.connection_factory.clone(),
            self.config.connection_backoff.clone(),
            self.config.connection_stable_after,
            self.config.max_frame_size,
            self.connection_events.clone(),
            self.connection_generation,
        ));

        if self.checkin.identity().is_valid() {
            self.schedule_periodic_checkin();
            self.on_ready();
        }
        else {
            info!("no device identity yet - checking in");
            self.state = ClientState::CheckingIn;
            self.checkin.clear_identity();
            self.start_checkin();
        }
    }

    fn on_ready(&mut self) {
        info!("client is ready");
        self.state = ClientState::Ready;

        if let Some(stream) = &mut self.stream {
            stream.login(self.checkin.identity());
        }
        let endpoints = self.checkin.settings().mcs_endpoints(&self.config);
        if let Some(connection) = &mut self.connection {
            connection.connect(endpoints);
        }

        self.notifier.send_event(ClientEvent::Ready(ReadyData {
            account_mappings: self.account_mappings.clone(),
            last_token_fetch_time: self.last_token_fetch_time,
        }));

        while let Some(request) = self.deferred.pop_front() {
            match request {
                DeferredRequest::Register(key) => self.register(key),
                DeferredRequest::Unregister(key) => self.unregister(key),
            }
        }
    }

    fn stop(&mut self) {
        if self.state == ClientState::Uninitialized {
            warn!("stop() before initialize() - ignoring");
            return;
        }
        info!("stopping client");

        self.epoch += 1;
        self.periodic_checkin_at = None;
        self.checkin.reset();
        let was_connected = self.connection.as_ref().is_some_and(|c| c.state() == ConnectionState::Connected);
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            self.connection_generation = connection.generation();
        }
        self.stream = None;

        let dropped = self.registrations.clear_pending();
        if !dropped.is_empty() {
            debug!("dropping {} pending registration requests", dropped.len());
        }
        self.registrations.clear();
        self.deferred.clear();
        self.instance_id_data.clear();
        self.state = ClientState::Initialized;
        if was_connected {
            self.notifier.send_event(ClientEvent::Disconnected);
        }

        if let Some(store) = self.store.clone() {
            self.spawn_completion(async move {
                store.close().await;
                Completion::StoreWritten { operation: "close store", success: true }
            });
        }
    }

    // ---------------- check-in

    fn start_checkin(&mut self) {
        let Some(build_info) = &self.build_info else {
            return;
        };
        let Some((request_id, request)) = self.checkin.start_checkin(build_info) else {
            return;
        };

        let service = self.collaborators.checkin_service.clone();
        self.spawn_completion(async move {
            Completion::CheckinFinished { request_id, result: service.checkin(request).await }
        });
    }

    fn on_checkin_finished(&mut self, request_id: u64, result: anyhow::Result<CheckinResponse>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("check-in failed: {}", e);
                self.checkin.on_checkin_failed(request_id);
                return;
            }
        };

        let now = self.now();
        let (first_checkin, settings_changed) = match self.checkin.on_checkin_completed(request_id, &response, now) {
            CheckinOutcome::Accepted { first_checkin, settings_changed } => (first_checkin, settings_changed),
            CheckinOutcome::IdentityMismatch { settings_changed } => (false, settings_changed),
            CheckinOutcome::Stale | CheckinOutcome::MissingCredentials => return,
        };

        if first_checkin {
            let identity = self.checkin.identity();
            self.persist("set device credentials", move |store| async move {
                store.set_device_credentials(identity).await
            });
        }
        if settings_changed {
            let settings = self.checkin.settings().settings().clone();
            let digest = self.checkin.settings().digest().to_string();
            self.persist("set server settings", move |store| async move {
                store.set_gservices(&settings, &digest).await
            });
        }
        let accounts = self.checkin.last_checkin_accounts().clone();
        self.persist("set last check-in info", move |store| async move {
            store.set_last_checkin_info(now, &accounts).await
        });

        self.schedule_periodic_checkin();
        if first_checkin && self.state == ClientState::CheckingIn {
            self.on_ready();
        }
    }

    fn schedule_periodic_checkin(&mut self) {
        let Some(delay) = self.checkin.time_to_next_checkin(self.now()) else {
            return;
        };
        match Instant::now().checked_add(delay) {
            Some(at) => {
                debug!("next periodic check-in in {:?}", delay);
                self.periodic_checkin_at = Some(at);
            }
            None => warn!("periodic check-in delay of {:?} is out of range - not scheduling", delay),
        }
    }

    fn set_account_tokens(&mut self, tokens: &[AccountTokenInfo]) {
        let update = self.checkin.set_account_tokens(tokens);
        if self.state != ClientState::Ready && self.state != ClientState::CheckingIn {
            return;
        }

        match update {
            AccountsUpdate::AccountRemoved => {
                info!("an account was removed - checking in right away");
                self.checkin.cancel_pending();
                self.periodic_checkin_at = None;
                self.start_checkin();
            }
            AccountsUpdate::FirstConfirmation => self.schedule_periodic_checkin(),
            AccountsUpdate::Unchanged => {}
        }
    }

    fn update_account_mapping(&mut self, mapping: AccountMapping) {
        self.account_mappings.retain(|m| m.account_id != mapping.account_id);
        self.account_mappings.push(mapping.clone());
        self.persist("add account mapping", move |store| async move {
            store.add_account_mapping(&mapping).await
        });
    }

    fn remove_account_mapping(&mut self, account_id: String) {
        self.account_mappings.retain(|m| m.account_id != account_id);
        self.persist("remove account mapping", move |store| async move {
            store.remove_account_mapping(&account_id).await
        });
    }

    fn add_instance_id_data(&mut self, app_id: String, instance_id: String, extra_data: String) {
        let serialized = format!("{},{}", instance_id, extra_data);
        self.instance_id_data.insert(app_id.clone(), (instance_id, extra_data));
        self.persist("add instance id data", move |store| async move {
            store.add_instance_id_data(&app_id, &serialized).await
        });
    }

    // ---------------- registrations

    fn register(&mut self, key: RegistrationKey) {
        if self.state != ClientState::Ready {
            debug!("deferring registration of {} until the client is ready", key);
            self.deferred.push_back(DeferredRequest::Register(key));
            self.ensure_started();
            return;
        }

        match self.registrations.register(&key) {
            RegisterDecision::CacheHit(registration_id) => {
                debug!("{} is registered already", key);
                self.notifier.send_event(ClientEvent::RegisterFinished(RegisterFinishedData {
                    key,
                    registration_id,
                    result: ResultCode::Success,
                }));
            }
            RegisterDecision::AlreadyPending => debug!("registration of {} is in progress already", key),
            RegisterDecision::Issue(request_id) => {
                let request = RegistrationRequest {
                    identity: self.checkin.identity(),
                    instance_id: self.instance_id_for(&key),
                    key: key.clone(),
                    gcm_version: self.build_info.as_ref().map(|b| b.major_version()).unwrap_or(0),
                    url: self.checkin.settings().registration_url(&self.config),
                };
                let service = self.collaborators.registration_service.clone();
                self.spawn_completion(async move {
                    let result = service.register(request).await;
                    Completion::RegisterFinished { key, request_id, result }
                });
            }
        }
    }

    fn on_register_finished(&mut self, key: RegistrationKey, request_id: u64, result: anyhow::Result<RegistrationResponse>) {
        let response = result.unwrap_or_else(|e| {
            warn!("registration of {} failed: {}", key, e);
            RegistrationResponse::failure(RegistrationStatus::ServerError)
        });
        let Some(outcome) = self.registrations.on_register_completed(&key, request_id, response) else {
            return;
        };

        if let Some((serialized_key, serialized_value)) = outcome.persist {
            self.persist("add registration", move |store| async move {
                store.add_registration(&serialized_key, &serialized_value).await
            });
        }
        self.notifier.send_event(ClientEvent::RegisterFinished(RegisterFinishedData {
            key,
            registration_id: outcome.registration_id,
            result: outcome.result,
        }));
    }

    fn unregister(&mut self, key: RegistrationKey) {
        if self.state != ClientState::Ready {
            debug!("deferring unregistration of {} until the client is ready", key);
            self.deferred.push_back(DeferredRequest::Unregister(key));
            self.ensure_started();
            return;
        }

        match self.registrations.unregister(&key) {
            UnregisterDecision::AlreadyPending => debug!("unregistration of {} is in progress already", key),
            UnregisterDecision::Issue { request_id, removed_keys } => {
                for removed in removed_keys {
                    self.persist("remove registration", move |store| async move {
                        store.remove_registration(&removed).await
                    });
                }

                let request = UnregistrationRequest {
                    identity: self.checkin.identity(),
                    instance_id: self.instance_id_for(&key),
                    key: key.clone(),
                    url: self.checkin.settings().registration_url(&self.config),
                };
                let service = self.collaborators.registration_service.clone();
                self.spawn_completion(async move {
                    let result = service.unregister(request).await;
                    Completion::UnregisterFinished { key, request_id, result }
                });
            }
        }
    }

    fn on_unregister_finished(&mut self, key: RegistrationKey, request_id: u64, result: anyhow::Result<UnregistrationStatus>) {
        let status = result.unwrap_or_else(|e| {
            warn!("unregistration of {} failed: {}", key, e);
            UnregistrationStatus::ServerError
        });
        if let Some(result) = self.registrations.on_unregister_completed(&key, request_id, status) {
            self.notifier.send_event(ClientEvent::UnregisterFinished(UnregisterFinishedData { key, result }));
        }
    }

    fn instance_id_for(&self, key: &RegistrationKey) -> Option<String> {
        match key {
            RegistrationKey::Token { app_id, .. } => self.instance_id_data.get(app_id).map(|(instance_id, _)| instance_id.clone()),
            RegistrationKey::Classic { .. } => None,
        }
    }

    // ---------------- messages and the connection

    fn send(&mut self, app_id: &str, receiver_id: &str, message: OutgoingMessage) {
        let now_secs = self.now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let Some(stream) = self.stream.as_mut() else {
            debug!("message {} sent before the client was started", message.id);
            self.notifier.send_event(ClientEvent::SendFinished(SendFinishedData {
                app_id: app_id.to_string(),
                message_id: message.id,
                result: ResultCode::NotReady,
            }));
            return;
        };

        let stanza = self.router.build_outgoing(app_id, receiver_id, &message, now_secs);
        let status = stream.send_message(stanza, Instant::now());
        self.notifier.send_event(self.router.send_status_event(app_id, &message.id, status));
        self.flush_stream();
    }

    fn add_heartbeat_interval(&mut self, scope: String, interval: Duration) {
        if interval < self.config.minimum_heartbeat_interval {
            warn!("heartbeat interval {:?} for {} is below the minimum of {:?} - ignoring", interval, scope, self.config.minimum_heartbeat_interval);
            return;
        }
        if let Some(stream) = &mut self.stream {
            stream.add_heartbeat_interval(&scope, interval);
        }
        self.heartbeat_intervals.insert(scope, interval);
    }

    fn on_connection_event(&mut self, generation: u64, event: ConnectionEvent) {
        let Some(connection) = &mut self.connection else {
            return;
        };
        let Some(change) = connection.on_event(generation, event) else {
            return;
        };
        let Some(stream) = &mut self.stream else {
            return;
        };

        match change {
            ConnectionChange::Connected(endpoint) => {
                stream.on_connected();
                self.notifier.send_event(ClientEvent::Connected(endpoint));
            }
            ConnectionChange::FrameReceived(frame) => stream.on_frame(frame, Instant::now()),
            ConnectionChange::Disconnected(_) => {
                stream.on_disconnected();
                self.notifier.send_event(ClientEvent::Disconnected);
            }
        }
        self.flush_stream();
    }

    fn on_stream_timer(&mut self) {
        if let Some(stream) = &mut self.stream {
            stream.on_timer(Instant::now());
        }
        self.flush_stream();
    }

    /// Hands the stream's pending frames to the connection and its events to the application
    fn flush_stream(&mut self) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        let frames = stream.take_outgoing_frames();
        let events = stream.take_events();

        if let Some(connection) = &self.connection {
            for frame in frames {
                if !connection.send_frame(frame) {
                    debug!("no connection for outgoing frame - dropping");
                }
            }
        }

        for event in events {
            match event {
                StreamEvent::LoggedIn => debug!("stream is logged in"),
                StreamEvent::MessageReceived(stanza) => {
                    if let Some(event) = self.router.route_incoming(stanza, &self.registrations) {
                        self.notifier.send_event(event);
                    }
                }
                StreamEvent::SendStatus { app_id, message_id, status } => {
                    self.notifier.send_event(self.router.send_status_event(&app_id, &message_id, status));
                }
                StreamEvent::ResetConnection(reason) => {
                    warn!("resetting connection: {}", reason);
                    if let Some(connection) = &mut self.connection {
                        connection.reset_connection();
                    }
                }
            }
        }
    }

    fn statistics(&self) -> ClientStatistics {
        let identity = self.checkin.identity();
        ClientStatistics {
            state: self.state,
            connection_state: self.connection.as_ref().map(|c| c.state()).unwrap_or(ConnectionState::Disconnected),
            stream_created: self.stream.is_some(),
            send_queue_size: self.stream.as_ref().map(|s| s.send_queue_size()).unwrap_or(0),
            resend_queue_size: self.stream.as_ref().map(|s| s.resend_queue_size()).unwrap_or(0),
            android_id: identity.is_valid().then_some(identity.android_id),
            registered_app_ids: self.registrations.registered_app_ids(),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
