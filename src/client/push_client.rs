use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::checkin::checkin_messages::{AccountTokenInfo, BuildInfo};
use crate::client::client_config::ClientConfig;
use crate::client::client_driver::{spawn_client_driver, ClientStatistics, Collaborators, Command};
use crate::client::client_events::{ClientEvent, ClientEventNotifier};
use crate::client::client_state::StartMode;
use crate::registration::registration_key::RegistrationKey;
use crate::router::messages::OutgoingMessage;
use crate::store::credential_store::{AccountMapping, CredentialStore};

/// The application's handle to a push client. Calls only enqueue a command for the task that
///  owns the client's state, results arrive as [ClientEvent]s.
///
/// Handles can be cloned freely. The client shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct PushClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl PushClient {
    /// Spawns the client on the current tokio runtime and returns its handle together with
    ///  the stream of events for the application.
    pub fn new(config: ClientConfig, collaborators: Collaborators) -> anyhow::Result<(PushClient, mpsc::UnboundedReceiver<ClientEvent>)> {
        config.validate()?;

        let (commands, commands_recv) = mpsc::unbounded_channel();
        let (notifier, events) = ClientEventNotifier::new();
        spawn_client_driver(Arc::new(config), collaborators, notifier, commands_recv);
        Ok((PushClient { commands }, events))
    }

    fn send_command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("client is shut down - dropping command");
        }
    }

    /// Provides the build information and the store. Valid only for a new client, or after
    ///  the store could not be recovered ([ClientEvent::StoreResetFailed]).
    pub fn initialize(&self, build_info: BuildInfo, store: Arc<dyn CredentialStore>) {
        self.send_command(Command::Initialize { build_info, store });
    }

    pub fn start(&self, mode: StartMode) {
        self.send_command(Command::Start(mode));
    }

    /// Goes offline and drops all pending work. Credentials are kept, `start()` resumes.
    pub fn stop(&self) {
        self.send_command(Command::Stop);
    }

    pub fn register(&self, key: RegistrationKey) {
        self.send_command(Command::Register(key));
    }

    pub fn unregister(&self, key: RegistrationKey) {
        self.send_command(Command::Unregister(key));
    }

    pub fn send(&self, app_id: &str, receiver_id: &str, message: OutgoingMessage) {
        self.send_command(Command::Send {
            app_id: app_id.to_string(),
            receiver_id: receiver_id.to_string(),
            message,
        });
    }

    pub fn set_account_tokens(&self, tokens: Vec<AccountTokenInfo>) {
        self.send_command(Command::SetAccountTokens(tokens));
    }

    pub fn update_account_mapping(&self, mapping: AccountMapping) {
        self.send_command(Command::UpdateAccountMapping(mapping));
    }

    pub fn remove_account_mapping(&self, account_id: &str) {
        self.send_command(Command::RemoveAccountMapping(account_id.to_string()));
    }

    pub fn set_last_token_fetch_time(&self, time: SystemTime) {
        self.send_command(Command::SetLastTokenFetchTime(time));
    }

    /// Asks for heartbeats at least this often while `scope` is registered
    pub fn add_heartbeat_interval(&self, scope: &str, interval: Duration) {
        self.send_command(Command::AddHeartbeatInterval { scope: scope.to_string(), interval });
    }

    pub fn remove_heartbeat_interval(&self, scope: &str) {
        self.send_command(Command::RemoveHeartbeatInterval(scope.to_string()));
    }

    pub fn add_instance_id_data(&self, app_id: &str, instance_id: &str, extra_data: &str) {
        self.send_command(Command::AddInstanceIdData {
            app_id: app_id.to_string(),
            instance_id: instance_id.to_string(),
            extra_data: extra_data.to_string(),
        });
    }

    pub fn remove_instance_id_data(&self, app_id: &str) {
        self.send_command(Command::RemoveInstanceIdData(app_id.to_string()));
    }

    /// Returns the app's instance id and extra data
    pub async fn get_instance_id_data(&self, app_id: &str) -> anyhow::Result<Option<(String, String)>> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::GetInstanceIdData { app_id: app_id.to_string(), reply });
        response.await
            .map_err(|_| anyhow!("client is shut down"))
    }

    pub async fn get_statistics(&self) -> anyhow::Result<ClientStatistics> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::GetStatistics(reply));
        response.await
            .map_err(|_| anyhow!("client is shut down"))
    }
}
