use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::connection::transport::Endpoint;
use crate::registration::registration_key::RegistrationKey;
use crate::router::messages::{IncomingMessage, SendErrorDetails};
use crate::store::credential_store::AccountMapping;

/// Outcome of an operation as reported to the application
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultCode {
    Success,
    NetworkError,
    InvalidParameter,
    ServerError,
    TtlExceeded,
    NotReady,
    UnknownError,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    /// The client has a device identity and starts serving requests
    Ready(ReadyData),
    Connected(Endpoint),
    Disconnected,
    RegisterFinished(RegisterFinishedData),
    UnregisterFinished(UnregisterFinishedData),
    /// Immediate result of submitting an upstream message
    SendFinished(SendFinishedData),
    /// The server acknowledged receipt of an upstream message
    SendAcknowledged(SendAcknowledgedData),
    MessageSendError(MessageSendErrorData),
    MessageReceived(MessageReceivedData),
    /// The server dropped messages for the app, it should sync with its backend
    MessagesDeleted(String),
    /// The credential store could not be recovered; `initialize()` is the way out
    StoreResetFailed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadyData {
    pub account_mappings: Vec<AccountMapping>,
    pub last_token_fetch_time: Option<std::time::SystemTime>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegisterFinishedData {
    pub key: RegistrationKey,
    pub registration_id: String,
    pub result: ResultCode,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnregisterFinishedData {
    pub key: RegistrationKey,
    pub result: ResultCode,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendFinishedData {
    pub app_id: String,
    pub message_id: String,
    pub result: ResultCode,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendAcknowledgedData {
    pub app_id: String,
    pub message_id: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageSendErrorData {
    pub app_id: String,
    pub details: SendErrorDetails,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageReceivedData {
    pub app_id: String,
    pub message: IncomingMessage,
}


/// Delivers events to the application. Unlike a broadcast channel, nothing is dropped if the
///  application is slow, since results of requests must not get lost.
pub struct ClientEventNotifier {
    sender: mpsc::UnboundedSender<ClientEvent>,
}
impl ClientEventNotifier {
    pub fn new() -> (ClientEventNotifier, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ClientEventNotifier { sender }, receiver)
    }

    pub fn send_event(&self, event: ClientEvent) {
        trace!("event: {:?}", event);
        if self.sender.send(event).is_err() {
            warn!("event receiver was dropped - discarding event");
        }
    }
}
