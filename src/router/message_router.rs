use tracing::{debug, warn};

use crate::client::client_events::{ClientEvent, MessageReceivedData, MessageSendErrorData, ResultCode, SendAcknowledgedData, SendFinishedData};
use crate::registration::registration_manager::RegistrationManager;
use crate::router::messages::{IncomingMessage, MessageData, OutgoingMessage, SendErrorDetails};
use crate::stream::frames::DataMessageStanza;
use crate::stream::send_queue::MessageSendStatus;

const MESSAGE_TYPE_KEY: &str = "message_type";
const DATA_MESSAGE_TYPE: &str = "gcm";
const DELETED_MESSAGES_TYPE: &str = "deleted_messages";
const SEND_ERROR_TYPE: &str = "send_error";
const SEND_ERROR_MESSAGE_ID_KEY: &str = "google.message_id";

#[derive(Debug, Eq, PartialEq)]
pub enum MessageType {
    Data,
    DeletedMessages,
    SendError,
    Unknown(String),
}
impl MessageType {
    /// a message without a type is a data message
    pub fn parse(s: Option<&str>) -> MessageType {
        match s {
            None | Some(DATA_MESSAGE_TYPE) => MessageType::Data,
            Some(DELETED_MESSAGES_TYPE) => MessageType::DeletedMessages,
            Some(SEND_ERROR_TYPE) => MessageType::SendError,
            Some(other) => MessageType::Unknown(other.to_string()),
        }
    }
}

/// Translates between the stream's data stanzas and the application's view of messages.
pub struct MessageRouter {
    send_from: String,
}
impl MessageRouter {
    pub fn new(send_from: &str) -> MessageRouter {
        MessageRouter {
            send_from: send_from.to_string(),
        }
    }

    /// Turns a received stanza into the event for its app, or `None` if it is not deliverable
    pub fn route_incoming(&self, stanza: DataMessageStanza, registrations: &RegistrationManager) -> Option<ClientEvent> {
        let app_id = stanza.category;
        let mut data = stanza.app_data.into_iter().collect::<MessageData>();
        let message_type = MessageType::parse(data.remove(MESSAGE_TYPE_KEY).as_deref());

        match message_type {
            MessageType::Data => {
                if !registrations.is_registered_for(&app_id, &stanza.from) {
                    debug!("dropping message from {} for {}: not registered", stanza.from, app_id);
                    return None;
                }
                Some(ClientEvent::MessageReceived(MessageReceivedData {
                    app_id,
                    message: IncomingMessage {
                        sender_id: stanza.from,
                        collapse_key: stanza.token,
                        data,
                    },
                }))
            }
            MessageType::DeletedMessages => Some(ClientEvent::MessagesDeleted(app_id)),
            MessageType::SendError => {
                let message_id = data.remove(SEND_ERROR_MESSAGE_ID_KEY).unwrap_or_default();
                Some(ClientEvent::MessageSendError(MessageSendErrorData {
                    app_id,
                    details: SendErrorDetails {
                        message_id,
                        result: ResultCode::ServerError,
                        additional_data: data,
                    },
                }))
            }
            MessageType::Unknown(t) => {
                warn!("message of unknown type {:?} for {} - ignoring", t, app_id);
                None
            }
        }
    }

    pub fn build_outgoing(&self, app_id: &str, receiver_id: &str, message: &OutgoingMessage, now_secs: u64) -> DataMessageStanza {
        DataMessageStanza {
            id: message.id.clone(),
            persistent_id: String::new(),
            from: self.send_from.clone(),
            to: receiver_id.to_string(),
            category: app_id.to_string(),
            token: None,
            ttl: message.time_to_live,
            sent: now_secs,
            last_stream_id_received: 0,
            app_data: message.data.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// The event that reports a send status of the stream to the application
    pub fn send_status_event(&self, app_id: &str, message_id: &str, status: MessageSendStatus) -> ClientEvent {
        match status {
            MessageSendStatus::TtlExceeded => ClientEvent::MessageSendError(MessageSendErrorData {
                app_id: app_id.to_string(),
                details: SendErrorDetails {
                    message_id: message_id.to_string(),
                    result: ResultCode::TtlExceeded,
                    additional_data: Default::default(),
                },
            }),
            MessageSendStatus::Sent => ClientEvent::SendAcknowledged(SendAcknowledgedData {
                app_id: app_id.to_string(),
                message_id: message_id.to_string(),
            }),
            status => ClientEvent::SendFinished(SendFinishedData {
                app_id: app_id.to_string(),
                message_id: message_id.to_string(),
                result: to_result_code(status),
            }),
        }
    }
}

pub fn to_result_code(status: MessageSendStatus) -> ResultCode {
    match status {
        MessageSendStatus::Queued | MessageSendStatus::Sent => ResultCode::Success,
        MessageSendStatus::QueueSizeLimitReached
        | MessageSendStatus::AppQueueSizeLimitReached
        | MessageSendStatus::NoConnectionOnZeroTtl
        | MessageSendStatus::TtlExceeded => ResultCode::NetworkError,
        MessageSendStatus::MessageTooLarge => ResultCode::InvalidParameter,
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use rstest::rstest;
    use crate::registration::registration_key::RegistrationKey;
    use crate::registration::registration_manager::RegisterDecision;
    use crate::registration::registration_service::RegistrationResponse;
    use super::*;

    fn registrations() -> RegistrationManager {
        let mut result = RegistrationManager::new();
        for key in [RegistrationKey::classic("app1", ["s1"]), RegistrationKey::token("app2", "e1", "GCM")] {
            let RegisterDecision::Issue(request_id) = result.register(&key) else { panic!() };
            result.on_register_completed(&key, request_id, RegistrationResponse::success("r")).unwrap();
        }
        result
    }

    fn stanza(app_id: &str, from: &str, data: &[(&str, &str)]) -> DataMessageStanza {
        DataMessageStanza {
            category: app_id.to_string(),
            from: from.to_string(),
            token: Some("ck".to_string()),
            app_data: data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::new("gcm@chrome.com")
    }

    #[rstest]
    #[case::no_type(&[("k", "v")])]
    #[case::explicit_type(&[("message_type", "gcm"), ("k", "v")])]
    fn test_data_message(#[case] data: &[(&str, &str)]) {
        let event = router().route_incoming(stanza("app1", "s1", data), &registrations());
        assert_eq!(event, Some(ClientEvent::MessageReceived(MessageReceivedData {
            app_id: "app1".to_string(),
            message: IncomingMessage {
                sender_id: "s1".to_string(),
                collapse_key: Some("ck".to_string()),
                data: BTreeMap::from([("k".to_string(), "v".to_string())]),
            },
        })));
    }

    #[rstest]
    #[case::classic("app1", "s1", true)]
    #[case::token("app2", "e1", true)]
    #[case::wrong_sender("app1", "s2", false)]
    #[case::unregistered_app("app3", "s1", false)]
    fn test_data_message_requires_registration(#[case] app_id: &str, #[case] from: &str, #[case] delivered: bool) {
        let event = router().route_incoming(stanza(app_id, from, &[]), &registrations());
        assert_eq!(event.is_some(), delivered);
    }

    #[test]
    fn test_deleted_messages() {
        let event = router().route_incoming(stanza("app3", "s1", &[("message_type", "deleted_messages")]), &registrations());
        assert_eq!(event, Some(ClientEvent::MessagesDeleted("app3".to_string())));
    }

    #[test]
    fn test_send_error() {
        let event = router().route_incoming(stanza("app1", "s1", &[("message_type", "send_error"), ("google.message_id", "m7"), ("error", "x")]), &registrations());
        assert_eq!(event, Some(ClientEvent::MessageSendError(MessageSendErrorData {
            app_id: "app1".to_string(),
            details: SendErrorDetails {
                message_id: "m7".to_string(),
                result: ResultCode::ServerError,
                additional_data: BTreeMap::from([("error".to_string(), "x".to_string())]),
            },
        })));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(router().route_incoming(stanza("app1", "s1", &[("message_type", "weird")]), &registrations()), None);
    }

    #[test]
    fn test_build_outgoing() {
        let message = OutgoingMessage::new("m1", 60, BTreeMap::from([("k".to_string(), "v".to_string())]));
        let stanza = router().build_outgoing("app1", "receiver@example.com", &message, 1234);
        assert_eq!(stanza.id, "m1");
        assert_eq!(stanza.from, "gcm@chrome.com");
        assert_eq!(stanza.to, "receiver@example.com");
        assert_eq!(stanza.category, "app1");
        assert_eq!(stanza.ttl, 60);
        assert_eq!(stanza.sent, 1234);
        assert_eq!(stanza.app_data, vec![("k".to_string(), "v".to_string())]);
    }

    #[rstest]
    #[case::queued(MessageSendStatus::Queued, ResultCode::Success)]
    #[case::queue_full(MessageSendStatus::QueueSizeLimitReached, ResultCode::NetworkError)]
    #[case::app_queue_full(MessageSendStatus::AppQueueSizeLimitReached, ResultCode::NetworkError)]
    #[case::zero_ttl(MessageSendStatus::NoConnectionOnZeroTtl, ResultCode::NetworkError)]
    #[case::too_large(MessageSendStatus::MessageTooLarge, ResultCode::InvalidParameter)]
    fn test_send_finished(#[case] status: MessageSendStatus, #[case] expected: ResultCode) {
        assert_eq!(router().send_status_event("app1", "m1", status), ClientEvent::SendFinished(SendFinishedData {
            app_id: "app1".to_string(),
            message_id: "m1".to_string(),
            result: expected,
        }));
    }

    #[test]
    fn test_send_acknowledged_and_ttl() {
        assert!(matches!(router().send_status_event("app1", "m1", MessageSendStatus::Sent), ClientEvent::SendAcknowledged(_)));
        let ClientEvent::MessageSendError(data) = router().send_status_event("app1", "m1", MessageSendStatus::TtlExceeded) else { panic!() };
        assert_eq!(data.details.result, ResultCode::TtlExceeded);
        assert_eq!(data.details.message_id, "m1");
    }
}
