use std::collections::BTreeMap;

use crate::client::client_events::ResultCode;

pub type MessageData = BTreeMap<String, String>;

/// An upstream message submitted by an app
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutgoingMessage {
    pub id: String,
    /// seconds; 0 means 'deliver now or never'
    pub time_to_live: u32,
    pub data: MessageData,
}
impl OutgoingMessage {
    pub fn new(id: &str, time_to_live: u32, data: MessageData) -> OutgoingMessage {
        OutgoingMessage {
            id: id.to_string(),
            time_to_live,
            data,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IncomingMessage {
    pub sender_id: String,
    pub collapse_key: Option<String>,
    pub data: MessageData,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendErrorDetails {
    pub message_id: String,
    pub result: ResultCode,
    pub additional_data: MessageData,
}
