use std::mem;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::checkin::checkin_state::DeviceIdentity;
use crate::client::client_config::ClientConfig;
use crate::connection::transport::RawFrame;
use crate::stream::frames::{DataMessageStanza, Frame, HeartbeatData, IqStanza, LoginRequestData};
use crate::stream::heartbeat::{HeartbeatAction, HeartbeatManager};
use crate::stream::send_queue::{MessageSendStatus, PendingMessage, SendQueue};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    /// no device identity yet
    Uninitialized,
    /// has an identity, waiting for a connection or for the login response
    Initialized,
    /// logged in, messages flow
    Connected,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamEvent {
    LoggedIn,
    MessageReceived(DataMessageStanza),
    SendStatus {
        app_id: String,
        message_id: String,
        status: MessageSendStatus,
    },
    /// the connection is unusable and should be re-established
    ResetConnection(String),
}

/// The message stream protocol on top of a connection: login, stream ids and acknowledgements,
///  heartbeats, and the outgoing queue.
///
/// This is plain logic without I/O: frames to write and events for the client accumulate
///  internally and are collected with [StreamClient::take_outgoing_frames] and
///  [StreamClient::take_events].
pub struct StreamClient {
    config: Arc<ClientConfig>,
    state: StreamState,
    identity: DeviceIdentity,
    client_version: String,
    transport_connected: bool,

    /// number of frames written on the current connection
    stream_id_out: u32,
    /// number of frames received on the current connection
    stream_id_in: u32,
    unacked_incoming: u32,
    /// persistent ids of received messages that were not yet covered by an acknowledgement
    unacked_persistent_ids: Vec<String>,

    send_queue: SendQueue,
    heartbeat: HeartbeatManager,

    outgoing_frames: Vec<RawFrame>,
    events: Vec<StreamEvent>,
}

impl StreamClient {
    pub fn new(config: Arc<ClientConfig>, client_version: &str) -> StreamClient {
        let send_queue = SendQueue::new(config.max_send_queue_size, config.max_app_send_queue_size);
        let heartbeat = HeartbeatManager::new(config.default_heartbeat_interval, config.minimum_heartbeat_interval, config.heartbeat_ack_timeout);

        StreamClient {
            config,
            state: StreamState::Uninitialized,
            identity: Default::default(),
            client_version: client_version.to_string(),
            transport_connected: false,
            stream_id_out: 0,
            stream_id_in: 0,
            unacked_incoming: 0,
            unacked_persistent_ids: Vec::new(),
            send_queue,
            heartbeat,
            outgoing_frames: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn send_queue_size(&self) -> usize {
        self.send_queue.send_len()
    }

    pub fn resend_queue_size(&self) -> usize {
        self.send_queue.resend_len()
    }

    pub fn take_outgoing_frames(&mut self) -> Vec<RawFrame> {
        mem::take(&mut self.outgoing_frames)
    }

    pub fn take_events(&mut self) -> Vec<StreamEvent> {
        mem::take(&mut self.events)
    }

    pub fn add_heartbeat_interval(&mut self, scope: &str, interval: std::time::Duration) -> bool {
        self.heartbeat.add_interval(scope, interval)
    }

    pub fn remove_heartbeat_interval(&mut self, scope: &str) {
        self.heartbeat.remove_interval(scope);
    }

    /// Provides the credentials to log in with. The login itself happens as soon as a
    ///  connection is available.
    pub fn login(&mut self, identity: DeviceIdentity) {
        if !identity.is_valid() {
            warn!("login without a valid device identity - ignoring");
            return;
        }
        self.identity = identity;
        if self.state == StreamState::Uninitialized {
            self.state = StreamState::Initialized;
        }
        if self.transport_connected && self.state == StreamState::Initialized {
            self.send_login();
        }
    }

    pub fn on_connected(&mut self) {
        self.transport_connected = true;
        self.stream_id_out = 0;
        self.stream_id_in = 0;
        self.unacked_incoming = 0;
        if self.state == StreamState::Initialized {
            self.send_login();
        }
    }

    pub fn on_disconnected(&mut self) {
        self.transport_connected = false;
        if self.state == StreamState::Connected {
            self.state = StreamState::Initialized;
        }
        self.heartbeat.stop();
        self.send_queue.requeue_unacked();
        // frames that were not picked up before the connection broke are meaningless on the next one
        self.outgoing_frames.clear();
    }

    fn send_login(&mut self) {
        info!("logging in as device {}", self.identity.android_id);
        let login = LoginRequestData {
            android_id: self.identity.android_id,
            security_token: self.identity.security_token,
            client_version: self.client_version.clone(),
            last_stream_id_received: self.stream_id_in,
            heartbeat_interval_ms: self.heartbeat.effective_interval().as_millis() as u64,
            received_persistent_ids: self.unacked_persistent_ids.clone(),
        };
        self.write(Frame::LoginRequest(login));
    }

    fn write(&mut self, frame: Frame) {
        trace!("writing {:?}", frame.tag());
        self.stream_id_out += 1;
        self.outgoing_frames.push(frame.ser());
    }

    pub fn send_message(&mut self, stanza: DataMessageStanza, now: Instant) -> MessageSendStatus {
        let encoded_len = Frame::Data(stanza.clone()).ser().body.len();
        if encoded_len > self.config.max_message_size {
            debug!("message {} has {} bytes, exceeding the maximum of {}", stanza.id, encoded_len, self.config.max_message_size);
            return MessageSendStatus::MessageTooLarge;
        }
        if let Some(status) = self.send_queue.check_capacity(&stanza.category) {
            debug!("rejecting message {}: {:?}", stanza.id, status);
            return status;
        }
        if stanza.ttl == 0 && self.state != StreamState::Connected {
            return MessageSendStatus::NoConnectionOnZeroTtl;
        }

        self.send_queue.push(PendingMessage::new(stanza, now));
        if self.state == StreamState::Connected {
            self.flush(now);
        }
        MessageSendStatus::Queued
    }

    fn flush(&mut self, now: Instant) {
        while let Some(mut message) = self.send_queue.pop_to_send() {
            if message.is_expired(now) {
                self.report_status(&message, MessageSendStatus::TtlExceeded);
                continue;
            }

            message.stanza.last_stream_id_received = self.stream_id_in;
            self.write(Frame::Data(message.stanza.clone()));
            message.stream_id = Some(self.stream_id_out);
            self.send_queue.mark_written(message);
            self.on_ack_sent();
        }
    }

    fn report_status(&mut self, message: &PendingMessage, status: MessageSendStatus) {
        self.events.push(StreamEvent::SendStatus {
            app_id: message.app_id().to_string(),
            message_id: message.message_id().to_string(),
            status,
        });
    }

    /// every outgoing frame tells the server how far we have read
    fn on_ack_sent(&mut self) {
        self.unacked_incoming = 0;
        self.unacked_persistent_ids.clear();
    }

    pub fn on_frame(&mut self, raw: RawFrame, now: Instant) {
        if !self.transport_connected {
            debug!("frame without connection - ignoring");
            return;
        }
        self.stream_id_in += 1;

        let frame = match Frame::deser(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("received unparsable frame with tag {}: {} - dropping", raw.tag, e);
                return;
            }
        };
        trace!("received {:?}", frame.tag());

        if let Some(acked) = frame.last_stream_id_received() {
            for message in self.send_queue.ack_up_to(acked) {
                self.report_status(&message, MessageSendStatus::Sent);
            }
        }

        match frame {
            Frame::LoginResponse(data) => {
                if self.state != StreamState::Initialized {
                    warn!("unexpected login response - ignoring");
                    return;
                }
                if data.error_code != 0 {
                    warn!("login failed with error code {}", data.error_code);
                    self.events.push(StreamEvent::ResetConnection(format!("login error {}", data.error_code)));
                    return;
                }
                info!("logged in");
                self.state = StreamState::Connected;
                self.heartbeat.start(now);
                // the login request reported all persistent ids we had
                self.unacked_persistent_ids.clear();
                self.events.push(StreamEvent::LoggedIn);
                self.flush(now);
            }
            Frame::HeartbeatPing(_) => {
                debug!("received heartbeat ping");
                self.write(Frame::HeartbeatAck(HeartbeatData { last_stream_id_received: self.stream_id_in }));
                self.on_ack_sent();
            }
            Frame::HeartbeatAck(_) => {
                debug!("received heartbeat ack");
                self.heartbeat.on_heartbeat_ack(now);
            }
            Frame::Close => {
                info!("server closed the stream");
                self.events.push(StreamEvent::ResetConnection("closed by server".to_string()));
            }
            Frame::Iq(IqStanza::SelectiveAck { persistent_ids, .. }) => {
                for message in self.send_queue.ack_persistent_ids(&persistent_ids) {
                    self.report_status(&message, MessageSendStatus::Sent);
                }
            }
            Frame::Iq(IqStanza::StreamAck { .. }) => {}
            Frame::Data(stanza) => self.on_data_message(stanza),
            Frame::LoginRequest(_) => {
                warn!("received a login request from the server - ignoring");
            }
        }
    }

    fn on_data_message(&mut self, stanza: DataMessageStanza) {
        if self.state != StreamState::Connected {
            warn!("data message before login - dropping");
            return;
        }

        if !stanza.persistent_id.is_empty() {
            self.unacked_persistent_ids.push(stanza.persistent_id.clone());
        }
        self.unacked_incoming += 1;
        self.events.push(StreamEvent::MessageReceived(stanza));

        if self.unacked_incoming >= self.config.unacked_messages_before_stream_ack {
            debug!("acknowledging {} received messages", self.unacked_incoming);
            self.write(Frame::Iq(IqStanza::StreamAck { last_stream_id_received: self.stream_id_in }));
            self.on_ack_sent();
        }
    }

    /// Handles whatever is due at `now`: heartbeats and expired messages
    pub fn on_timer(&mut self, now: Instant) {
        match self.heartbeat.poll(now) {
            HeartbeatAction::None => {}
            HeartbeatAction::SendPing => {
                debug!("sending heartbeat ping");
                self.write(Frame::HeartbeatPing(HeartbeatData { last_stream_id_received: self.stream_id_in }));
                self.on_ack_sent();
            }
            HeartbeatAction::ConnectionDead => {
                warn!("heartbeat was not acknowledged in time");
                self.events.push(StreamEvent::ResetConnection("heartbeat ack timeout".to_string()));
            }
        }

        for message in self.send_queue.expire(now) {
            debug!("message {} expired before it could be sent", message.message_id());
            self.report_status(&message, MessageSendStatus::TtlExceeded);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.heartbeat.next_deadline(), self.send_queue.next_expiry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
