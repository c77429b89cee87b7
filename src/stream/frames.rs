use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connection::transport::RawFrame;
use crate::util::buf::{put_optional_string, put_string, put_string_list, put_string_pairs, try_get_optional_string, try_get_string, try_get_string_list, try_get_string_pairs};

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameTag {
    HeartbeatPing = 0,
    HeartbeatAck = 1,
    LoginRequest = 2,
    LoginResponse = 3,
    Close = 4,
    IqStanza = 7,
    DataMessageStanza = 8,
}

const IQ_STREAM_ACK: u8 = 1;
const IQ_SELECTIVE_ACK: u8 = 2;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    HeartbeatPing(HeartbeatData),
    HeartbeatAck(HeartbeatData),
    LoginRequest(LoginRequestData),
    LoginResponse(LoginResponseData),
    Close,
    Iq(IqStanza),
    Data(DataMessageStanza),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeartbeatData {
    pub last_stream_id_received: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoginRequestData {
    pub android_id: u64,
    pub security_token: u64,
    pub client_version: String,
    pub last_stream_id_received: u32,
    pub heartbeat_interval_ms: u64,
    /// persistent ids of received messages the server may not know were received
    pub received_persistent_ids: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoginResponseData {
    /// 0 on success
    pub error_code: u32,
    pub last_stream_id_received: u32,
    pub server_timestamp: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IqStanza {
    StreamAck {
        last_stream_id_received: u32,
    },
    SelectiveAck {
        last_stream_id_received: u32,
        persistent_ids: Vec<String>,
    },
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DataMessageStanza {
    pub id: String,
    pub persistent_id: String,
    pub from: String,
    pub to: String,
    /// the app id
    pub category: String,
    /// collapse key
    pub token: Option<String>,
    pub ttl: u32,
    /// seconds since the epoch
    pub sent: u64,
    pub last_stream_id_received: u32,
    pub app_data: Vec<(String, String)>,
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::HeartbeatPing(_) => FrameTag::HeartbeatPing,
            Frame::HeartbeatAck(_) => FrameTag::HeartbeatAck,
            Frame::LoginRequest(_) => FrameTag::LoginRequest,
            Frame::LoginResponse(_) => FrameTag::LoginResponse,
            Frame::Close => FrameTag::Close,
            Frame::Iq(_) => FrameTag::IqStanza,
            Frame::Data(_) => FrameTag::DataMessageStanza,
        }
    }

    /// The peer's acknowledgement of our stream, if the frame carries one
    pub fn last_stream_id_received(&self) -> Option<u32> {
        match self {
            Frame::HeartbeatPing(data) | Frame::HeartbeatAck(data) => Some(data.last_stream_id_received),
            Frame::LoginRequest(data) => Some(data.last_stream_id_received),
            Frame::LoginResponse(data) => Some(data.last_stream_id_received),
            Frame::Close => None,
            Frame::Iq(IqStanza::StreamAck { last_stream_id_received }) => Some(*last_stream_id_received),
            Frame::Iq(IqStanza::SelectiveAck { last_stream_id_received, .. }) => Some(*last_stream_id_received),
            Frame::Data(data) => Some(data.last_stream_id_received),
        }
    }

    pub fn ser(&self) -> RawFrame {
        let mut buf = BytesMut::new();
        match self {
            Frame::HeartbeatPing(data) | Frame::HeartbeatAck(data) => buf.put_u32(data.last_stream_id_received),
            Frame::LoginRequest(data) => Self::ser_login_request(data, &mut buf),
            Frame::LoginResponse(data) => {
                buf.put_u32(data.error_code);
                buf.put_u32(data.last_stream_id_received);
                buf.put_u64(data.server_timestamp);
            }
            Frame::Close => {}
            Frame::Iq(stanza) => Self::ser_iq(stanza, &mut buf),
            Frame::Data(data) => Self::ser_data(data, &mut buf),
        }
        RawFrame::new(self.tag().into(), buf.freeze())
    }

    fn ser_login_request(data: &LoginRequestData, buf: &mut impl BufMut) {
        buf.put_u64(data.android_id);
        buf.put_u64(data.security_token);
        put_string(buf, &data.client_version);
        buf.put_u32(data.last_stream_id_received);
        buf.put_u64(data.heartbeat_interval_ms);
        put_string_list(buf, data.received_persistent_ids.iter());
    }

    fn ser_iq(stanza: &IqStanza, buf: &mut impl BufMut) {
        match stanza {
            IqStanza::StreamAck { last_stream_id_received } => {
                buf.put_u8(IQ_STREAM_ACK);
                buf.put_u32(*last_stream_id_received);
            }
            IqStanza::SelectiveAck { last_stream_id_received, persistent_ids } => {
                buf.put_u8(IQ_SELECTIVE_ACK);
                buf.put_u32(*last_stream_id_received);
                put_string_list(buf, persistent_ids.iter());
            }
        }
    }

    fn ser_data(data: &DataMessageStanza, buf: &mut impl BufMut) {
        put_string(buf, &data.id);
        put_string(buf, &data.persistent_id);
        put_string(buf, &data.from);
        put_string(buf, &data.to);
        put_string(buf, &data.category);
        put_optional_string(buf, data.token.as_deref());
        buf.put_u32(data.ttl);
        buf.put_u64(data.sent);
        buf.put_u32(data.last_stream_id_received);
        put_string_pairs(buf, data.app_data.iter().map(|(k, v)| (k, v)));
    }

    pub fn deser(raw: &RawFrame) -> anyhow::Result<Frame> {
        let tag = FrameTag::try_from(raw.tag)
            .map_err(|_| anyhow!("invalid frame tag {}", raw.tag))?;
        let mut buf: &[u8] = &raw.body;

        match tag {
            FrameTag::HeartbeatPing => Ok(Frame::HeartbeatPing(HeartbeatData { last_stream_id_received: buf.try_get_u32()? })),
            FrameTag::HeartbeatAck => Ok(Frame::HeartbeatAck(HeartbeatData { last_stream_id_received: buf.try_get_u32()? })),
            FrameTag::LoginRequest => Self::deser_login_request(&mut buf),
            FrameTag::LoginResponse => Ok(Frame::LoginResponse(LoginResponseData {
                error_code: buf.try_get_u32()?,
                last_stream_id_received: buf.try_get_u32()?,
                server_timestamp: buf.try_get_u64()?,
            })),
            FrameTag::Close => Ok(Frame::Close),
            FrameTag::IqStanza => Self::deser_iq(&mut buf),
            FrameTag::DataMessageStanza => Self::deser_data(&mut buf),
        }
    }

    fn deser_login_request(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        Ok(Frame::LoginRequest(LoginRequestData {
            android_id: buf.try_get_u64()?,
            security_token: buf.try_get_u64()?,
            client_version: try_get_string(buf)?,
            last_stream_id_received: buf.try_get_u32()?,
            heartbeat_interval_ms: buf.try_get_u64()?,
            received_persistent_ids: try_get_string_list(buf)?,
        }))
    }

    fn deser_iq(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let kind = buf.try_get_u8()?;
        let last_stream_id_received = buf.try_get_u32()?;
        match kind {
            IQ_STREAM_ACK => Ok(Frame::Iq(IqStanza::StreamAck { last_stream_id_received })),
            IQ_SELECTIVE_ACK => Ok(Frame::Iq(IqStanza::SelectiveAck {
                last_stream_id_received,
                persistent_ids: try_get_string_list(buf)?,
            })),
            id => Err(anyhow!("invalid iq stanza discriminator {}", id)),
        }
    }

    fn deser_data(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        Ok(Frame::Data(DataMessageStanza {
            id: try_get_string(buf)?,
            persistent_id: try_get_string(buf)?,
            from: try_get_string(buf)?,
            to: try_get_string(buf)?,
            category: try_get_string(buf)?,
            token: try_get_optional_string(buf)?,
            ttl: buf.try_get_u32()?,
            sent: buf.try_get_u64()?,
            last_stream_id_received: buf.try_get_u32()?,
            app_data: try_get_string_pairs(buf)?,
        }))
    }
}
