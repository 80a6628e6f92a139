//! Signaling message shapes
//!
//! The upstream signaling socket exchanges `key=<JSON>` text frames. This
//! module only parses and produces those frames; the socket itself lives in
//! the binary.

use crate::error::{Error, Result};
use crate::types::{ConnKey, RoomKey, SessionKey, StreamKey};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Session address as it appears on the signaling wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub roomiid: RoomKey,
    #[serde(default, deserialize_with = "string_or_number")]
    pub playerid: String,
    pub streamid: StreamKey,
    #[serde(
        default,
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub connid: Option<ConnKey>,
}

impl SessionRef {
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey {
            room: self.roomiid.clone(),
            stream: self.streamid.clone(),
            conn: self.connid.clone(),
        }
    }

    #[must_use]
    pub fn from_key(key: &SessionKey, player_id: &str) -> Self {
        Self {
            roomiid: key.room.clone(),
            playerid: player_id.to_string(),
            streamid: key.stream.clone(),
            connid: key.conn.clone(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn non_empty<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<ConnKey>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(ConnKey::new(s)),
        Value::Number(n) => Some(ConnKey::new(n.to_string())),
        _ => None,
    })
}

/// `webrtc-offer` payload; a connection key selects subscribe over publish
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    #[serde(flatten)]
    pub session: SessionRef,
    pub sdp: String,
    #[serde(default)]
    pub has_audio: bool,
    #[serde(default)]
    pub has_video: bool,
    /// Passed through to `router.createWebRtcTransport`
    #[serde(default)]
    pub ipv4: Value,
}

/// Frames received from the signaling server
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    HandshakeRes(Value),
    Disconnect,
    WebrtcOffer(OfferRequest),
    WebrtcCandidate(Value),
    Publish(SessionRef),
    Unpublish(SessionRef),
    Subscribe(SessionRef),
    Unsubscribe(SessionRef),
    /// Any other key; ignored
    Other(String),
}

impl InboundMessage {
    /// Parse a `key=<JSON>` frame
    pub fn parse(frame: &str) -> Result<Self> {
        let (key, value) = frame
            .split_once('=')
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .ok_or_else(|| Error::Signaling(format!("malformed frame: {frame}")))?;

        Ok(match key {
            "handshake-res" => Self::HandshakeRes(serde_json::from_str(value)?),
            "disconnect" => Self::Disconnect,
            "webrtc-offer" => Self::WebrtcOffer(serde_json::from_str(value)?),
            "webrtc-candidate" => Self::WebrtcCandidate(serde_json::from_str(value)?),
            "publish" => Self::Publish(serde_json::from_str(value)?),
            "unpublish" => Self::Unpublish(serde_json::from_str(value)?),
            "subscribe" => Self::Subscribe(serde_json::from_str(value)?),
            "unsubscribe" => Self::Unsubscribe(serde_json::from_str(value)?),
            other => Self::Other(other.to_string()),
        })
    }
}

/// One statistics sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatSample {
    /// Bytes since the previous sample
    pub bytes: u64,
    /// Wall clock, seconds since the epoch
    pub time: i64,
    /// Seconds since the session was established
    pub elapsed: u64,
    /// Poll interval in milliseconds
    pub duration: u64,
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStat {
    #[serde(flatten)]
    pub session: SessionRef,
    pub stat: StatSample,
}

/// Frames sent to the signaling server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Handshake { erizodid: String },
    Answer { session: SessionRef, sdp: String },
    IceState { session: SessionRef, connected: bool },
    Stat(StreamStat),
    Close(SessionRef),
    PublishRes(SessionRef),
    UnpublishRes(SessionRef),
    SubscribeRes(SessionRef),
    UnsubscribeRes(SessionRef),
}

impl OutboundEvent {
    #[must_use]
    pub const fn key(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Answer { .. } => "webrtc-answer",
            Self::IceState { .. } => "webrtc-icestate",
            Self::Stat(_) => "on-pc-stat",
            Self::Close(_) => "on-pc-close",
            Self::PublishRes(_) => "publish-res",
            Self::UnpublishRes(_) => "unpublish-res",
            Self::SubscribeRes(_) => "subscribe-res",
            Self::UnsubscribeRes(_) => "unsubscribe-res",
        }
    }

    fn body(&self) -> Result<Value> {
        let with = |session: &SessionRef, field: &str, value: Value| -> Result<Value> {
            let mut body = serde_json::to_value(session)?;
            body[field] = value;
            Ok(body)
        };
        Ok(match self {
            Self::Handshake { erizodid } => serde_json::json!({ "erizodid": erizodid }),
            Self::Answer { session, sdp } => with(session, "sdp", Value::from(sdp.as_str()))?,
            Self::IceState { session, connected } => {
                with(session, "connected", Value::from(*connected))?
            }
            Self::Stat(stat) => serde_json::json!({ "streams": [stat] }),
            Self::Close(s)
            | Self::PublishRes(s)
            | Self::UnpublishRes(s)
            | Self::SubscribeRes(s)
            | Self::UnsubscribeRes(s) => serde_json::to_value(s)?,
        })
    }

    /// Render as a `key=<JSON>` frame
    pub fn encode(&self) -> Result<String> {
        Ok(format!("{}={}", self.key(), self.body()?))
    }
}
