//! Channel protocol messages exchanged with the media engine

use crate::error::{Error, Result};
use crate::types::ResourceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Engine RPC methods used by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    WorkerCreateRouter,
    RouterCreateWebRtcTransport,
    RouterCreateProducer,
    RouterCreateConsumer,
    TransportSetMaxBitrate,
    TransportSetRemoteDtlsParameters,
    TransportSetMaxIncomingBitrate,
    TransportGetStats,
    ProducerGetStats,
    ConsumerGetStats,
    ConsumerEnable,
    TransportClose,
}

impl Method {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerCreateRouter => "worker.createRouter",
            Self::RouterCreateWebRtcTransport => "router.createWebRtcTransport",
            Self::RouterCreateProducer => "router.createProducer",
            Self::RouterCreateConsumer => "router.createConsumer",
            Self::TransportSetMaxBitrate => "transport.setMaxBitrate",
            Self::TransportSetRemoteDtlsParameters => "transport.setRemoteDtlsParameters",
            Self::TransportSetMaxIncomingBitrate => "transport.setMaxIncomingBitrate",
            Self::TransportGetStats => "transport.getStats",
            Self::ProducerGetStats => "producer.getStats",
            Self::ConsumerGetStats => "consumer.getStats",
            Self::ConsumerEnable => "consumer.enable",
            Self::TransportClose => "transport.close",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target ids a request applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<ResourceId>,
}

impl Internal {
    #[must_use]
    pub const fn router(router_id: ResourceId) -> Self {
        Self {
            router_id: Some(router_id),
            transport_id: None,
            producer_id: None,
            consumer_id: None,
        }
    }

    #[must_use]
    pub const fn transport(router_id: ResourceId, transport_id: ResourceId) -> Self {
        Self {
            router_id: Some(router_id),
            transport_id: Some(transport_id),
            producer_id: None,
            consumer_id: None,
        }
    }

    #[must_use]
    pub const fn producer(
        router_id: ResourceId,
        transport_id: ResourceId,
        producer_id: ResourceId,
    ) -> Self {
        Self {
            router_id: Some(router_id),
            transport_id: Some(transport_id),
            producer_id: Some(producer_id),
            consumer_id: None,
        }
    }

    #[must_use]
    pub const fn consumer(
        router_id: ResourceId,
        transport_id: ResourceId,
        producer_id: ResourceId,
        consumer_id: ResourceId,
    ) -> Self {
        Self {
            router_id: Some(router_id),
            transport_id: Some(transport_id),
            producer_id: Some(producer_id),
            consumer_id: Some(consumer_id),
        }
    }
}

/// Outgoing request
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub id: u32,
    pub method: &'static str,
    pub internal: &'a Internal,
    pub data: &'a Value,
}

/// Engine reply to a request
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u32,
    pub outcome: std::result::Result<Value, String>,
}

/// Asynchronous engine event
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target_id: ResourceId,
    pub event: String,
    pub data: Value,
}

impl Notification {
    /// `dtlsstatechange` carrying `dtlsState == "connected"`
    #[must_use]
    pub fn is_dtls_connected(&self) -> bool {
        self.event == "dtlsstatechange"
            && self.data.get("dtlsState").and_then(Value::as_str) == Some("connected")
    }

    #[must_use]
    pub fn is_close(&self) -> bool {
        self.event == "close"
    }
}

/// A decoded JSON channel message
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Response(Response),
    Notification(Notification),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    accepted: bool,
    #[serde(default)]
    rejected: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    target_id: Option<Value>,
    #[serde(default)]
    event: Option<String>,
}

/// Engines emit target ids either as numbers or numeric strings
fn resource_id(value: &Value) -> Option<ResourceId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .map(ResourceId::new)
}

impl ChannelMessage {
    /// Parse a `{`-prefixed channel payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawMessage = serde_json::from_slice(payload)?;

        if let Some(id) = raw.id.filter(|id| *id != 0) {
            let outcome = if raw.accepted {
                Ok(raw.data.unwrap_or(Value::Null))
            } else if raw.rejected {
                Err(raw.reason.unwrap_or_else(|| "rejected".to_string()))
            } else {
                Err("response neither accepted nor rejected".to_string())
            };
            return Ok(Self::Response(Response { id, outcome }));
        }

        match (raw.target_id.as_ref().and_then(resource_id), raw.event) {
            (Some(target_id), Some(event)) => Ok(Self::Notification(Notification {
                target_id,
                event,
                data: raw.data.unwrap_or(Value::Null),
            })),
            _ => Err(Error::Protocol(
                "message is neither a response nor a notification".to_string(),
            )),
        }
    }
}

/// Severity marker of an engine diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMarker {
    Debug,
    Warn,
    Error,
    Dump,
}

impl LogMarker {
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'D' => Some(Self::Debug),
            b'W' => Some(Self::Warn),
            b'E' => Some(Self::Error),
            b'X' => Some(Self::Dump),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let internal = Internal::transport(ResourceId::new(11_111_111), ResourceId::new(22_222_222));
        let data = json!({ "bitrate": 1000 });
        let req = Request {
            id: 7,
            method: Method::TransportSetMaxBitrate.as_str(),
            internal: &internal,
            data: &data,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "method": "transport.setMaxBitrate",
                "internal": { "routerId": 11_111_111, "transportId": 22_222_222 },
                "data": { "bitrate": 1000 }
            })
        );
    }

    #[test]
    fn test_parse_accepted_response() {
        let msg = ChannelMessage::parse(br#"{"id":3,"accepted":true,"data":{"x":1}}"#).unwrap();
        assert_eq!(
            msg,
            ChannelMessage::Response(Response {
                id: 3,
                outcome: Ok(json!({ "x": 1 }))
            })
        );
    }

    #[test]
    fn test_parse_rejected_response() {
        let msg = ChannelMessage::parse(br#"{"id":4,"rejected":true,"reason":"no router"}"#).unwrap();
        assert_eq!(
            msg,
            ChannelMessage::Response(Response {
                id: 4,
                outcome: Err("no router".to_string())
            })
        );
    }

    #[test]
    fn test_parse_notification() {
        let msg = ChannelMessage::parse(
            br#"{"targetId":"12345678","event":"dtlsstatechange","data":{"dtlsState":"connected"}}"#,
        )
        .unwrap();
        let ChannelMessage::Notification(n) = msg else {
            panic!("expected notification");
        };
        assert_eq!(n.target_id, ResourceId::new(12_345_678));
        assert!(n.is_dtls_connected());
        assert!(!n.is_close());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(ChannelMessage::parse(br#"{"foo":1}"#).is_err());
        assert!(ChannelMessage::parse(b"{not json").is_err());
    }

    #[test]
    fn test_log_markers() {
        assert_eq!(LogMarker::from_byte(b'D'), Some(LogMarker::Debug));
        assert_eq!(LogMarker::from_byte(b'X'), Some(LogMarker::Dump));
        assert_eq!(LogMarker::from_byte(b'Q'), None);
    }
}
