//! Engine RPC payloads derived from negotiated parameters

use super::{header_extensions, Fingerprint, MediaParams, Rtx};
use crate::types::MediaKind;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceLocalParameters {
    pub username_fragment: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceLocalCandidate {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DtlsLocalParameters {
    #[serde(default)]
    pub fingerprints: Vec<Fingerprint>,
}

/// Result of `router.createWebRtcTransport`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportLocalParameters {
    pub ice_local_parameters: IceLocalParameters,
    #[serde(default)]
    pub ice_local_candidates: Vec<IceLocalCandidate>,
    pub dtls_local_parameters: DtlsLocalParameters,
}

impl TransportLocalParameters {
    /// Local fingerprint to announce: the one matching the remote algorithm,
    /// else sha-256, else the first.
    #[must_use]
    pub fn fingerprint_for(&self, remote_algorithm: &str) -> Option<&Fingerprint> {
        let fingerprints = &self.dtls_local_parameters.fingerprints;
        fingerprints
            .iter()
            .find(|f| f.algorithm.eq_ignore_ascii_case(remote_algorithm))
            .or_else(|| fingerprints.iter().find(|f| f.algorithm == "sha-256"))
            .or_else(|| fingerprints.first())
    }
}

/// `router.createWebRtcTransport`
#[must_use]
pub fn create_transport(ipv4: &Value) -> Value {
    json!({ "tcp": false, "ipv4": ipv4 })
}

/// `transport.setMaxBitrate` / `transport.setMaxIncomingBitrate`
#[must_use]
pub fn bitrate(bits_per_second: u64) -> Value {
    json!({ "bitrate": bits_per_second })
}

/// `transport.setRemoteDtlsParameters`; the engine always acts as DTLS server
#[must_use]
pub fn remote_dtls(remote: &Fingerprint) -> Value {
    json!({
        "role": "server",
        "fingerprints": [{ "algorithm": remote.algorithm, "value": remote.value }],
    })
}

fn codecs(kind: MediaKind, payload_type: u8, rtx: Option<u8>) -> Value {
    match kind {
        MediaKind::Audio => json!([{
            "name": "opus",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "payloadType": payload_type,
            "channels": 2,
            "rtcpFeedback": [],
            "parameters": { "useinbandfec": 1 },
        }]),
        MediaKind::Video => {
            let mut codecs = vec![json!({
                "name": "H264",
                "mimeType": "video/H264",
                "clockRate": 90000,
                "payloadType": payload_type,
                "rtcpFeedback": [
                    { "type": "goog-remb" },
                    { "type": "ccm", "parameter": "fir" },
                    { "type": "nack" },
                    { "type": "nack", "parameter": "pli" },
                ],
                "parameters": { "packetization-mode": 1 },
            })];
            if let Some(rtx) = rtx {
                codecs.push(json!({
                    "name": "rtx",
                    "mimeType": "video/rtx",
                    "clockRate": 90000,
                    "payloadType": rtx,
                    "parameters": { "apt": payload_type },
                }));
            }
            Value::Array(codecs)
        }
    }
}

/// RTP parameters as the engine models them.
///
/// `payload_type` and `rtx` payload type are the receiving side's numbers;
/// `ssrc`, the RTX SSRC and `cname` always belong to the publisher.
fn rtp_parameters(
    kind: MediaKind,
    payload_type: u8,
    ssrc: u32,
    rtx: Option<Rtx>,
    cname: &str,
) -> Value {
    let extensions: Vec<Value> = header_extensions(kind, rtx.is_some())
        .iter()
        .map(|(id, uri)| json!({ "uri": uri, "id": id }))
        .collect();
    let encoding = match rtx {
        Some(rtx) => json!({ "ssrc": ssrc, "rtx": { "ssrc": rtx.ssrc } }),
        None => json!({ "ssrc": ssrc }),
    };
    json!({
        "muxId": null,
        "codecs": codecs(kind, payload_type, rtx.map(|r| r.payload_type)),
        "headerExtensions": extensions,
        "encodings": [encoding],
        "rtcp": { "cname": cname, "reducedSize": true, "mux": true },
    })
}

/// `router.createProducer` for a publisher's medium. `None` when the medium
/// has no SSRC to receive on.
#[must_use]
pub fn create_producer(kind: MediaKind, media: &MediaParams, cname: &str) -> Option<Value> {
    let ssrc = media.ssrc?;
    let rtx = media.rtx().filter(|_| kind == MediaKind::Video);
    let pt = media.payload_type;

    let mut payload_types = vec![[pt, pt]];
    payload_types.extend(rtx.map(|r| [r.payload_type, r.payload_type]));
    let extension_ids: Vec<[u8; 2]> = header_extensions(kind, rtx.is_some())
        .iter()
        .map(|(id, _)| [*id, *id])
        .collect();

    Some(json!({
        "kind": kind.as_str(),
        "rtpParameters": rtp_parameters(kind, pt, ssrc, rtx, cname),
        "rtpMapping": {
            "codecPayloadTypes": payload_types,
            "headerExtensionIds": extension_ids,
        },
        "paused": false,
    }))
}

/// `router.createConsumer`: maps the publisher's payload types onto the
/// subscriber's.
#[must_use]
pub fn create_consumer(kind: MediaKind, publisher: &MediaParams, subscriber: &MediaParams) -> Value {
    match kind {
        MediaKind::Audio => json!({
            "kind": "audio",
            "pubAudioCodec": publisher.payload_type,
            "subAudioCodec": subscriber.payload_type,
        }),
        MediaKind::Video => {
            let mut data = json!({
                "kind": "video",
                "pubVideoCodec": publisher.payload_type,
                "subVideoCodec": subscriber.payload_type,
            });
            if let (Some(pub_rtx), Some(sub_rtx)) = (publisher.rtx(), subscriber.rtx_payload_type) {
                data["pubRtxCodec"] = json!(pub_rtx.payload_type);
                data["subRtxCodec"] = json!(sub_rtx);
            }
            data
        }
    }
}

/// `consumer.enable`: the subscriber's payload types carrying the
/// publisher's sources. `None` when the publisher has no SSRC for the medium.
#[must_use]
pub fn enable_consumer(
    kind: MediaKind,
    publisher: &MediaParams,
    subscriber: &MediaParams,
    cname: &str,
) -> Option<Value> {
    let ssrc = publisher.ssrc?;
    let rtx = match (kind, publisher.rtx(), subscriber.rtx_payload_type) {
        (MediaKind::Video, Some(pub_rtx), Some(payload_type)) => Some(Rtx {
            payload_type,
            ssrc: pub_rtx.ssrc,
        }),
        _ => None,
    };
    Some(json!({
        "rtpParameters": rtp_parameters(kind, subscriber.payload_type, ssrc, rtx, cname),
    }))
}
