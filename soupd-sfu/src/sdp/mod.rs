//! SDP Negotiation Engine
//!
//! Stateless translation between browser SDP and the engine's parameter
//! model:
//!
//! - [`decode`] turns an offer into [`OfferParams`]
//! - [`AnswerParams::publish`] / [`AnswerParams::subscribe`] combine decoded
//!   offers with the engine's local transport parameters
//! - [`encode`] writes the answer
//! - [`payload`] builds the engine RPC payloads from the same parameters
//!
//! Payload types and SSRCs are carried through verbatim. A subscriber always
//! receives the publisher's SSRCs, but with its own payload type numbers
//! since the engine rewrites payload types per consumer.

mod answer;
mod offer;
pub mod payload;

pub use answer::encode;
pub use offer::decode;

use crate::error::{Error, Result};
use payload::TransportLocalParameters;
use serde::{Deserialize, Serialize};

/// Audio codec accepted from offers
pub const AUDIO_CODEC: &str = "opus";
/// Video codec accepted from offers
pub const VIDEO_CODEC: &str = "H264";

pub const EXT_AUDIO_LEVEL: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const EXT_TOFFSET: &str = "urn:ietf:params:rtp-hdrext:toffset";
pub const EXT_ABS_SEND_TIME: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const EXT_VIDEO_ORIENTATION: &str = "urn:3gpp:video-orientation";

/// Header extensions negotiated for a medium, as `(id, uri)`.
///
/// Video gets the orientation extension only when RTX is negotiated.
#[must_use]
pub fn header_extensions(kind: crate::types::MediaKind, rtx: bool) -> &'static [(u8, &'static str)] {
    use crate::types::MediaKind;
    match (kind, rtx) {
        (MediaKind::Audio, _) => &[(1, EXT_AUDIO_LEVEL)],
        (MediaKind::Video, false) => &[(2, EXT_TOFFSET), (3, EXT_ABS_SEND_TIME)],
        (MediaKind::Video, true) => &[
            (2, EXT_TOFFSET),
            (3, EXT_ABS_SEND_TIME),
            (4, EXT_VIDEO_ORIENTATION),
        ],
    }
}

/// DTLS certificate fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}

/// One decoded media section of an offer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaParams {
    pub mid: String,
    /// Payload type of the expected codec
    pub payload_type: u8,
    /// First cname-tagged SSRC
    pub ssrc: Option<u32>,
    /// Payload type whose `apt=` points at `payload_type`
    pub rtx_payload_type: Option<u8>,
    /// Second cname-tagged SSRC (video only)
    pub rtx_ssrc: Option<u32>,
    pub stream_id: String,
    pub track_id: String,
}

impl MediaParams {
    /// RTX payload type and SSRC, when both were offered
    #[must_use]
    pub fn rtx(&self) -> Option<Rtx> {
        Some(Rtx {
            payload_type: self.rtx_payload_type?,
            ssrc: self.rtx_ssrc?,
        })
    }
}

/// Canonical parameters decoded from an offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferParams {
    pub session_id: u64,
    pub fingerprint: Fingerprint,
    pub cname: String,
    pub audio: Option<MediaParams>,
    pub video: Option<MediaParams>,
    /// Declared bandwidth in bits/s, summed over media sections
    pub bandwidth: Option<u64>,
}

impl OfferParams {
    /// Audio section able to feed a producer
    #[must_use]
    pub fn publishable_audio(&self) -> Option<&MediaParams> {
        self.audio.as_ref().filter(|m| m.ssrc.is_some())
    }

    /// Video section able to feed a producer
    #[must_use]
    pub fn publishable_video(&self) -> Option<&MediaParams> {
        self.video.as_ref().filter(|m| m.ssrc.is_some())
    }
}

/// Which side of the relay the answer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This node receives from a publisher
    Publish,
    /// This node sends to a subscriber
    Subscribe,
}

impl Role {
    #[must_use]
    pub const fn direction(self) -> &'static str {
        match self {
            Self::Publish => "recvonly",
            Self::Subscribe => "sendonly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rtx {
    pub payload_type: u8,
    pub ssrc: u32,
}

/// A media section of the answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerMedia {
    pub mid: String,
    pub payload_type: u8,
    pub ssrc: u32,
    pub stream_id: String,
    pub track_id: String,
    pub rtx: Option<Rtx>,
}

/// Everything needed to write an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerParams {
    pub role: Role,
    pub session_id: u64,
    pub fingerprint: Fingerprint,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub candidate_ip: String,
    pub candidate_port: u16,
    pub cname: String,
    pub audio: Option<AnswerMedia>,
    pub video: Option<AnswerMedia>,
}

impl AnswerParams {
    fn with_local(
        role: Role,
        session_id: u64,
        remote_algorithm: &str,
        cname: &str,
        local: &TransportLocalParameters,
    ) -> Result<Self> {
        let fingerprint = local
            .fingerprint_for(remote_algorithm)
            .cloned()
            .ok_or_else(|| Error::Protocol("engine returned no DTLS fingerprints".to_string()))?;
        let candidate = local
            .ice_local_candidates
            .first()
            .ok_or_else(|| Error::Protocol("engine returned no ICE candidates".to_string()))?;
        Ok(Self {
            role,
            session_id,
            fingerprint,
            ice_ufrag: local.ice_local_parameters.username_fragment.clone(),
            ice_pwd: local.ice_local_parameters.password.clone(),
            candidate_ip: candidate.ip.clone(),
            candidate_port: candidate.port,
            cname: cname.to_string(),
            audio: None,
            video: None,
        })
    }

    /// Answer to a publisher's offer.
    ///
    /// `has_audio`/`has_video` are the media the publisher asked for; a
    /// medium the offer cannot feed is dropped regardless.
    pub fn publish(
        offer: &OfferParams,
        has_audio: bool,
        has_video: bool,
        local: &TransportLocalParameters,
    ) -> Result<Self> {
        let mut params = Self::with_local(
            Role::Publish,
            offer.session_id,
            &offer.fingerprint.algorithm,
            &offer.cname,
            local,
        )?;
        let own = |m: &MediaParams| {
            m.ssrc.map(|ssrc| AnswerMedia {
                mid: m.mid.clone(),
                payload_type: m.payload_type,
                ssrc,
                stream_id: m.stream_id.clone(),
                track_id: m.track_id.clone(),
                rtx: m.rtx(),
            })
        };
        params.audio = offer.audio.as_ref().filter(|_| has_audio).and_then(own);
        params.video = offer.video.as_ref().filter(|_| has_video).and_then(own);
        Ok(params)
    }

    /// Answer to a subscriber's offer for a published stream.
    ///
    /// SSRCs, cname and msid come from the publisher; mids and payload types
    /// from the subscriber. RTX is kept only when both sides have it.
    pub fn subscribe(
        publisher: &OfferParams,
        subscriber: &OfferParams,
        has_audio: bool,
        has_video: bool,
        local: &TransportLocalParameters,
    ) -> Result<Self> {
        let mut params = Self::with_local(
            Role::Subscribe,
            subscriber.session_id,
            &subscriber.fingerprint.algorithm,
            &publisher.cname,
            local,
        )?;
        let relay = |pubm: Option<&MediaParams>, subm: Option<&MediaParams>| {
            let (pubm, subm) = (pubm?, subm?);
            Some(AnswerMedia {
                mid: subm.mid.clone(),
                payload_type: subm.payload_type,
                ssrc: pubm.ssrc?,
                stream_id: pubm.stream_id.clone(),
                track_id: pubm.track_id.clone(),
                rtx: match (pubm.rtx(), subm.rtx_payload_type) {
                    (Some(rtx), Some(payload_type)) => Some(Rtx {
                        payload_type,
                        ssrc: rtx.ssrc,
                    }),
                    _ => None,
                },
            })
        };
        if has_audio {
            params.audio = relay(publisher.audio.as_ref(), subscriber.audio.as_ref());
        }
        if has_video {
            params.video = relay(publisher.video.as_ref(), subscriber.video.as_ref());
        }
        Ok(params)
    }

    /// Mids present in the answer, in media order
    #[must_use]
    pub fn bundle_mids(&self) -> Vec<&str> {
        [self.audio.as_ref(), self.video.as_ref()]
            .into_iter()
            .flatten()
            .map(|m| m.mid.as_str())
            .collect()
    }
}
