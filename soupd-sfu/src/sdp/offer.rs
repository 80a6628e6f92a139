use super::{Fingerprint, MediaParams, OfferParams, AUDIO_CODEC, VIDEO_CODEC};
use crate::error::{Error, Result};
use std::io::Cursor;
use webrtc::sdp::description::common::Attribute;
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::SessionDescription;

/// Decode a browser offer
pub fn decode(offer: &str) -> Result<OfferParams> {
    let mut reader = Cursor::new(offer.as_bytes());
    let session = SessionDescription::unmarshal(&mut reader)
        .map_err(|e| Error::Sdp(format!("invalid offer: {e}")))?;

    let fingerprint = find_fingerprint(&session.attributes)
        .or_else(|| {
            session
                .media_descriptions
                .first()
                .and_then(|m| find_fingerprint(&m.attributes))
        })
        .ok_or_else(|| Error::Sdp("offer carries no DTLS fingerprint".to_string()))?;

    let mut cname = None;
    let mut audio = None;
    let mut video = None;
    let mut bandwidth = None;

    for media in &session.media_descriptions {
        for b in &media.bandwidth {
            let bits = match b.bandwidth_type.as_str() {
                "AS" => b.bandwidth.saturating_mul(1000),
                "TIAS" => b.bandwidth,
                _ => continue,
            };
            bandwidth = Some(bandwidth.unwrap_or(0u64).saturating_add(bits));
        }

        match media.media_name.media.as_str() {
            "audio" if audio.is_none() => audio = media_params(media, AUDIO_CODEC, &mut cname),
            "video" if video.is_none() => video = media_params(media, VIDEO_CODEC, &mut cname),
            _ => {}
        }
    }

    Ok(OfferParams {
        session_id: session.origin.session_id,
        fingerprint,
        cname: cname.unwrap_or_default(),
        audio,
        video,
        bandwidth,
    })
}

fn find_fingerprint(attributes: &[Attribute]) -> Option<Fingerprint> {
    attributes
        .iter()
        .filter(|a| a.key == "fingerprint")
        .find_map(|a| {
            let (algorithm, value) = a.value.as_deref()?.trim().split_once(' ')?;
            Some(Fingerprint {
                algorithm: algorithm.to_ascii_lowercase(),
                value: value.trim().to_string(),
            })
        })
}

fn values<'a>(media: &'a MediaDescription, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    media
        .attributes
        .iter()
        .filter(move |a| a.key == key)
        .filter_map(|a| a.value.as_deref())
}

fn split_msid(value: &str) -> (String, String) {
    let mut parts = value.split_whitespace();
    let stream = parts.next().unwrap_or_default().to_string();
    let track = parts.next().unwrap_or_default().to_string();
    (stream, track)
}

/// Extract one medium. `None` when the expected codec is not offered.
fn media_params(
    media: &MediaDescription,
    codec: &str,
    cname: &mut Option<String>,
) -> Option<MediaParams> {
    let payload_type = values(media, "rtpmap").find_map(|v| {
        let (pt, encoding) = v.split_once(' ')?;
        let name = encoding.split('/').next()?;
        name.eq_ignore_ascii_case(codec).then(|| pt.parse::<u8>().ok())?
    })?;

    let apt = format!("apt={payload_type}");
    let rtx_payload_type = values(media, "fmtp").find_map(|v| {
        let (pt, config) = v.split_once(' ')?;
        config
            .split(';')
            .any(|p| p.trim() == apt)
            .then(|| pt.parse::<u8>().ok())?
    });

    let mut params = MediaParams {
        mid: values(media, "mid").next().unwrap_or_default().to_string(),
        payload_type,
        rtx_payload_type,
        ..Default::default()
    };

    for value in values(media, "ssrc") {
        let Some((id, attr)) = value.split_once(' ') else {
            continue;
        };
        let Ok(id) = id.parse::<u32>() else {
            continue;
        };
        let (name, attr_value) = attr.split_once(':').unwrap_or((attr, ""));
        match name {
            "cname" => {
                if cname.is_none() {
                    *cname = Some(attr_value.to_string());
                }
                match params.ssrc {
                    None => params.ssrc = Some(id),
                    Some(primary) if primary != id && params.rtx_ssrc.is_none() => {
                        params.rtx_ssrc = Some(id);
                    }
                    Some(_) => {}
                }
            }
            "msid" => {
                (params.stream_id, params.track_id) = split_msid(attr_value);
            }
            _ => {}
        }
    }

    // Media-level msid takes precedence over the per-SSRC one.
    if let Some(msid) = values(media, "msid").next() {
        (params.stream_id, params.track_id) = split_msid(msid);
    }

    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{publish_offer, subscribe_offer};

    #[test]
    fn test_decode_publish_offer_with_rtx() {
        let params = decode(&publish_offer(true)).unwrap();

        assert_eq!(params.session_id, 4_611_731_400_430_051_336);
        assert_eq!(params.fingerprint.algorithm, "sha-256");
        assert!(params.fingerprint.value.starts_with("6B:8B"));
        assert_eq!(params.cname, "pubcname");
        assert_eq!(params.bandwidth, Some(564_000));

        let audio = params.audio.unwrap();
        assert_eq!(audio.mid, "0");
        assert_eq!(audio.payload_type, 111);
        assert_eq!(audio.ssrc, Some(1001));
        assert_eq!(audio.stream_id, "stream1");
        assert_eq!(audio.track_id, "audio1");
        assert_eq!(audio.rtx(), None);

        let video = params.video.unwrap();
        assert_eq!(video.mid, "1");
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.ssrc, Some(2001));
        assert_eq!(video.rtx_payload_type, Some(97));
        assert_eq!(video.rtx_ssrc, Some(2002));
        assert_eq!(video.track_id, "video1");
    }

    #[test]
    fn test_decode_publish_offer_without_rtx() {
        let params = decode(&publish_offer(false)).unwrap();
        let video = params.video.unwrap();
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.ssrc, Some(2001));
        assert_eq!(video.rtx_payload_type, None);
        assert_eq!(video.rtx_ssrc, None);
        assert!(video.rtx().is_none());
    }

    #[test]
    fn test_decode_recvonly_offer_has_no_ssrcs() {
        let params = decode(&subscribe_offer(true)).unwrap();
        assert_eq!(params.bandwidth, None);
        let video = params.video.as_ref().unwrap();
        assert_eq!(video.payload_type, 102);
        assert_eq!(video.rtx_payload_type, Some(103));
        assert_eq!(video.ssrc, None);
        assert!(params.publishable_video().is_none());
    }

    #[test]
    fn test_fingerprint_algorithm_is_normalized() {
        let offer = publish_offer(false).replace("a=fingerprint:sha-256", "a=fingerprint:SHA-1");
        let params = decode(&offer).unwrap();
        assert_eq!(params.fingerprint.algorithm, "sha-1");
    }

    #[test]
    fn test_missing_codec_drops_medium() {
        let offer = publish_offer(false).replace("H264/90000", "VP8/90000");
        let params = decode(&offer).unwrap();
        assert!(params.video.is_none());
        assert!(params.audio.is_some());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(decode("hello"), Err(Error::Sdp(_))));
        let no_fingerprint: String = publish_offer(false)
            .lines()
            .filter(|l| !l.starts_with("a=fingerprint"))
            .map(|l| format!("{l}\r\n"))
            .collect();
        assert!(matches!(decode(&no_fingerprint), Err(Error::Sdp(_))));
    }
}
