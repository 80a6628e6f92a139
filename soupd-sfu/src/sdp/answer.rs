use super::{header_extensions, AnswerMedia, AnswerParams, Role};
use crate::types::MediaKind;

const CANDIDATE_PRIORITY: u32 = 1_078_862_079;

/// Accumulates CRLF-terminated SDP lines
struct SdpWriter(String);

impl SdpWriter {
    fn line(&mut self, line: impl AsRef<str>) {
        self.0.push_str(line.as_ref());
        self.0.push_str("\r\n");
    }
}

/// Write the answer SDP
#[must_use]
pub fn encode(params: &AnswerParams) -> String {
    let mut w = SdpWriter(String::with_capacity(2048));

    w.line("v=0");
    w.line(format!("o=soupd {} 2 IN IP4 0.0.0.0", params.session_id));
    w.line("s=-");
    w.line("t=0 0");
    w.line("a=ice-lite");
    w.line(format!(
        "a=fingerprint:{} {}",
        params.fingerprint.algorithm, params.fingerprint.value
    ));
    w.line("a=msid-semantic: WMS *");
    w.line(format!("a=group:BUNDLE {}", params.bundle_mids().join(" ")));

    if let Some(audio) = &params.audio {
        write_media(&mut w, params, MediaKind::Audio, audio);
    }
    if let Some(video) = &params.video {
        write_media(&mut w, params, MediaKind::Video, video);
    }

    w.0
}

fn write_media(w: &mut SdpWriter, params: &AnswerParams, kind: MediaKind, media: &AnswerMedia) {
    let pt = media.payload_type;
    let rtx = media.rtx.filter(|_| kind == MediaKind::Video);

    match rtx {
        Some(rtx) => w.line(format!("m={} 7 RTP/SAVPF {pt} {}", kind.as_str(), rtx.payload_type)),
        None => w.line(format!("m={} 7 RTP/SAVPF {pt}", kind.as_str())),
    }
    w.line("c=IN IP4 127.0.0.1");

    match kind {
        MediaKind::Audio => {
            w.line(format!("a=rtpmap:{pt} opus/48000/2"));
            w.line(format!("a=fmtp:{pt} useinbandfec=1"));
        }
        MediaKind::Video => {
            w.line(format!("a=rtpmap:{pt} H264/90000"));
            if let Some(rtx) = rtx {
                w.line(format!("a=rtpmap:{} rtx/90000", rtx.payload_type));
            }
            w.line(format!("a=rtcp-fb:{pt} goog-remb"));
            w.line(format!("a=rtcp-fb:{pt} ccm fir"));
            w.line(format!("a=rtcp-fb:{pt} nack"));
            w.line(format!("a=rtcp-fb:{pt} nack pli"));
            w.line(format!("a=fmtp:{pt} packetization-mode=1"));
            if let Some(rtx) = rtx {
                w.line(format!("a=fmtp:{} apt={pt}", rtx.payload_type));
            }
        }
    }

    for (id, uri) in header_extensions(kind, rtx.is_some()) {
        w.line(format!("a=extmap:{id} {uri}"));
    }
    w.line("a=setup:active");
    w.line(format!("a=mid:{}", media.mid));
    w.line(format!("a={}", params.role.direction()));
    w.line(format!("a=ice-ufrag:{}", params.ice_ufrag));
    w.line(format!("a=ice-pwd:{}", params.ice_pwd));
    w.line(format!(
        "a=candidate:udpcandidate 1 udp {CANDIDATE_PRIORITY} {} {} typ host",
        params.candidate_ip, params.candidate_port
    ));
    w.line("a=end-of-candidates");
    w.line("a=ice-options:renomination");

    if let Some(rtx) = rtx {
        w.line(format!("a=ssrc-group:FID {} {}", media.ssrc, rtx.ssrc));
    }
    // A publisher already knows its own sources.
    if params.role == Role::Subscribe {
        let mut sources = vec![media.ssrc];
        sources.extend(rtx.map(|r| r.ssrc));
        for ssrc in sources {
            w.line(format!("a=ssrc:{ssrc} msid:{} {}", media.stream_id, media.track_id));
            w.line(format!("a=ssrc:{ssrc} mslabel:{}", media.stream_id));
            w.line(format!("a=ssrc:{ssrc} label:{}", media.track_id));
            w.line(format!("a=ssrc:{ssrc} cname:{}", params.cname));
        }
    }

    w.line("a=rtcp-mux");
    w.line("a=rtcp-rsize");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::payload::TransportLocalParameters;
    use crate::sdp::{decode, AnswerParams, Fingerprint, Rtx};
    use crate::test_helpers::{fake_transport_parameters, publish_offer};

    fn local() -> TransportLocalParameters {
        serde_json::from_value(fake_transport_parameters("10.0.0.1", 10000)).unwrap()
    }

    fn publish_answer(rtx: bool) -> String {
        let offer = decode(&publish_offer(rtx)).unwrap();
        encode(&AnswerParams::publish(&offer, true, true, &local()).unwrap())
    }

    fn video_section(sdp: &str) -> &str {
        let start = sdp.find("m=video").unwrap();
        &sdp[start..]
    }

    fn subscribe_params(rtx: bool) -> AnswerParams {
        let media = |mid: &str, pt, ssrc, track: &str, rtx| AnswerMedia {
            mid: mid.to_string(),
            payload_type: pt,
            ssrc,
            stream_id: "stream1".to_string(),
            track_id: track.to_string(),
            rtx,
        };
        AnswerParams {
            role: Role::Subscribe,
            session_id: 42,
            fingerprint: Fingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            },
            ice_ufrag: "ufrag".to_string(),
            ice_pwd: "pwd".to_string(),
            candidate_ip: "10.0.0.1".to_string(),
            candidate_port: 10000,
            cname: "pubcname".to_string(),
            audio: Some(media("a", 109, 1001, "audio1", None)),
            video: Some(media(
                "v",
                102,
                2001,
                "video1",
                rtx.then_some(Rtx {
                    payload_type: 103,
                    ssrc: 2002,
                }),
            )),
        }
    }

    #[test]
    fn test_publish_answer_without_rtx() {
        let sdp = publish_answer(false);
        let video = video_section(&sdp);

        assert!(sdp.contains("a=group:BUNDLE 0 1\r\n"));
        assert!(video.starts_with("m=video 7 RTP/SAVPF 96\r\n"));
        assert!(!video.contains("rtx/90000"));
        assert!(!video.contains("apt="));
        assert!(!video.contains("a=ssrc-group"));
        assert!(!video.contains(EXT_VIDEO_ORIENTATION_LINE));
        assert!(video.contains("a=extmap:2 urn:ietf:params:rtp-hdrext:toffset\r\n"));
        assert!(video.contains(
            "a=extmap:3 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time\r\n"
        ));
        assert!(video.contains("a=recvonly\r\n"));
    }

    const EXT_VIDEO_ORIENTATION_LINE: &str = "a=extmap:4 urn:3gpp:video-orientation";

    #[test]
    fn test_publish_answer_with_rtx() {
        let sdp = publish_answer(true);
        let video = video_section(&sdp);

        assert!(video.starts_with("m=video 7 RTP/SAVPF 96 97\r\n"));
        assert_eq!(video.matches("a=rtpmap:").count(), 2);
        assert_eq!(video.matches("a=fmtp:").count(), 2);
        assert!(video.contains("a=fmtp:97 apt=96\r\n"));
        assert!(video.contains("a=ssrc-group:FID 2001 2002\r\n"));
        assert!(video.contains(EXT_VIDEO_ORIENTATION_LINE));
        // Publishers are not told about their own sources.
        assert!(!sdp.contains("a=ssrc:"));
    }

    #[test]
    fn test_answer_common_lines() {
        let sdp = publish_answer(false);
        assert!(sdp.starts_with("v=0\r\no=soupd 4611731400430051336 2 IN IP4 0.0.0.0\r\n"));
        assert!(sdp.contains("a=ice-lite\r\n"));
        assert!(sdp.contains("a=fingerprint:sha-256 "));
        assert!(sdp.contains("a=candidate:udpcandidate 1 udp 1078862079 10.0.0.1 10000 typ host\r\n"));
        assert!(sdp.contains("a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n"));
        assert_eq!(sdp.matches("a=end-of-candidates\r\n").count(), 2);
        assert!(sdp.lines().all(|l| !l.is_empty()));
    }

    #[test]
    fn test_absent_medium_is_dropped() {
        let mut params = subscribe_params(false);
        params.audio = None;
        let sdp = encode(&params);
        assert!(!sdp.contains("m=audio"));
        assert!(sdp.contains("a=group:BUNDLE v\r\n"));
    }

    #[test]
    fn test_subscribe_answer_source_attributes() {
        let sdp = encode(&subscribe_params(true));
        assert!(sdp.contains("a=sendonly\r\n"));
        assert!(sdp.contains("a=ssrc:1001 msid:stream1 audio1\r\n"));
        assert!(sdp.contains("a=ssrc:1001 mslabel:stream1\r\n"));
        assert!(sdp.contains("a=ssrc:1001 label:audio1\r\n"));
        assert!(sdp.contains("a=ssrc:2002 cname:pubcname\r\n"));
        assert!(sdp.contains("a=ssrc-group:FID 2001 2002\r\n"));
    }

    #[test]
    fn test_round_trip_recovers_parameters() {
        for rtx in [true, false] {
            let params = subscribe_params(rtx);
            let decoded = decode(&encode(&params)).unwrap();

            assert_eq!(decoded.session_id, 42);
            assert_eq!(decoded.cname, "pubcname");
            let audio = decoded.audio.unwrap();
            assert_eq!(audio.payload_type, 109);
            assert_eq!(audio.ssrc, Some(1001));
            assert_eq!((audio.stream_id.as_str(), audio.track_id.as_str()), ("stream1", "audio1"));

            let video = decoded.video.unwrap();
            assert_eq!(video.mid, "v");
            assert_eq!(video.payload_type, 102);
            assert_eq!(video.ssrc, Some(2001));
            assert_eq!(video.track_id, "video1");
            assert_eq!(video.rtx(), params.video.unwrap().rtx);
        }
    }
}
