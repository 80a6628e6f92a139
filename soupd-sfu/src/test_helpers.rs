//! In-process media engine and SDP fixtures for tests
//!
//! [`FakeLauncher`] hands the pool channels backed by an in-memory duplex
//! stream. The engine on the other end records every request, accepts it
//! unless told otherwise and can push notifications or simulate a crash.

use crate::channel::{Channel, Internal, Method, NetstringCodec, Notification};
use crate::error::{Error, Result};
use crate::signaling::{OfferRequest, SessionRef};
use crate::types::{ResourceId, ShardId};
use crate::worker::{LaunchedWorker, ShardSpec, WorkerExit, WorkerLauncher};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Request timeout of fake channels
const FAKE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A request as the fake engine received it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub internal: Internal,
    pub data: Value,
}

impl RecordedRequest {
    #[must_use]
    pub const fn transport_id(&self) -> Option<ResourceId> {
        self.internal.transport_id
    }
}

/// Behavior shared by every engine a launcher starts, relaunches included
struct Behavior {
    rejected: Mutex<HashSet<&'static str>>,
    stalled: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    transport_stats: Mutex<Value>,
    media_stats: Mutex<Value>,
    failing_launches: AtomicUsize,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            rejected: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashMap::new()),
            transport_stats: Mutex::new(json!([{ "bytesReceived": 0, "bytesSent": 0 }])),
            media_stats: Mutex::new(json!([])),
            failing_launches: AtomicUsize::new(0),
        }
    }
}

/// One fake engine process
pub struct FakeEngine {
    shard: ShardId,
    behavior: Arc<Behavior>,
    requests: Mutex<Vec<RecordedRequest>>,
    outbox: mpsc::UnboundedSender<Bytes>,
    killed: CancellationToken,
}

impl FakeEngine {
    /// Every request received so far
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Method names of every request, in arrival order
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.method.clone()).collect()
    }

    #[must_use]
    pub fn requests_for(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    /// Emit a notification on the channel
    pub fn notify(&self, target_id: ResourceId, event: &str, data: Value) {
        let frame = json!({ "targetId": target_id, "event": event, "data": data });
        let _ = self.outbox.send(Bytes::from(frame.to_string()));
    }

    /// Simulate the process dying
    pub fn kill(&self) {
        self.killed.cancel();
    }

    fn reply(&self, payload: &[u8]) -> Option<(Bytes, Option<Arc<Semaphore>>)> {
        let request: Value = serde_json::from_slice(payload).ok()?;
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str)?.to_string();
        let internal = request
            .get("internal")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let data = request.get("data").cloned().unwrap_or(Value::Null);

        self.requests.lock().push(RecordedRequest {
            method: method.clone(),
            internal,
            data,
        });

        let reply = if self.behavior.rejected.lock().contains(method.as_str()) {
            json!({ "id": id, "rejected": true, "reason": format!("{method} rejected") })
        } else {
            let data = match method.as_str() {
                "router.createWebRtcTransport" => {
                    fake_transport_parameters("127.0.0.1", 40_000 + self.shard as u16)
                }
                "transport.getStats" => self.behavior.transport_stats.lock().clone(),
                "producer.getStats" | "consumer.getStats" => {
                    self.behavior.media_stats.lock().clone()
                }
                _ => json!({}),
            };
            json!({ "id": id, "accepted": true, "data": data })
        };
        let gate = self.behavior.stalled.lock().get(method.as_str()).cloned();
        Some((Bytes::from(reply.to_string()), gate))
    }

    async fn serve(
        self: Arc<Self>,
        stream: DuplexStream,
        mut outbox: mpsc::UnboundedReceiver<Bytes>,
        exit_tx: oneshot::Sender<WorkerExit>,
        shutdown: CancellationToken,
    ) {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = FramedRead::new(reader, NetstringCodec::new());
        let mut writer = FramedWrite::new(writer, NetstringCodec::new());
        let exit = |code, signal| WorkerExit {
            shard: self.shard,
            code,
            signal,
        };

        let exit = loop {
            tokio::select! {
                () = shutdown.cancelled() => break exit(None, Some(15)),
                () = self.killed.cancelled() => break exit(None, Some(9)),
                Some(frame) = outbox.recv() => {
                    if writer.send(frame).await.is_err() {
                        break exit(Some(1), None);
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(payload)) => {
                        let Some((reply, gate)) = self.reply(&payload) else { continue };
                        match gate {
                            Some(gate) => {
                                let outbox = self.outbox.clone();
                                tokio::spawn(async move {
                                    // A closed gate releases the reply too.
                                    let _permit = gate.acquire().await;
                                    let _ = outbox.send(reply);
                                });
                            }
                            None => {
                                if writer.send(reply).await.is_err() {
                                    break exit(Some(1), None);
                                }
                            }
                        }
                    }
                    Some(Err(_)) | None => break exit(Some(0), None),
                },
            }
        };

        drop(reader);
        drop(writer);
        let _ = exit_tx.send(exit);
    }
}

/// Launches [`FakeEngine`]s
#[derive(Default)]
pub struct FakeLauncher {
    behavior: Arc<Behavior>,
    specs: Mutex<Vec<ShardSpec>>,
    engines: Mutex<HashMap<ShardId, Arc<FakeEngine>>>,
}

impl FakeLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spec launched, relaunches included
    #[must_use]
    pub fn launched_specs(&self) -> Vec<ShardSpec> {
        self.specs.lock().clone()
    }

    /// The latest engine launched for `shard`
    ///
    /// # Panics
    ///
    /// When `shard` was never launched.
    #[must_use]
    pub fn engine(&self, shard: ShardId) -> Arc<FakeEngine> {
        self.engines
            .lock()
            .get(&shard)
            .cloned()
            .unwrap_or_else(|| panic!("shard {shard} was never launched"))
    }

    /// Kill the current engine of `shard`
    pub fn crash(&self, shard: ShardId) {
        self.engine(shard).kill();
    }

    /// Reject every future `method` request
    pub fn reject(&self, method: Method) {
        self.behavior.rejected.lock().insert(method.as_str());
    }

    /// Hold replies to `method` until [`Self::resume`]
    pub fn stall(&self, method: Method) {
        self.behavior
            .stalled
            .lock()
            .insert(method.as_str(), Arc::new(Semaphore::new(0)));
    }

    /// Release every stalled reply
    pub fn resume(&self) {
        for (_, gate) in self.behavior.stalled.lock().drain() {
            gate.close();
        }
    }

    /// Reply to `transport.getStats` with `stats`
    pub fn set_transport_stats(&self, stats: Value) {
        *self.behavior.transport_stats.lock() = stats;
    }

    /// Reply to `producer.getStats` / `consumer.getStats` with `stats`
    pub fn set_media_stats(&self, stats: Value) {
        *self.behavior.media_stats.lock() = stats;
    }

    /// Fail the next `count` launches
    pub fn fail_launches(&self, count: usize) {
        self.behavior.failing_launches.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(
        &self,
        spec: &ShardSpec,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> Result<LaunchedWorker> {
        let failing = &self.behavior.failing_launches;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Spawn(format!("shard {} launch refused", spec.shard)));
        }

        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let channel = Channel::new(ours, spec.shard, FAKE_REQUEST_TIMEOUT, notify_tx);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let engine = Arc::new(FakeEngine {
            shard: spec.shard,
            behavior: self.behavior.clone(),
            requests: Mutex::new(Vec::new()),
            outbox: outbox_tx,
            killed: CancellationToken::new(),
        });
        tokio::spawn(engine.clone().serve(theirs, outbox_rx, exit_tx, shutdown.clone()));

        self.specs.lock().push(spec.clone());
        self.engines.lock().insert(spec.shard, engine);

        Ok(LaunchedWorker {
            channel,
            exited,
            shutdown,
        })
    }
}

/// `router.createWebRtcTransport` reply with one host candidate
#[must_use]
pub fn fake_transport_parameters(ip: &str, port: u16) -> Value {
    json!({
        "iceRole": "controlled",
        "iceLocalParameters": {
            "usernameFragment": "fakeufrag",
            "password": "fakepassword",
            "iceLite": true,
        },
        "iceLocalCandidates": [{
            "foundation": "udpcandidate",
            "priority": 1_078_862_079,
            "ip": ip,
            "protocol": "udp",
            "port": port,
            "type": "host",
        }],
        "iceState": "new",
        "dtlsLocalParameters": {
            "role": "auto",
            "fingerprints": [
                { "algorithm": "sha-1", "value": "A1:B2:C3:D4:E5:F6:07:18:29:3A:4B:5C:6D:7E:8F:90:A1:B2:C3:D4" },
                { "algorithm": "sha-224", "value": "22:24:22:24:22:24:22:24:22:24:22:24:22:24:22:24:22:24:22:24:22:24:22:24:22:24:22:24" },
                { "algorithm": "sha-256", "value": "25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A:25:6A" },
                { "algorithm": "sha-384", "value": "38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B:38:4B" },
                { "algorithm": "sha-512", "value": "51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C:51:2C" },
            ],
        },
        "dtlsState": "new",
    })
}

const PUBLISHER_FINGERPRINT: &str = "6B:8B:F0:65:5F:78:E2:51:3B:AC:6F:F3:3F:46:1B:35:DC:B8:5F:64:1A:24:C2:43:F0:A1:58:D0:A1:2C:19:08";

const SUBSCRIBER_FINGERPRINT: &str = "3C:4D:0E:11:92:A7:58:6B:CC:01:9D:E4:7F:30:2A:B5:66:18:C9:F2:03:8E:41:D7:5A:BB:70:12:E9:4C:86:2F";

fn crlf(lines: &[&str]) -> String {
    lines.iter().map(|l| format!("{l}\r\n")).collect()
}

/// Browser-style sendonly offer: opus/111 (ssrc 1001) and H264/96
/// (ssrc 2001), with RTX 97/2002 when `rtx` is set
#[must_use]
pub fn publish_offer(rtx: bool) -> String {
    let fingerprint = format!("a=fingerprint:sha-256 {PUBLISHER_FINGERPRINT}");
    let mut lines = vec![
        "v=0",
        "o=- 4611731400430051336 2 IN IP4 127.0.0.1",
        "s=-",
        "t=0 0",
        "a=group:BUNDLE 0 1",
        "a=msid-semantic: WMS stream1",
        "m=audio 9 UDP/TLS/RTP/SAVPF 111",
        "c=IN IP4 0.0.0.0",
        "b=AS:64",
        "a=rtcp:9 IN IP4 0.0.0.0",
        "a=ice-ufrag:pUbL",
        "a=ice-pwd:publisherpassword0123456",
        "a=ice-options:trickle",
        fingerprint.as_str(),
        "a=setup:actpass",
        "a=mid:0",
        "a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level",
        "a=sendonly",
        "a=msid:stream1 audio1",
        "a=rtcp-mux",
        "a=rtpmap:111 opus/48000/2",
        "a=fmtp:111 minptime=10;useinbandfec=1",
        "a=ssrc:1001 cname:pubcname",
        "a=ssrc:1001 msid:stream1 audio1",
    ];
    lines.push(if rtx {
        "m=video 9 UDP/TLS/RTP/SAVPF 96 97"
    } else {
        "m=video 9 UDP/TLS/RTP/SAVPF 96"
    });
    lines.extend([
        "c=IN IP4 0.0.0.0",
        "b=AS:500",
        "a=rtcp:9 IN IP4 0.0.0.0",
        "a=ice-ufrag:pUbL",
        "a=ice-pwd:publisherpassword0123456",
        "a=ice-options:trickle",
        fingerprint.as_str(),
        "a=setup:actpass",
        "a=mid:1",
        "a=extmap:2 urn:ietf:params:rtp-hdrext:toffset",
        "a=extmap:3 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
        "a=extmap:4 urn:3gpp:video-orientation",
        "a=sendonly",
        "a=msid:stream1 video1",
        "a=rtcp-mux",
        "a=rtcp-rsize",
        "a=rtpmap:96 H264/90000",
        "a=rtcp-fb:96 goog-remb",
        "a=rtcp-fb:96 ccm fir",
        "a=rtcp-fb:96 nack",
        "a=rtcp-fb:96 nack pli",
        "a=fmtp:96 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
    ]);
    if rtx {
        lines.extend([
            "a=rtpmap:97 rtx/90000",
            "a=fmtp:97 apt=96",
            "a=ssrc-group:FID 2001 2002",
        ]);
    }
    lines.extend(["a=ssrc:2001 cname:pubcname", "a=ssrc:2001 msid:stream1 video1"]);
    if rtx {
        lines.extend(["a=ssrc:2002 cname:pubcname", "a=ssrc:2002 msid:stream1 video1"]);
    }
    crlf(&lines)
}

/// Browser-style recvonly offer: opus/109 (mid `a`) and H264/102 (mid `v`),
/// with RTX 103 when `rtx` is set. Carries no SSRCs.
#[must_use]
pub fn subscribe_offer(rtx: bool) -> String {
    let fingerprint = format!("a=fingerprint:sha-256 {SUBSCRIBER_FINGERPRINT}");
    let mut lines = vec![
        "v=0",
        "o=- 5017396512841873261 2 IN IP4 127.0.0.1",
        "s=-",
        "t=0 0",
        "a=group:BUNDLE a v",
        "a=msid-semantic: WMS",
        "m=audio 9 UDP/TLS/RTP/SAVPF 109",
        "c=IN IP4 0.0.0.0",
        "a=rtcp:9 IN IP4 0.0.0.0",
        "a=ice-ufrag:sUbS",
        "a=ice-pwd:subscriberpassword012345",
        "a=ice-options:trickle",
        fingerprint.as_str(),
        "a=setup:actpass",
        "a=mid:a",
        "a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level",
        "a=recvonly",
        "a=rtcp-mux",
        "a=rtpmap:109 opus/48000/2",
        "a=fmtp:109 minptime=10;useinbandfec=1",
    ];
    lines.push(if rtx {
        "m=video 9 UDP/TLS/RTP/SAVPF 102 103"
    } else {
        "m=video 9 UDP/TLS/RTP/SAVPF 102"
    });
    lines.extend([
        "c=IN IP4 0.0.0.0",
        "a=rtcp:9 IN IP4 0.0.0.0",
        "a=ice-ufrag:sUbS",
        "a=ice-pwd:subscriberpassword012345",
        "a=ice-options:trickle",
        fingerprint.as_str(),
        "a=setup:actpass",
        "a=mid:v",
        "a=extmap:2 urn:ietf:params:rtp-hdrext:toffset",
        "a=extmap:3 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
        "a=recvonly",
        "a=rtcp-mux",
        "a=rtcp-rsize",
        "a=rtpmap:102 H264/90000",
        "a=rtcp-fb:102 nack",
        "a=rtcp-fb:102 nack pli",
        "a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
    ]);
    if rtx {
        lines.extend(["a=rtpmap:103 rtx/90000", "a=fmtp:103 apt=102"]);
    }
    crlf(&lines)
}

/// A `webrtc-offer` request asking for audio and video
#[must_use]
pub fn offer_request(room: &str, stream: &str, conn: Option<&str>, sdp: &str) -> OfferRequest {
    OfferRequest {
        session: SessionRef {
            roomiid: room.into(),
            playerid: "p1".to_string(),
            streamid: stream.into(),
            connid: conn.map(Into::into),
        },
        sdp: sdp.to_string(),
        has_audio: true,
        has_video: true,
        ipv4: json!("127.0.0.1"),
    }
}
