//! End-to-end session scenarios against the in-process fake engine

use serde_json::{json, Value};
use soupd_sfu::test_helpers::{offer_request, publish_offer, subscribe_offer, FakeLauncher};
use soupd_sfu::{
    InboundMessage, Method, Orchestrator, OutboundEvent, SessionKey, SessionState, SfuConfig,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn start(
    config: SfuConfig,
) -> (Orchestrator, mpsc::UnboundedReceiver<OutboundEvent>, Arc<FakeLauncher>) {
    let launcher = Arc::new(FakeLauncher::new());
    let (orchestrator, events) =
        Orchestrator::start(Arc::new(config), launcher.clone(), CancellationToken::new())
            .await
            .unwrap();
    (orchestrator, events, launcher)
}

fn config(workers: usize) -> SfuConfig {
    SfuConfig {
        num_workers: workers,
        stat_interval_ms: 60_000,
        ..Default::default()
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> OutboundEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event expected")
        .expect("event channel open")
}

fn offer_frame(room: &str, stream: &str, conn: Option<&str>, sdp: &str) -> String {
    let mut body = json!({
        "roomiid": room,
        "playerid": 42,
        "streamid": stream,
        "sdp": sdp,
        "hasAudio": true,
        "hasVideo": true,
        "ipv4": "127.0.0.1",
    });
    if let Some(conn) = conn {
        body["connid"] = json!(conn);
    }
    format!("webrtc-offer={body}")
}

#[tokio::test]
async fn test_publish_then_subscribe_over_signaling_frames() {
    let (orch, mut events, launcher) = start(config(1)).await;

    orch.handle(InboundMessage::parse(&offer_frame("room", "s1", None, &publish_offer(true))).unwrap());
    let answer = next_event(&mut events).await;
    let frame = answer.encode().unwrap();
    let body: Value = serde_json::from_str(frame.strip_prefix("webrtc-answer=").unwrap()).unwrap();
    assert_eq!(body["playerid"], "42");
    assert!(body.get("connid").is_none());
    let sdp = body["sdp"].as_str().unwrap();
    assert!(sdp.contains("a=fmtp:97 apt=96\r\n"));
    assert!(sdp.contains("a=candidate:udpcandidate 1 udp 1078862079 127.0.0.1 40000 typ host\r\n"));

    orch.handle(
        InboundMessage::parse(&offer_frame("room", "s1", Some("c1"), &subscribe_offer(false))).unwrap(),
    );
    let OutboundEvent::Answer { session, sdp } = next_event(&mut events).await else {
        panic!("expected the subscriber's answer");
    };
    assert_eq!(session.key(), SessionKey::connection("room", "s1", "c1"));
    // The subscriber declined RTX.
    assert!(sdp.contains("m=video 7 RTP/SAVPF 102\r\n"));
    assert!(!sdp.contains("a=ssrc:2002"));
    assert!(sdp.contains("a=ssrc:2001 msid:stream1 video1\r\n"));

    let enable = launcher.engine(0).requests_for("consumer.enable");
    assert_eq!(enable.len(), 2);
    let video = enable
        .iter()
        .find(|r| r.data["rtpParameters"]["codecs"][0]["payloadType"] == 102)
        .unwrap();
    assert_eq!(video.data["rtpParameters"]["encodings"][0], json!({ "ssrc": 2001 }));

    assert_eq!(
        orch.registry().state(&SessionKey::connection("room", "s1", "c1")),
        Some(SessionState::Subscribed)
    );
}

#[tokio::test]
async fn test_duplicate_publish_in_flight_creates_one_stream() {
    let (orch, mut events, launcher) = start(config(1)).await;
    launcher.stall(Method::RouterCreateWebRtcTransport);

    let frame = offer_frame("room", "s1", None, &publish_offer(false));
    orch.handle(InboundMessage::parse(&frame).unwrap());
    orch.handle(InboundMessage::parse(&frame).unwrap());

    let engine = launcher.engine(0);
    eventually("transport creation", || {
        !engine.requests_for("router.createWebRtcTransport").is_empty()
    })
    .await;
    launcher.resume();

    assert!(matches!(next_event(&mut events).await, OutboundEvent::Answer { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(engine.requests_for("router.createWebRtcTransport").len(), 1);
    assert_eq!(engine.requests_for("worker.createRouter").len(), 1);
    assert_eq!(orch.registry().stream_count(), 1);
}

#[tokio::test]
async fn test_unpublish_during_publish_tears_down_on_completion() {
    let (orch, mut events, launcher) = start(config(1)).await;
    launcher.stall(Method::RouterCreateWebRtcTransport);

    orch.handle(InboundMessage::parse(&offer_frame("room", "s1", None, &publish_offer(false))).unwrap());
    let engine = launcher.engine(0);
    eventually("transport creation", || {
        !engine.requests_for("router.createWebRtcTransport").is_empty()
    })
    .await;

    let key = SessionKey::stream("room", "s1");
    orch.handle(
        InboundMessage::parse(r#"unpublish={"roomiid":"room","playerid":"42","streamid":"s1"}"#).unwrap(),
    );
    assert!(matches!(next_event(&mut events).await, OutboundEvent::UnpublishRes(_)));
    // Still in flight: only flagged.
    assert_eq!(orch.registry().state(&key), Some(SessionState::Publishing));

    launcher.resume();
    eventually("teardown", || orch.registry().stream_count() == 0).await;
    eventually("transport close", || engine.requests_for("transport.close").len() == 1).await;
    assert_eq!(orch.registry().resource_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "no answer for a torn down publish");
}

#[tokio::test]
async fn test_unpublish_during_subscribe_closes_the_subscriber_transport() {
    let (orch, mut events, launcher) = start(config(1)).await;
    orch.publish(offer_request("room", "s1", None, &publish_offer(false)))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, OutboundEvent::Answer { .. }));
    let engine = launcher.engine(0);
    let publisher = engine.requests_for("router.createWebRtcTransport")[0]
        .transport_id()
        .unwrap();

    launcher.stall(Method::RouterCreateConsumer);
    let subscribing = tokio::spawn({
        let orch = orch.clone();
        async move {
            orch.subscribe(offer_request("room", "s1", Some("c1"), &subscribe_offer(false)))
                .await
        }
    });
    eventually("consumer creation", || {
        !engine.requests_for("router.createConsumer").is_empty()
    })
    .await;
    let subscriber = engine.requests_for("router.createConsumer")[0]
        .transport_id()
        .unwrap();

    orch.unpublish(&SessionKey::stream("room", "s1")).await;
    let OutboundEvent::Close(closed) = next_event(&mut events).await else {
        panic!("expected the subscriber's close");
    };
    assert_eq!(closed.key(), SessionKey::connection("room", "s1", "c1"));
    assert_eq!(orch.registry().stream_count(), 0);

    launcher.resume();
    assert!(subscribing.await.unwrap().is_err());

    let on_subscriber: Vec<String> = engine
        .requests()
        .into_iter()
        .filter(|r| r.transport_id() == Some(subscriber))
        .map(|r| r.method)
        .collect();
    assert_eq!(on_subscriber.last().map(String::as_str), Some("transport.close"));
    assert_eq!(
        on_subscriber.iter().filter(|m| *m == "transport.close").count(),
        1,
        "closed once, after it was created: {on_subscriber:?}"
    );
    let created = on_subscriber
        .iter()
        .position(|m| m == "router.createWebRtcTransport");
    assert!(created.is_some_and(|i| i < on_subscriber.len() - 1));

    let closes: Vec<_> = engine
        .requests_for("transport.close")
        .iter()
        .filter_map(|r| r.transport_id())
        .collect();
    assert_eq!(closes, vec![publisher, subscriber]);
    assert_eq!(orch.registry().resource_count(), 0);
    assert!(events.try_recv().is_err(), "no answer for the dropped subscriber");
}

#[tokio::test]
async fn test_shard_crash_only_drops_its_rooms() {
    let (orch, mut events, launcher) = start(config(2)).await;

    // Shard choice is random; publish rooms until both shards hold some.
    let mut by_shard: HashMap<usize, BTreeSet<String>> = HashMap::new();
    for i in 0..64 {
        let room = format!("room{i}");
        orch.publish(offer_request(&room, "s1", None, &publish_offer(true)))
            .await
            .unwrap();
        let shard = orch.registry().room_shard(&room.as_str().into()).unwrap();
        by_shard.entry(shard).or_default().insert(room);
        if by_shard.get(&0).map_or(0, BTreeSet::len) >= 2 && by_shard.contains_key(&1) {
            break;
        }
    }
    let doomed = by_shard.remove(&0).unwrap();
    let survivors = by_shard.remove(&1).unwrap();
    assert!(doomed.len() >= 2);

    let first_doomed = doomed.iter().next().unwrap().clone();
    orch.subscribe(offer_request(&first_doomed, "s1", Some("viewer"), &subscribe_offer(true)))
        .await
        .unwrap();
    while events.try_recv().is_ok() {}

    launcher.crash(0);

    let mut closed = BTreeSet::new();
    let mut closed_connections = 0;
    for _ in 0..doomed.len() + 1 {
        let OutboundEvent::Close(session) = next_event(&mut events).await else {
            panic!("expected only close events");
        };
        if session.connid.is_some() {
            closed_connections += 1;
        }
        closed.insert(session.roomiid.to_string());
    }
    assert_eq!(closed, doomed);
    assert_eq!(closed_connections, 1);

    for room in &survivors {
        assert_eq!(
            orch.registry().state(&SessionKey::stream(room.as_str(), "s1")),
            Some(SessionState::Published)
        );
    }
    assert_eq!(orch.registry().room_count(), survivors.len());

    // The surviving shard keeps serving.
    let survivor = survivors.iter().next().unwrap();
    orch.subscribe(offer_request(survivor, "s1", Some("late"), &subscribe_offer(true)))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, OutboundEvent::Answer { .. }));

    // The crashed shard comes back on its own.
    eventually("shard relaunch", || orch.pool().is_live(0)).await;
    assert_eq!(launcher.launched_specs().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_silent_session_is_evicted_exactly_once() {
    let (orch, mut events, launcher) = start(SfuConfig {
        num_workers: 1,
        stat_interval_ms: 1000,
        liveness_timeout_secs: 30,
        ..Default::default()
    })
    .await;

    orch.publish(offer_request("room", "s1", None, &publish_offer(false)))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, OutboundEvent::Answer { .. }));

    launcher.set_media_stats(json!([{ "frameWidth": 1280, "frameHeight": 720 }]));
    launcher.set_transport_stats(json!([{
        "bytesReceived": 5000,
        "bytesSent": 0,
        "lastStunTimestamp": 1,
        "lastRtcpTimestamp": 1,
    }]));

    let OutboundEvent::Stat(stat) = next_event(&mut events).await else {
        panic!("expected a stat sample first");
    };
    assert_eq!(stat.stat.bytes, 5000);
    assert_eq!(stat.stat.duration, 1000);
    assert_eq!((stat.stat.width, stat.stat.height), (1280, 720));

    let OutboundEvent::Close(closed) = next_event(&mut events).await else {
        panic!("expected the eviction close");
    };
    assert_eq!(closed.key(), SessionKey::stream("room", "s1"));

    // Later ticks must not repeat the teardown.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(launcher.engine(0).requests_for("transport.close").len(), 1);
    assert_eq!(orch.registry().stream_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stat_samples_report_byte_deltas() {
    let (orch, mut events, launcher) = start(SfuConfig {
        num_workers: 1,
        stat_interval_ms: 1000,
        ..Default::default()
    })
    .await;

    orch.publish(offer_request("room", "s1", None, &publish_offer(false)))
        .await
        .unwrap();
    orch.subscribe(offer_request("room", "s1", Some("c1"), &subscribe_offer(false)))
        .await
        .unwrap();
    let _ = next_event(&mut events).await;
    let _ = next_event(&mut events).await;

    launcher.set_transport_stats(json!([{ "bytesReceived": 1000, "bytesSent": 400 }]));
    let mut first = HashMap::new();
    for _ in 0..2 {
        let OutboundEvent::Stat(stat) = next_event(&mut events).await else {
            panic!("expected stats");
        };
        first.insert(stat.session.connid.is_some(), stat.stat.bytes);
    }
    assert_eq!(first[&false], 1000);
    assert_eq!(first[&true], 400);

    launcher.set_transport_stats(json!([{ "bytesReceived": 2500, "bytesSent": 400 }]));
    let mut second = HashMap::new();
    for _ in 0..2 {
        let OutboundEvent::Stat(stat) = next_event(&mut events).await else {
            panic!("expected stats");
        };
        second.insert(stat.session.connid.is_some(), stat.stat.bytes);
    }
    assert_eq!(second[&false], 1500);
    assert_eq!(second[&true], 0);
    assert_eq!(orch.registry().stream_count(), 1);
}
