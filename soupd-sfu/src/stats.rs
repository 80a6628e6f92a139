//! Per-session statistics polling and liveness
//!
//! Each established session gets one poll task. A tick fetches transport
//! stats (and producer/consumer stats for the frame size), reports an
//! `on-pc-stat` sample and evicts the session once the peer has gone quiet.

use crate::channel::{Internal, Method};
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::signaling::{OutboundEvent, SessionRef, StatSample, StreamStat};
use crate::types::{MediaKind, SessionKey, ShardId};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Transport counters reported by `transport.getStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Seconds since the epoch; absent or 0 when never seen
    pub last_stun_timestamp: Option<u64>,
    pub last_rtcp_timestamp: Option<u64>,
}

impl TransportStats {
    /// Parse a stats reply. The engine answers with an array whose first
    /// element describes the transport.
    pub fn from_response(value: Value) -> Result<Self> {
        let entry = match value {
            Value::Array(mut entries) if !entries.is_empty() => entries.swap_remove(0),
            Value::Array(_) | Value::Null => return Ok(Self::default()),
            other => other,
        };
        Ok(serde_json::from_value(entry)?)
    }

    /// True when at least one liveness timestamp is reported and every
    /// reported one is older than `timeout_secs`.
    #[must_use]
    pub fn is_stale(&self, timeout_secs: u64, now_secs: u64) -> bool {
        let reported: Vec<u64> = [self.last_stun_timestamp, self.last_rtcp_timestamp]
            .into_iter()
            .flatten()
            .filter(|ts| *ts > 0)
            .collect();
        !reported.is_empty()
            && reported
                .iter()
                .all(|ts| ts.saturating_add(timeout_secs) < now_secs)
    }
}

/// `(width, height)` from producer/consumer stats, `(0, 0)` when unknown
#[must_use]
pub fn frame_size(value: &Value) -> (u32, u32) {
    let entries = match value {
        Value::Array(entries) => entries.as_slice(),
        other => std::slice::from_ref(other),
    };
    let dimension = |entry: &Value, field: &str| {
        entry
            .get(field)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    };
    entries
        .iter()
        .find_map(|entry| Some((dimension(entry, "frameWidth")?, dimension(entry, "frameHeight")?)))
        .unwrap_or((0, 0))
}

/// Which byte counter a session's traffic shows up in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsRole {
    Publish,
    Subscribe,
}

impl StatsRole {
    const fn media_method(self) -> Method {
        match self {
            Self::Publish => Method::ProducerGetStats,
            Self::Subscribe => Method::ConsumerGetStats,
        }
    }

    const fn bytes(self, stats: &TransportStats) -> u64 {
        match self {
            Self::Publish => stats.bytes_received,
            Self::Subscribe => stats.bytes_sent,
        }
    }
}

/// What a poll task watches
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub key: SessionKey,
    pub player_id: String,
    pub shard: ShardId,
    pub role: StatsRole,
    pub transport: Internal,
    /// Producers or consumers of the negotiated media
    pub media: Vec<(MediaKind, Internal)>,
}

enum Tick {
    Continue,
    Stop,
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Start polling an established session until `cancel` fires
pub(crate) fn spawn_poll(orchestrator: Orchestrator, target: PollTarget, cancel: CancellationToken) {
    tokio::spawn(async move {
        let period = orchestrator.config().stat_interval();
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_bytes = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match poll_once(&orchestrator, &target, &cancel, started, &mut last_bytes).await {
                Tick::Continue => {}
                Tick::Stop => break,
            }
        }
        debug!(session = %target.key, "statistics poll stopped");
    });
}

async fn poll_once(
    orchestrator: &Orchestrator,
    target: &PollTarget,
    cancel: &CancellationToken,
    started: Instant,
    last_bytes: &mut u64,
) -> Tick {
    let Ok(channel) = orchestrator.pool().channel(target.shard) else {
        return Tick::Stop;
    };

    let stats = match channel
        .request(Method::TransportGetStats, target.transport, json!({}))
        .await
        .and_then(TransportStats::from_response)
    {
        Ok(stats) => stats,
        Err(e) => {
            debug!(session = %target.key, error = %e, "transport.getStats failed");
            return Tick::Continue;
        }
    };

    let (mut width, mut height) = (0, 0);
    for (kind, internal) in &target.media {
        match channel
            .request(target.role.media_method(), *internal, json!({}))
            .await
        {
            Ok(value) if *kind == MediaKind::Video => (width, height) = frame_size(&value),
            Ok(_) => {}
            Err(e) => debug!(session = %target.key, %kind, error = %e, "media stats failed"),
        }
    }

    // The session may have been torn down while the requests were in flight.
    if cancel.is_cancelled() || !orchestrator.registry().is_live(&target.key) {
        return Tick::Stop;
    }

    let total = target.role.bytes(&stats);
    let now = now_secs();
    let sample = StatSample {
        bytes: total.saturating_sub(*last_bytes),
        time: i64::try_from(now).unwrap_or(i64::MAX),
        elapsed: started.elapsed().as_secs(),
        duration: orchestrator.config().stat_interval_ms,
        height,
        width,
    };
    *last_bytes = total;
    orchestrator.emit(OutboundEvent::Stat(StreamStat {
        session: SessionRef::from_key(&target.key, &target.player_id),
        stat: sample,
    }));

    if stats.is_stale(orchestrator.config().liveness_timeout_secs, now) {
        info!(session = %target.key, "peer went silent, evicting");
        orchestrator.expire(&target.key).await;
        return Tick::Stop;
    }
    Tick::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats_from_array() {
        let stats = TransportStats::from_response(json!([
            { "bytesReceived": 1200, "bytesSent": 300, "lastStunTimestamp": 1_700_000_000 },
            { "bytesReceived": 9 },
        ]))
        .unwrap();
        assert_eq!(stats.bytes_received, 1200);
        assert_eq!(stats.bytes_sent, 300);
        assert_eq!(stats.last_stun_timestamp, Some(1_700_000_000));
        assert_eq!(stats.last_rtcp_timestamp, None);

        assert_eq!(TransportStats::from_response(json!([])).unwrap(), TransportStats::default());
        assert!(TransportStats::from_response(json!([{ "bytesSent": "many" }])).is_err());
    }

    #[test]
    fn test_staleness() {
        let now = 1_000;
        let stats = |stun, rtcp| TransportStats {
            last_stun_timestamp: stun,
            last_rtcp_timestamp: rtcp,
            ..Default::default()
        };

        // Nothing reported yet.
        assert!(!stats(None, None).is_stale(30, now));
        assert!(!stats(Some(0), Some(0)).is_stale(30, now));
        // Exactly at the threshold is still live.
        assert!(!stats(Some(970), None).is_stale(30, now));
        assert!(stats(Some(969), None).is_stale(30, now));
        // One fresh timestamp keeps the session.
        assert!(!stats(Some(100), Some(990)).is_stale(30, now));
        assert!(stats(Some(100), Some(200)).is_stale(30, now));
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(
            frame_size(&json!([{ "type": "outbound-rtp" }, { "frameWidth": 640, "frameHeight": 480 }])),
            (640, 480)
        );
        assert_eq!(frame_size(&json!({ "frameWidth": 320, "frameHeight": 240 })), (320, 240));
        assert_eq!(frame_size(&json!([{ "frameWidth": 320 }])), (0, 0));
        assert_eq!(frame_size(&Value::Null), (0, 0));
    }
}
