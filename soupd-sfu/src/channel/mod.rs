//! Transport Channel to a media-engine process
//!
//! Requests and responses are JSON documents framed as netstrings on a single
//! byte stream, interleaved with the engine's diagnostic log lines. Each
//! request is parked in a pending table until exactly one of response,
//! timeout or channel shutdown removes it.

mod codec;
mod message;

pub use codec::{NetstringCodec, MAX_FRAME_LENGTH};
pub use message::{ChannelMessage, Internal, LogMarker, Method, Notification, Request, Response};

use crate::error::{Error, Result};
use crate::types::ShardId;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Value>>>>>;

/// Request/response channel to one engine process
pub struct Channel {
    shard: ShardId,
    next_id: AtomicU32,
    pending: Pending,
    writer: mpsc::UnboundedSender<Bytes>,
    timeout: Duration,
    closed: CancellationToken,
}

impl Channel {
    /// Start a channel over `stream`.
    ///
    /// Engine notifications are forwarded to `notify_tx`.
    pub fn new<S>(
        stream: S,
        shard: ShardId,
        timeout: Duration,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(Self {
            shard,
            next_id: AtomicU32::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            writer: write_tx,
            timeout,
            closed: CancellationToken::new(),
        });

        tokio::spawn(Self::write_task(
            shard,
            FramedWrite::new(writer, NetstringCodec::new()),
            write_rx,
            channel.pending.clone(),
            channel.closed.clone(),
        ));
        tokio::spawn(Self::read_task(
            shard,
            FramedRead::new(reader, NetstringCodec::new()),
            notify_tx,
            channel.pending.clone(),
            channel.closed.clone(),
        ));

        channel
    }

    #[must_use]
    pub const fn shard(&self) -> ShardId {
        self.shard
    }

    /// Id 0 marks a message that is not a response, so it is never handed out
    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a request and wait for its outcome.
    ///
    /// Fails with [`Error::Rejected`] when the engine rejects it,
    /// [`Error::Timeout`] when no response arrives in time, and
    /// [`Error::ChannelClosed`] when the channel dies first.
    pub async fn request(&self, method: Method, internal: Internal, data: Value) -> Result<Value> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        let id = self.next_request_id();
        let frame = serde_json::to_vec(&Request {
            id,
            method: method.as_str(),
            internal: &internal,
            data: &data,
        })?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.writer.send(Bytes::from(frame)).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::ChannelClosed);
        }
        debug!(shard = self.shard, id, %method, "channel request sent");

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                if self.pending.lock().remove(&id).is_some() {
                    warn!(shard = self.shard, id, %method, "channel request timed out");
                    return Err(Error::Timeout(format!("{method} (id {id})")));
                }
                // Settled concurrently with the deadline; the outcome is already queued.
                rx.await.unwrap_or(Err(Error::ChannelClosed))
            }
        }
    }

    /// Close the channel, failing every pending request
    pub fn close(&self) {
        self.closed.cancel();
        fail_all(&self.pending);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is dead
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Number of requests awaiting an outcome
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn write_task<W>(
        shard: ShardId,
        mut sink: FramedWrite<W, NetstringCodec>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        pending: Pending,
        closed: CancellationToken,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let frame = tokio::select! {
                () = closed.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = sink.send(frame).await {
                error!(shard, error = %e, "channel write failed");
                closed.cancel();
                fail_all(&pending);
                break;
            }
        }
        trace!(shard, "channel writer terminated");
    }

    async fn read_task<R>(
        shard: ShardId,
        mut stream: FramedRead<R, NetstringCodec>,
        notify_tx: mpsc::UnboundedSender<Notification>,
        pending: Pending,
        closed: CancellationToken,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            let item = tokio::select! {
                () = closed.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(payload)) => dispatch(shard, &payload, &notify_tx, &pending),
                Some(Err(e)) => {
                    error!(shard, error = %e, "channel error");
                    break;
                }
                None => {
                    error!(shard, "channel ended by the other side");
                    break;
                }
            }
        }
        closed.cancel();
        fail_all(&pending);
        trace!(shard, "channel reader terminated");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn fail_all(pending: &Pending) {
    let drained: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(Error::ChannelClosed));
    }
}

fn dispatch(
    shard: ShardId,
    payload: &[u8],
    notify_tx: &mpsc::UnboundedSender<Notification>,
    pending: &Pending,
) {
    let Some(&first) = payload.first() else {
        error!(shard, "channel unexpected data: empty frame");
        return;
    };

    if first == b'{' {
        match ChannelMessage::parse(payload) {
            Ok(ChannelMessage::Response(response)) => {
                let Some(tx) = pending.lock().remove(&response.id) else {
                    error!(
                        shard,
                        id = response.id,
                        "received response does not match any sent request"
                    );
                    return;
                };
                let outcome = response.outcome.map_err(Error::Rejected);
                let _ = tx.send(outcome);
            }
            Ok(ChannelMessage::Notification(notification)) => {
                trace!(
                    shard,
                    target_id = %notification.target_id,
                    event = %notification.event,
                    "channel notification"
                );
                let _ = notify_tx.send(notification);
            }
            Err(e) => {
                error!(shard, error = %e, "invalid channel message");
            }
        }
        return;
    }

    let line = || String::from_utf8_lossy(&payload[1..]);
    match LogMarker::from_byte(first) {
        Some(LogMarker::Debug) => debug!(target: "soupd::engine", shard, "{}", line()),
        Some(LogMarker::Warn) => warn!(target: "soupd::engine", shard, "{}", line()),
        Some(LogMarker::Error) => error!(target: "soupd::engine", shard, "{}", line()),
        Some(LogMarker::Dump) => debug!(target: "soupd::engine", shard, dump = true, "{}", line()),
        None => error!(
            shard,
            data = %String::from_utf8_lossy(payload),
            "channel unexpected data"
        ),
    }
}
