//! Orchestrator - publish/subscribe workflows and their teardown
//!
//! Every workflow runs in its own task as a strict sequence of engine
//! requests. The registry is the only state shared between workflows;
//! outbound events are values pushed onto an mpsc channel.

use crate::channel::{Channel, Internal, Method, Notification};
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::pool::{PoolEvents, ShardDown, WorkerPool};
use crate::registry::{
    Admission, Completion, Deferral, Negotiated, PublishTicket, Registry, RemovedSession,
    SubscribeTicket, Teardown,
};
use crate::sdp::payload::{self, TransportLocalParameters};
use crate::sdp::{self, AnswerParams, OfferParams};
use crate::signaling::{InboundMessage, OfferRequest, OutboundEvent, SessionRef};
use crate::stats::{self, PollTarget, StatsRole};
use crate::types::{MediaKind, ResourceKind, SessionKey};
use crate::worker::WorkerLauncher;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// unpublish / unsubscribe from signaling
    Requested,
    /// The setup workflow failed
    Failed,
    /// The engine reported the transport closed
    EngineClosed,
    /// Liveness timeout
    Expired,
}

impl CloseReason {
    const fn notifies(self) -> bool {
        matches!(self, Self::EngineClosed | Self::Expired)
    }
}

struct Inner {
    config: Arc<SfuConfig>,
    pool: Arc<WorkerPool>,
    registry: Registry,
    events: mpsc::UnboundedSender<OutboundEvent>,
}

/// Drives the engine shards on behalf of the signaling server
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Arc<SfuConfig>,
        pool: Arc<WorkerPool>,
        events: mpsc::UnboundedSender<OutboundEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                registry: Registry::new(),
                events,
            }),
        }
    }

    /// Launch the worker pool and the event loop.
    ///
    /// Returns the orchestrator and the stream of outbound events.
    pub async fn start(
        config: Arc<SfuConfig>,
        launcher: Arc<dyn WorkerLauncher>,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OutboundEvent>)> {
        let (pool, pool_events) = WorkerPool::start(config.clone(), launcher).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let orchestrator = Self::new(config, pool, events_tx);
        tokio::spawn(orchestrator.clone().run(pool_events, shutdown));
        Ok((orchestrator, events_rx))
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.inner.config
    }

    pub(crate) fn emit(&self, event: OutboundEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("outbound event dropped, signaling side is gone");
        }
    }

    /// Route engine notifications and shard failures until `shutdown`
    pub async fn run(self, mut events: PoolEvents, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(notification) = events.notifications.recv() => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_notification(notification).await });
                }
                Some(down) = events.shard_down.recv() => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_shard_down(down).await });
                }
                else => break,
            }
        }
        debug!("orchestrator event loop stopped");
    }

    /// Stop every worker
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    /// Dispatch one inbound signaling message
    pub fn handle(&self, message: InboundMessage) {
        match message {
            InboundMessage::WebrtcOffer(request) => {
                let this = self.clone();
                tokio::spawn(async move {
                    let key = request.session.key();
                    let result = if key.is_connection() {
                        this.subscribe(request).await
                    } else {
                        this.publish(request).await
                    };
                    if let Err(e) = result {
                        warn!(session = %key, error = %e, "offer not answered");
                    }
                });
            }
            InboundMessage::Publish(session) => self.emit(OutboundEvent::PublishRes(session)),
            InboundMessage::Subscribe(session) => self.emit(OutboundEvent::SubscribeRes(session)),
            InboundMessage::Unpublish(session) => {
                let key = SessionKey::stream(session.roomiid.clone(), session.streamid.clone());
                let this = self.clone();
                tokio::spawn(async move { this.unpublish(&key).await });
                self.emit(OutboundEvent::UnpublishRes(session));
            }
            InboundMessage::Unsubscribe(session) => {
                let key = session.key();
                if key.is_connection() {
                    let this = self.clone();
                    tokio::spawn(async move { this.unsubscribe(&key).await });
                } else {
                    warn!(session = %key, "unsubscribe without a connection key");
                }
                self.emit(OutboundEvent::UnsubscribeRes(session));
            }
            InboundMessage::WebrtcCandidate(_) => trace!("remote candidate ignored (ICE-lite)"),
            InboundMessage::HandshakeRes(_) | InboundMessage::Disconnect => {}
            InboundMessage::Other(key) => debug!(key, "unknown signaling message"),
        }
    }

    /// Publish workflow: answer a publisher's offer
    pub async fn publish(&self, request: OfferRequest) -> Result<()> {
        let key = request.session.key();
        let offer = Arc::new(sdp::decode(&request.sdp)?);
        let shard = self.inner.pool.choose_shard().ok_or(Error::NoShards)?;

        let ticket = match self
            .inner
            .registry
            .begin_publish(&key, &request.session.playerid, shard)
        {
            Admission::Started(ticket) => ticket,
            Admission::Duplicate => {
                debug!(session = %key, "publish retry ignored");
                return Ok(());
            }
        };

        let negotiated = Negotiated {
            audio: request.has_audio && offer.publishable_audio().is_some(),
            video: request.has_video && offer.publishable_video().is_some(),
        };
        info!(
            session = %key,
            shard = ticket.shard,
            audio = negotiated.audio,
            video = negotiated.video,
            "publishing"
        );

        let channel = match self.inner.pool.channel(ticket.shard) {
            Ok(channel) => channel,
            Err(e) => {
                self.close(&key, CloseReason::Failed).await;
                return Err(e);
            }
        };
        let transport = Internal::transport(ticket.router_id, ticket.ids.transport);
        let answer = match self
            .setup_publish(&channel, &request, &offer, negotiated, &ticket)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(&key, &channel, transport).await;
                return Err(e);
            }
        };

        let media = [
            (MediaKind::Audio, negotiated.audio, ticket.ids.audio),
            (MediaKind::Video, negotiated.video, ticket.ids.video),
        ]
        .into_iter()
        .filter(|(_, enabled, _)| *enabled)
        .map(|(kind, _, id)| {
            (
                kind,
                Internal::producer(ticket.router_id, ticket.ids.transport, id),
            )
        })
        .collect();
        let target = PollTarget {
            key: key.clone(),
            player_id: request.session.playerid.clone(),
            shard: ticket.shard,
            role: StatsRole::Publish,
            transport,
            media,
        };
        self.finish(&channel, request.session, offer, negotiated, answer, target, ticket.stats)
            .await
    }

    async fn setup_publish(
        &self,
        channel: &Channel,
        request: &OfferRequest,
        offer: &OfferParams,
        negotiated: Negotiated,
        ticket: &PublishTicket,
    ) -> Result<String> {
        let channel_ref = channel;
        let router = Internal::router(ticket.router_id);
        ticket
            .router
            .get_or_try_init(move || async move {
                channel_ref
                    .request(Method::WorkerCreateRouter, router, json!({}))
                    .await
                    .map(|_| ())
            })
            .await?;

        let transport = Internal::transport(ticket.router_id, ticket.ids.transport);
        let local: TransportLocalParameters = serde_json::from_value(
            channel
                .request(
                    Method::RouterCreateWebRtcTransport,
                    transport,
                    payload::create_transport(&request.ipv4),
                )
                .await?,
        )?;
        let answer = sdp::encode(&AnswerParams::publish(
            offer,
            negotiated.audio,
            negotiated.video,
            &local,
        )?);

        let bitrate = self.inner.config.effective_bitrate(offer.bandwidth);
        channel
            .request(Method::TransportSetMaxBitrate, transport, payload::bitrate(bitrate))
            .await?;
        if let Some(limit) = self.inner.config.max_incoming_bitrate {
            channel
                .request(
                    Method::TransportSetMaxIncomingBitrate,
                    transport,
                    payload::bitrate(limit),
                )
                .await?;
        }
        channel
            .request(
                Method::TransportSetRemoteDtlsParameters,
                transport,
                payload::remote_dtls(&offer.fingerprint),
            )
            .await?;

        let producers = [
            (MediaKind::Audio, negotiated.audio, offer.audio.as_ref(), ticket.ids.audio),
            (MediaKind::Video, negotiated.video, offer.video.as_ref(), ticket.ids.video),
        ];
        for (kind, enabled, media, producer_id) in producers {
            let Some(data) = media
                .filter(|_| enabled)
                .and_then(|m| payload::create_producer(kind, m, &offer.cname))
            else {
                continue;
            };
            channel
                .request(
                    Method::RouterCreateProducer,
                    Internal::producer(ticket.router_id, ticket.ids.transport, producer_id),
                    data,
                )
                .await?;
        }

        Ok(answer)
    }

    /// Subscribe workflow: answer a subscriber's offer for a published stream
    pub async fn subscribe(&self, request: OfferRequest) -> Result<()> {
        let key = request.session.key();
        let offer = Arc::new(sdp::decode(&request.sdp)?);

        let ticket = match self
            .inner
            .registry
            .begin_subscribe(&key, &request.session.playerid)
        {
            Some(Admission::Started(ticket)) => ticket,
            Some(Admission::Duplicate) => {
                debug!(session = %key, "subscribe retry ignored");
                return Ok(());
            }
            None => {
                return Err(Error::NotFound(format!(
                    "stream {}/{} is not published",
                    key.room, key.stream
                )))
            }
        };

        let negotiated = Negotiated {
            audio: request.has_audio && ticket.published.audio && offer.audio.is_some(),
            video: request.has_video && ticket.published.video && offer.video.is_some(),
        };
        info!(
            session = %key,
            shard = ticket.shard,
            audio = negotiated.audio,
            video = negotiated.video,
            "subscribing"
        );

        let channel = match self.inner.pool.channel(ticket.shard) {
            Ok(channel) => channel,
            Err(e) => {
                self.close(&key, CloseReason::Failed).await;
                return Err(e);
            }
        };
        let transport = Internal::transport(ticket.router_id, ticket.ids.transport);
        let answer = match self
            .setup_subscribe(&channel, &request, &offer, negotiated, &ticket)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(&key, &channel, transport).await;
                return Err(e);
            }
        };

        let media = [
            (MediaKind::Audio, negotiated.audio, ticket.producers.audio, ticket.ids.audio),
            (MediaKind::Video, negotiated.video, ticket.producers.video, ticket.ids.video),
        ]
        .into_iter()
        .filter(|(_, enabled, _, _)| *enabled)
        .map(|(kind, _, producer, consumer)| {
            (
                kind,
                Internal::consumer(ticket.router_id, ticket.ids.transport, producer, consumer),
            )
        })
        .collect();
        let target = PollTarget {
            key: key.clone(),
            player_id: request.session.playerid.clone(),
            shard: ticket.shard,
            role: StatsRole::Subscribe,
            transport,
            media,
        };
        self.finish(&channel, request.session, offer, negotiated, answer, target, ticket.stats)
            .await
    }

    async fn setup_subscribe(
        &self,
        channel: &Channel,
        request: &OfferRequest,
        offer: &OfferParams,
        negotiated: Negotiated,
        ticket: &SubscribeTicket,
    ) -> Result<String> {
        let publisher = &ticket.publisher;
        let media = [
            (
                MediaKind::Audio,
                negotiated.audio,
                publisher.audio.as_ref(),
                offer.audio.as_ref(),
                ticket.producers.audio,
                ticket.ids.audio,
            ),
            (
                MediaKind::Video,
                negotiated.video,
                publisher.video.as_ref(),
                offer.video.as_ref(),
                ticket.producers.video,
                ticket.ids.video,
            ),
        ];

        for (kind, enabled, pub_media, sub_media, producer, consumer) in media {
            let (true, Some(pub_media), Some(sub_media)) = (enabled, pub_media, sub_media) else {
                continue;
            };
            channel
                .request(
                    Method::RouterCreateConsumer,
                    Internal::consumer(ticket.router_id, ticket.ids.transport, producer, consumer),
                    payload::create_consumer(kind, pub_media, sub_media),
                )
                .await?;
        }

        let transport = Internal::transport(ticket.router_id, ticket.ids.transport);
        let local: TransportLocalParameters = serde_json::from_value(
            channel
                .request(
                    Method::RouterCreateWebRtcTransport,
                    transport,
                    payload::create_transport(&request.ipv4),
                )
                .await?,
        )?;
        let answer = sdp::encode(&AnswerParams::subscribe(
            publisher,
            offer,
            negotiated.audio,
            negotiated.video,
            &local,
        )?);

        channel
            .request(
                Method::TransportSetRemoteDtlsParameters,
                transport,
                payload::remote_dtls(&offer.fingerprint),
            )
            .await?;

        for (kind, enabled, pub_media, sub_media, producer, consumer) in media {
            let (true, Some(pub_media), Some(sub_media)) = (enabled, pub_media, sub_media) else {
                continue;
            };
            let Some(data) = payload::enable_consumer(kind, pub_media, sub_media, &publisher.cname)
            else {
                continue;
            };
            channel
                .request(
                    Method::ConsumerEnable,
                    Internal::consumer(ticket.router_id, ticket.ids.transport, producer, consumer),
                    data,
                )
                .await?;
        }

        Ok(answer)
    }

    /// Establish a session whose engine setup succeeded
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        channel: &Arc<Channel>,
        session: SessionRef,
        offer: Arc<OfferParams>,
        negotiated: Negotiated,
        answer: String,
        target: PollTarget,
        cancel: CancellationToken,
    ) -> Result<()> {
        let key = target.key.clone();
        match self.inner.registry.complete(&key, offer, negotiated) {
            Completion::Ready => {
                stats::spawn_poll(self.clone(), target, cancel);
                self.emit(OutboundEvent::Answer {
                    session,
                    sdp: answer,
                });
                info!(session = %key, "session established");
                Ok(())
            }
            Completion::TeardownPending(deferral) => {
                info!(session = %key, ?deferral, "teardown requested during setup");
                let reason = match deferral {
                    Deferral::Requested => CloseReason::Requested,
                    Deferral::EngineClosed => CloseReason::EngineClosed,
                };
                self.close(&key, reason).await;
                Ok(())
            }
            Completion::Gone => {
                self.abandon(&key, channel, target.transport).await;
                Err(Error::NotFound(format!("session {key} vanished during setup")))
            }
        }
    }

    /// Tear down a failed workflow's session, or just its transport when the
    /// session was already removed under it
    async fn fail(&self, key: &SessionKey, channel: &Arc<Channel>, transport: Internal) {
        if !self.close(key, CloseReason::Failed).await {
            self.abandon(key, channel, transport).await;
        }
    }

    /// Close the transport of a workflow whose session is gone
    async fn abandon(&self, key: &SessionKey, channel: &Arc<Channel>, transport: Internal) {
        // A relaunched shard never saw this transport.
        let current = self
            .inner
            .pool
            .channel(channel.shard())
            .is_ok_and(|c| Arc::ptr_eq(&c, channel));
        if !current {
            return;
        }
        info!(session = %key, shard = channel.shard(), "closing transport of a removed session");
        if let Err(e) = channel
            .request(Method::TransportClose, transport, json!({}))
            .await
        {
            debug!(session = %key, error = %e, "transport.close failed");
        }
    }

    /// Tear down a publish-side stream and every connection on it
    pub async fn unpublish(&self, key: &SessionKey) {
        self.close(key, CloseReason::Requested).await;
    }

    /// Tear down a subscribe-side connection
    pub async fn unsubscribe(&self, key: &SessionKey) {
        self.close(key, CloseReason::Requested).await;
    }

    /// Evict a session that went silent
    pub(crate) async fn expire(&self, key: &SessionKey) {
        self.close(key, CloseReason::Expired).await;
    }

    /// Returns false when nothing was removed (absent or deferred)
    async fn close(&self, key: &SessionKey, reason: CloseReason) -> bool {
        let teardown = match reason {
            CloseReason::EngineClosed => self.inner.registry.remove_engine_closed(key),
            CloseReason::Failed => self.inner.registry.remove(key, true),
            CloseReason::Requested | CloseReason::Expired => self.inner.registry.remove(key, false),
        };
        let (session, cascaded, room_removed) = match teardown {
            Teardown::Absent => {
                debug!(session = %key, ?reason, "nothing to tear down");
                return false;
            }
            Teardown::Deferred => {
                debug!(session = %key, ?reason, "teardown deferred until setup completes");
                return false;
            }
            Teardown::Removed {
                session,
                cascaded,
                room_removed,
            } => (session, cascaded, room_removed),
        };

        if reason.notifies() {
            self.emit(OutboundEvent::Close(SessionRef::from_key(
                &session.key,
                &session.player_id,
            )));
        }
        for connection in &cascaded {
            self.emit(OutboundEvent::Close(SessionRef::from_key(
                &connection.key,
                &connection.player_id,
            )));
        }

        if reason != CloseReason::EngineClosed {
            self.close_transport(&session).await;
        }
        // In-flight connections close their own transport once setup ends.
        for connection in cascaded.iter().filter(|c| c.established) {
            self.close_transport(connection).await;
        }

        info!(
            session = %key,
            ?reason,
            connections = cascaded.len(),
            room_removed,
            "session torn down"
        );
        true
    }

    async fn close_transport(&self, session: &RemovedSession) {
        let Ok(channel) = self.inner.pool.channel(session.shard) else {
            return;
        };
        if let Err(e) = channel
            .request(
                Method::TransportClose,
                Internal::transport(session.router_id, session.transport_id),
                json!({}),
            )
            .await
        {
            debug!(session = %session.key, error = %e, "transport.close failed");
        }
    }

    /// Route one engine notification to its session
    pub async fn handle_notification(&self, notification: Notification) {
        let Some(route) = self.inner.registry.route(notification.target_id) else {
            trace!(
                target_id = %notification.target_id,
                event = %notification.event,
                "notification for unknown target"
            );
            return;
        };
        if route.kind != ResourceKind::Transport {
            trace!(session = %route.key, event = %notification.event, "non-transport notification");
            return;
        }

        if notification.is_dtls_connected() {
            info!(session = %route.key, "DTLS connected");
            self.emit(OutboundEvent::IceState {
                session: SessionRef::from_key(&route.key, &route.player_id),
                connected: true,
            });
        } else if notification.is_close() {
            info!(session = %route.key, "transport closed by the engine");
            self.close(&route.key, CloseReason::EngineClosed).await;
        }
    }

    /// Drop every session of a dead shard and relaunch it
    pub async fn handle_shard_down(&self, down: ShardDown) {
        if !self.inner.pool.mark_down(down.shard, down.generation) {
            debug!(shard = down.shard, generation = down.generation, "stale shard-down ignored");
            return;
        }

        let removed = self.inner.registry.remove_shard(down.shard);
        warn!(
            shard = down.shard,
            sessions = removed.len(),
            "shard lost, dropping its sessions"
        );
        for session in &removed {
            self.emit(OutboundEvent::Close(SessionRef::from_key(
                &session.key,
                &session.player_id,
            )));
        }

        self.inner.pool.restart(down.shard, down.generation).await;
    }
}
