//! Session Registry - room → stream → connection hierarchy
//!
//! All state lives behind one mutex. The id set and the reverse index are
//! the same map (`resources`), so an id is reserved and routed by a single
//! insert and released by a single remove. Teardown methods only mutate
//! state and report what was removed; callers issue the engine requests and
//! outbound events afterwards, outside the lock.

use crate::sdp::OfferParams;
use crate::types::{
    ConnKey, ResourceId, ResourceKind, RoomKey, SessionKey, ShardId, StreamKey,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a resource id belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Room(RoomKey),
    Session(SessionKey),
}

#[derive(Debug, Clone)]
struct Resource {
    kind: ResourceKind,
    owner: Owner,
}

/// Lifecycle of a publish-side Stream or subscribe-side Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Publishing,
    Published,
    Subscribing,
    Subscribed,
}

impl SessionState {
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(self, Self::Published | Self::Subscribed)
    }
}

/// Media negotiated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    pub audio: bool,
    pub video: bool,
}

/// Ids of one session's engine objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIds {
    pub transport: ResourceId,
    /// Producer (publish) or consumer (subscribe)
    pub audio: ResourceId,
    pub video: ResourceId,
}

/// Why a teardown was put off until setup completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    Requested,
    /// The engine already closed the transport
    EngineClosed,
}

struct Session {
    state: SessionState,
    teardown_pending: Option<Deferral>,
    player_id: String,
    ids: SessionIds,
    offer: Option<Arc<OfferParams>>,
    negotiated: Negotiated,
    stats: CancellationToken,
}

impl Session {
    fn new(state: SessionState, player_id: &str, ids: SessionIds) -> Self {
        Self {
            state,
            teardown_pending: None,
            player_id: player_id.to_string(),
            ids,
            offer: None,
            negotiated: Negotiated::default(),
            stats: CancellationToken::new(),
        }
    }
}

struct StreamEntry {
    session: Session,
    connections: HashMap<ConnKey, Session>,
}

struct Room {
    shard: ShardId,
    router_id: ResourceId,
    router: Arc<OnceCell<()>>,
    streams: HashMap<StreamKey, StreamEntry>,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<ResourceId, Resource>,
    rooms: HashMap<RoomKey, Room>,
}

/// Rejection-sample a free id and reserve it in the same step
fn reserve(
    resources: &mut HashMap<ResourceId, Resource>,
    kind: ResourceKind,
    owner: Owner,
) -> ResourceId {
    let mut rng = rand::thread_rng();
    loop {
        let id = ResourceId::new(rng.gen_range(ResourceId::MIN..=ResourceId::MAX));
        if let Entry::Vacant(slot) = resources.entry(id) {
            slot.insert(Resource { kind, owner });
            return id;
        }
    }
}

impl Inner {
    fn allocate_id(&mut self, kind: ResourceKind, owner: Owner) -> ResourceId {
        reserve(&mut self.resources, kind, owner)
    }

    fn allocate_session_ids(&mut self, key: &SessionKey, media: ResourceKind) -> SessionIds {
        let owner = Owner::Session(key.clone());
        SessionIds {
            transport: self.allocate_id(ResourceKind::Transport, owner.clone()),
            audio: self.allocate_id(media, owner.clone()),
            video: self.allocate_id(media, owner),
        }
    }

    fn release(&mut self, ids: &SessionIds) {
        self.resources.remove(&ids.transport);
        self.resources.remove(&ids.audio);
        self.resources.remove(&ids.video);
    }

    fn session_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        let stream = self.rooms.get_mut(&key.room)?.streams.get_mut(&key.stream)?;
        match &key.conn {
            Some(conn) => stream.connections.get_mut(conn),
            None => Some(&mut stream.session),
        }
    }

    fn session(&self, key: &SessionKey) -> Option<&Session> {
        let stream = self.rooms.get(&key.room)?.streams.get(&key.stream)?;
        match &key.conn {
            Some(conn) => stream.connections.get(conn),
            None => Some(&stream.session),
        }
    }

    /// Drop a room if it has no streams left. Returns true if it was dropped.
    fn prune_room(&mut self, room: &RoomKey) -> bool {
        if self.rooms.get(room).is_some_and(|r| r.streams.is_empty()) {
            if let Some(removed) = self.rooms.remove(room) {
                self.resources.remove(&removed.router_id);
                return true;
            }
        }
        false
    }
}

/// Outcome of a publish/subscribe admission
#[derive(Debug)]
pub enum Admission<T> {
    /// A new session entry was created in the in-flight state
    Started(T),
    /// The session already exists; the request is a retry
    Duplicate,
}

/// Everything a publish workflow needs
#[derive(Debug, Clone)]
pub struct PublishTicket {
    pub shard: ShardId,
    pub router_id: ResourceId,
    /// Initialized once the room's router exists on the engine
    pub router: Arc<OnceCell<()>>,
    pub ids: SessionIds,
    pub stats: CancellationToken,
}

/// Everything a subscribe workflow needs
#[derive(Debug, Clone)]
pub struct SubscribeTicket {
    pub shard: ShardId,
    pub router_id: ResourceId,
    pub ids: SessionIds,
    /// Publisher's producer ids
    pub producers: SessionIds,
    pub publisher: Arc<OfferParams>,
    pub published: Negotiated,
    pub stats: CancellationToken,
}

/// Outcome of marking an in-flight session established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ready,
    /// Teardown was requested meanwhile; the caller must tear down now
    TeardownPending(Deferral),
    /// The session was removed meanwhile (shard crash)
    Gone,
}

/// A session removed from the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSession {
    pub key: SessionKey,
    pub player_id: String,
    pub shard: ShardId,
    pub router_id: ResourceId,
    pub transport_id: ResourceId,
    pub established: bool,
}

/// Result of a stream/connection teardown request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// Nothing to tear down
    Absent,
    /// The session is still being set up; its workflow will tear it down
    Deferred,
    Removed {
        session: RemovedSession,
        /// Connections removed along with a stream
        cascaded: Vec<RemovedSession>,
        room_removed: bool,
    },
}

/// Who owns a routed resource id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: ResourceKind,
    pub key: SessionKey,
    pub player_id: String,
}

/// Session Registry
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id unique across every live resource
    pub fn allocate_id(&self, kind: ResourceKind, owner: Owner) -> ResourceId {
        self.inner.lock().allocate_id(kind, owner)
    }

    /// Release an id handed out by [`Self::allocate_id`]
    pub fn release_id(&self, id: ResourceId) -> bool {
        self.inner.lock().resources.remove(&id).is_some()
    }

    /// Admit a publish for `key`.
    ///
    /// A new room is placed on `shard`; an existing room keeps its shard.
    pub fn begin_publish(
        &self,
        key: &SessionKey,
        player_id: &str,
        shard: ShardId,
    ) -> Admission<PublishTicket> {
        let mut inner = self.inner.lock();

        if inner
            .rooms
            .get(&key.room)
            .is_some_and(|r| r.streams.contains_key(&key.stream))
        {
            return Admission::Duplicate;
        }

        let ids = inner.allocate_session_ids(key, ResourceKind::Producer);
        let session = Session::new(SessionState::Publishing, player_id, ids);
        let stats = session.stats.clone();

        let Inner { resources, rooms } = &mut *inner;
        let room = rooms.entry(key.room.clone()).or_insert_with(|| {
            let router_id = reserve(resources, ResourceKind::Router, Owner::Room(key.room.clone()));
            info!(room = %key.room, shard, %router_id, "room created");
            Room {
                shard,
                router_id,
                router: Arc::new(OnceCell::new()),
                streams: HashMap::new(),
            }
        });
        room.streams.insert(
            key.stream.clone(),
            StreamEntry {
                session,
                connections: HashMap::new(),
            },
        );

        Admission::Started(PublishTicket {
            shard: room.shard,
            router_id: room.router_id,
            router: room.router.clone(),
            ids,
            stats,
        })
    }

    /// Admit a subscribe for `key`. Fails with `None` when the stream is not
    /// published.
    pub fn begin_subscribe(
        &self,
        key: &SessionKey,
        player_id: &str,
    ) -> Option<Admission<SubscribeTicket>> {
        let conn = key.conn.clone()?;
        let mut inner = self.inner.lock();

        let room = inner.rooms.get(&key.room)?;
        let (shard, router_id) = (room.shard, room.router_id);
        let stream = room.streams.get(&key.stream)?;
        if stream.session.state != SessionState::Published || stream.session.teardown_pending.is_some() {
            return None;
        }
        if stream.connections.contains_key(&conn) {
            return Some(Admission::Duplicate);
        }
        let producers = stream.session.ids;
        let published = stream.session.negotiated;
        let publisher = stream.session.offer.clone()?;

        let ids = inner.allocate_session_ids(key, ResourceKind::Consumer);
        let session = Session::new(SessionState::Subscribing, player_id, ids);
        let stats = session.stats.clone();

        inner
            .rooms
            .get_mut(&key.room)?
            .streams
            .get_mut(&key.stream)?
            .connections
            .insert(conn, session);

        Some(Admission::Started(SubscribeTicket {
            shard,
            router_id,
            ids,
            producers,
            publisher,
            published,
            stats,
        }))
    }

    /// Mark an in-flight session established
    pub fn complete(
        &self,
        key: &SessionKey,
        offer: Arc<OfferParams>,
        negotiated: Negotiated,
    ) -> Completion {
        let mut inner = self.inner.lock();
        let Some(session) = inner.session_mut(key) else {
            return Completion::Gone;
        };
        session.state = match session.state {
            SessionState::Publishing | SessionState::Published => SessionState::Published,
            SessionState::Subscribing | SessionState::Subscribed => SessionState::Subscribed,
        };
        session.offer = Some(offer);
        session.negotiated = negotiated;
        match session.teardown_pending {
            Some(deferral) => Completion::TeardownPending(deferral),
            None => Completion::Ready,
        }
    }

    /// Tear down a stream (with its connections) or a connection.
    ///
    /// An in-flight session is only flagged unless `force` is set.
    /// In-flight connections cascaded from a stream come back with
    /// `established == false`; their own workflow still owns their transport.
    pub fn remove(&self, key: &SessionKey, force: bool) -> Teardown {
        self.remove_deferring(key, force, Deferral::Requested)
    }

    /// Like [`Registry::remove`] for a transport the engine already closed.
    ///
    /// A deferred entry remembers that, so the teardown run at completion
    /// does not close the transport again.
    pub fn remove_engine_closed(&self, key: &SessionKey) -> Teardown {
        self.remove_deferring(key, false, Deferral::EngineClosed)
    }

    fn remove_deferring(&self, key: &SessionKey, force: bool, deferral: Deferral) -> Teardown {
        let mut inner = self.inner.lock();

        let Some(room) = inner.rooms.get_mut(&key.room) else {
            return Teardown::Absent;
        };
        let (shard, router_id) = (room.shard, room.router_id);
        let Some(stream) = room.streams.get_mut(&key.stream) else {
            return Teardown::Absent;
        };

        let removed = |key: SessionKey, s: &Session| RemovedSession {
            key,
            player_id: s.player_id.clone(),
            shard,
            router_id,
            transport_id: s.ids.transport,
            established: s.state.is_established(),
        };

        match &key.conn {
            Some(conn) => {
                let Some(session) = stream.connections.get_mut(conn) else {
                    return Teardown::Absent;
                };
                if !force && !session.state.is_established() {
                    defer(&mut session.teardown_pending, deferral);
                    return Teardown::Deferred;
                }
                let Some(session) = stream.connections.remove(conn) else {
                    return Teardown::Absent;
                };
                session.stats.cancel();
                let removed = removed(key.clone(), &session);
                inner.release(&session.ids);
                debug!(session = %key, "connection removed");
                Teardown::Removed {
                    session: removed,
                    cascaded: Vec::new(),
                    room_removed: false,
                }
            }
            None => {
                if !force && !stream.session.state.is_established() {
                    defer(&mut stream.session.teardown_pending, deferral);
                    return Teardown::Deferred;
                }
                let Some(entry) = room.streams.remove(&key.stream) else {
                    return Teardown::Absent;
                };
                entry.session.stats.cancel();
                let session = removed(key.clone(), &entry.session);
                let mut cascaded = Vec::with_capacity(entry.connections.len());
                let mut ids = vec![entry.session.ids];
                for (conn, c) in entry.connections {
                    c.stats.cancel();
                    ids.push(c.ids);
                    cascaded.push(removed(
                        SessionKey::connection(key.room.clone(), key.stream.clone(), conn),
                        &c,
                    ));
                }
                for ids in &ids {
                    inner.release(ids);
                }
                let room_removed = inner.prune_room(&key.room);
                debug!(
                    session = %key,
                    connections = cascaded.len(),
                    room_removed,
                    "stream removed"
                );
                Teardown::Removed {
                    session,
                    cascaded,
                    room_removed,
                }
            }
        }
    }

    /// Drop every room on `shard`, returning all their sessions
    pub fn remove_shard(&self, shard: ShardId) -> Vec<RemovedSession> {
        let mut inner = self.inner.lock();
        let rooms: Vec<RoomKey> = inner
            .rooms
            .iter()
            .filter(|(_, r)| r.shard == shard)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::new();
        for room_key in rooms {
            let Some(room) = inner.rooms.remove(&room_key) else {
                continue;
            };
            inner.resources.remove(&room.router_id);
            for (stream_key, entry) in room.streams {
                let mut sessions = vec![(
                    SessionKey::stream(room_key.clone(), stream_key.clone()),
                    entry.session,
                )];
                sessions.extend(entry.connections.into_iter().map(|(conn, c)| {
                    (
                        SessionKey::connection(room_key.clone(), stream_key.clone(), conn),
                        c,
                    )
                }));
                for (key, session) in sessions {
                    session.stats.cancel();
                    inner.release(&session.ids);
                    removed.push(RemovedSession {
                        key,
                        player_id: session.player_id,
                        shard,
                        router_id: room.router_id,
                        transport_id: session.ids.transport,
                        established: session.state.is_established(),
                    });
                }
            }
            info!(room = %room_key, shard, "room dropped with its shard");
        }
        removed
    }

    /// Route a resource id to its owning session
    #[must_use]
    pub fn route(&self, id: ResourceId) -> Option<Route> {
        let inner = self.inner.lock();
        let resource = inner.resources.get(&id)?;
        let Owner::Session(key) = &resource.owner else {
            return None;
        };
        let session = inner.session(key)?;
        Some(Route {
            kind: resource.kind,
            key: key.clone(),
            player_id: session.player_id.clone(),
        })
    }

    #[must_use]
    pub fn state(&self, key: &SessionKey) -> Option<SessionState> {
        self.inner.lock().session(key).map(|s| s.state)
    }

    /// True while `key` exists and its poll has not been canceled
    #[must_use]
    pub fn is_live(&self, key: &SessionKey) -> bool {
        self.inner
            .lock()
            .session(key)
            .is_some_and(|s| !s.stats.is_cancelled())
    }

    #[must_use]
    pub fn room_shard(&self, room: &RoomKey) -> Option<ShardId> {
        self.inner.lock().rooms.get(room).map(|r| r.shard)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.lock().rooms.values().map(|r| r.streams.len()).sum()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .rooms
            .values()
            .flat_map(|r| r.streams.values())
            .map(|s| s.connections.len())
            .sum()
    }

    /// Number of reserved resource ids
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.inner.lock().resources.len()
    }
}

/// An engine close wins over a plain request
fn defer(pending: &mut Option<Deferral>, deferral: Deferral) {
    if *pending != Some(Deferral::EngineClosed) {
        *pending = Some(deferral);
    }
}
