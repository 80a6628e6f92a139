//! Common types used throughout the control plane

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_key!(
    /// Externally supplied room key (`roomiid` on the signaling wire)
    RoomKey
);

string_key!(
    /// Publish-side stream key (`streamid` on the signaling wire)
    StreamKey
);

string_key!(
    /// Subscribe-side connection key (`connid` on the signaling wire)
    ConnKey
);

/// Identifier of a media-engine shard
pub type ShardId = usize;

/// Engine resource id. Routers, transports, producers and consumers share one
/// id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u32);

impl ResourceId {
    /// Smallest 8-digit id
    pub const MIN: u32 = 10_000_000;
    /// Largest 8-digit id
    pub const MAX: u32 = 99_999_999;

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of engine resource an id was allocated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Router,
    Transport,
    Producer,
    Consumer,
}

/// Media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a publish-side Stream or a subscribe-side Connection.
///
/// `conn` is `None` for the publisher's Stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub room: RoomKey,
    pub stream: StreamKey,
    pub conn: Option<ConnKey>,
}

impl SessionKey {
    pub fn stream(room: impl Into<RoomKey>, stream: impl Into<StreamKey>) -> Self {
        Self {
            room: room.into(),
            stream: stream.into(),
            conn: None,
        }
    }

    pub fn connection(
        room: impl Into<RoomKey>,
        stream: impl Into<StreamKey>,
        conn: impl Into<ConnKey>,
    ) -> Self {
        Self {
            room: room.into(),
            stream: stream.into(),
            conn: Some(conn.into()),
        }
    }

    #[must_use]
    pub const fn is_connection(&self) -> bool {
        self.conn.is_some()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.conn {
            Some(conn) => write!(f, "{}/{}/{}", self.room, self.stream, conn),
            None => write!(f, "{}/{}", self.room, self.stream),
        }
    }
}
