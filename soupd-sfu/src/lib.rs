//! soupd SFU control plane
//!
//! Drives a pool of external media-engine processes (one per shard) to
//! forward WebRTC media from publishers to subscribers. The engines do the
//! RTP work; this crate negotiates SDP, tracks rooms, streams and
//! connections, and answers the signaling server.
//!
//! ## Architecture
//!
//! - **`Channel`**: netstring JSON request/response link to one engine
//! - **`WorkerPool`**: one engine per shard, relaunched when it dies
//! - **`Registry`**: room → stream → connection state and resource ids
//! - **`Orchestrator`**: publish/subscribe workflows and teardown
//! - **`sdp`**: offer decoding and answer encoding
//! - **`signaling`**: `key=<JSON>` frames exchanged with the signaling server
//!
//! ## Usage
//!
//! ```rust,ignore
//! use soupd_sfu::{Orchestrator, ProcessLauncher, SfuConfig};
//!
//! let config = Arc::new(SfuConfig::default());
//! let launcher = Arc::new(ProcessLauncher::new(config.clone()));
//! let (orchestrator, mut events) =
//!     Orchestrator::start(config, launcher, CancellationToken::new()).await?;
//! orchestrator.handle(InboundMessage::parse(frame)?);
//! while let Some(event) = events.recv().await {
//!     send(event.encode()?);
//! }
//! ```

pub mod channel;
mod config;
mod error;
mod orchestrator;
mod pool;
pub mod registry;
pub mod sdp;
pub mod signaling;
pub mod stats;
pub mod test_helpers;
mod types;
pub mod worker;

pub use channel::{Channel, Internal, Method, Notification};
pub use config::{SfuConfig, DEFAULT_MAX_BITRATE, DEFAULT_REQUEST_TIMEOUT_MS};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use pool::{PoolEvents, ShardDown, WorkerPool};
pub use registry::{Registry, SessionState};
pub use signaling::{InboundMessage, OfferRequest, OutboundEvent, SessionRef};
pub use types::{
    ConnKey, MediaKind, ResourceId, ResourceKind, RoomKey, SessionKey, ShardId, StreamKey,
};
pub use worker::{ProcessLauncher, ShardSpec, WorkerExit, WorkerLauncher};
