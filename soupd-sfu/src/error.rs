//! Error types for the SFU control plane

use thiserror::Error;

/// Control plane error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Worker spawn error: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Shard unavailable: {0}")]
    ShardUnavailable(usize),

    #[error("No media engine shard is running")]
    NoShards,
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, Error>;
