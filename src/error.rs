//! Error types for the live streaming client.

use thiserror::Error;

/// Result type for live-session operations.
pub type Result<T> = std::result::Result<T, LiveError>;

/// Errors that can occur while driving a live session.
#[derive(Error, Debug)]
pub enum LiveError {
    /// WebSocket connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation requires an established session.
    #[error("session not connected")]
    NotConnected,

    /// A connect attempt was rejected because one is already active.
    #[error("connect already in progress or session already connected")]
    AlreadyConnected,

    /// Audio device error (microphone permission, device init, stream build).
    #[error("audio device error: {0}")]
    Device(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LiveError {
    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new audio device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }
}
