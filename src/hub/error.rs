// Error taxonomy for the control center

use thiserror::Error;

/// Errors raised while reading or writing length-prefixed frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The stream closed in the middle of a frame
    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: u64,
    },
}

/// A peer broke the wire protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("empty message body")]
    EmptyBody,
    #[error("connection closed before the identity frame")]
    MissingIdentity,
    #[error("malformed identity {0:?}, expected \"path,uid\"")]
    BadIdentity(String),
    /// The announced path is the hub's own mail address
    #[error("path {0:?} is reserved for the control center")]
    ReservedPath(String),
    #[error("payload is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("malformed letter: {0}")]
    BadLetter(#[from] serde_json::Error),
}

/// Top-level error for hub and client operations
#[derive(Debug, Error)]
pub enum HubError {
    /// Wrong shared secret. Never reported to the peer.
    #[error("authentication failed")]
    Auth,
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("clock sync failed: none of {probes} echo probes produced a usable sample")]
    SyncFailure { probes: usize },
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("connection closed")]
    Closed,
}

impl From<FrameError> for HubError {
    fn from(err: FrameError) -> Self {
        HubError::Protocol(ProtocolError::Frame(err))
    }
}

pub type Result<T, E = HubError> = std::result::Result<T, E>;
