use thiserror::Error;

/// Crate-wide error type, one variant per entry in the protocol's error
/// taxonomy. `Duplicate` and `Unauthorized` frames are never surfaced as
/// `Err` from the router — they are dropped silently (logged at `debug`
/// under verbose mode) — so they have no variant here.
#[derive(Debug, Error, Clone)]
pub enum LsnpError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("delivery failed after exhausting retries: {0}")]
    DeliveryFailed(String),

    #[error("session timed out: {0}")]
    SessionTimeout(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("node already shut down")]
    Shutdown,
}

impl From<std::io::Error> for LsnpError {
    fn from(e: std::io::Error) -> Self {
        LsnpError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LsnpError>;
