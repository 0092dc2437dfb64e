use std::io;

use thiserror::Error;

/// Failure while pulling one control line off a session's inbound stream.
///
/// Both variants end the session: the stream can no longer be trusted to be
/// positioned at a frame boundary.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream read failed: {0}")]
    Io(#[from] io::Error),
    #[error("control frame exceeds {limit} bytes")]
    TooLong { limit: usize },
}

/// A control line was read intact but could not be understood.
///
/// Recoverable once a session is registered; the sender gets an `error` frame
/// carrying the display text and the read loop continues.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json")]
    InvalidJson(#[source] serde_json::Error),
    #[error("unknown type")]
    UnknownType,
    #[error("malformed {kind} frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("name already taken")]
    NameTaken,
}

/// A peer's outbound path refused a frame.
///
/// Only `Closed` means the peer is gone and should be evicted. A full queue
/// is a peer that is behind; the frame is dropped for that peer alone.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue for {name} is full")]
    QueueFull { name: String },
    #[error("outbound path for {name} is closed")]
    Closed { name: String },
}

impl DeliveryError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}
