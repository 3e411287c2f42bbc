//! Error types for roomsync-protocols.

use std::time::Duration;

use thiserror::Error;

use crate::wire::FrameError;

/// Result type for roomsync-protocols operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// This peer is not attached to a room session.
    #[error("not attached to a room session")]
    NotInSession,

    /// The operation is reserved for the single writer.
    #[error("peer is not the room master")]
    NotMaster,

    /// This peer already has a negotiation outstanding on the key.
    #[error("negotiation already in flight for {0:?}")]
    InFlight(String),

    /// The store refused the write locally.
    #[error("store rejected write to {0:?}")]
    Rejected(String),

    /// The expected value never became visible locally.
    #[error("{key:?} did not converge after {waited:?}")]
    Timeout { key: String, waited: Duration },

    /// The property holds a value of the wrong shape.
    #[error("{key:?} does not hold {expected}")]
    UnexpectedValue { key: String, expected: &'static str },

    /// The counter cannot be incremented any further.
    #[error("counter {0:?} exhausted")]
    Exhausted(String),

    /// A roster frame violated the transport contract.
    #[error("roster frame rejected: {0}")]
    Frame(#[from] FrameError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying with freshly read state can succeed.
    ///
    /// These are the expected outcomes of optimistic concurrency, as opposed
    /// to precondition failures that will keep failing until the peer's role
    /// changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InFlight(_) | Self::Rejected(_) | Self::Timeout { .. }
        )
    }

    /// Whether the failure was reported without waiting on the room.
    pub fn is_immediate(&self) -> bool {
        !matches!(self, Self::Timeout { .. })
    }
}
