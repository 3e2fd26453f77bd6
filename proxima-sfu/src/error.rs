//! Error types for the signaling coordinator

use thiserror::Error;

/// Coordinator error types
///
/// Every variant is local to the connection that triggered it and maps to a
/// stable wire code through [`Error::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Already joined room {0}; leave it first")]
    AlreadyJoined(String),

    #[error("Not joined to any room")]
    NotJoined,

    #[error("A {0} transport already exists for this peer")]
    TransportExists(String),

    #[error("Cannot consume producer {0} with the given capabilities")]
    CannotConsume(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Media engine not ready")]
    NotReady,
}

impl Error {
    /// Wire code sent to clients in `error` replies
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "notFound",
            Self::Precondition(_) => "precondition",
            Self::AlreadyJoined(_) => "alreadyJoined",
            Self::NotJoined => "notJoined",
            Self::TransportExists(_) => "transportExists",
            Self::CannotConsume(_) => "cannotConsume",
            Self::InvalidPayload(_) => "invalidPayload",
            Self::LimitExceeded(_) => "limitExceeded",
            Self::Engine(_) => "engine",
            Self::NotReady => "notReady",
        }
    }

    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;
