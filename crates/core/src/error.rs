use std::time::Duration;

use crate::resource::{Reference, Type};

/// Errors surfaced to reconcilers, mappers and the manager's retry loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(Reference),
    #[error("version conflict on {reference}: expected {expected:?}, found {actual:?}")]
    Conflict { reference: Reference, expected: String, actual: String },
    #[error("decoding {ty} payload: {source}")]
    Decode {
        ty: Type,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected resource type: expected {expected}, got {actual}")]
    InvalidType { expected: Type, actual: Type },
    #[error("index {index}: {message}")]
    Index { index: String, message: String },
    #[error("validation: {0}")]
    Validation(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("write rejected: this replica is not the leader")]
    NotLeader,
    #[error("canceled")]
    Canceled,
    /// Not a failure: the reconciler asks to be called again after the delay.
    #[error("requeue after {0:?}")]
    Requeue(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shorthand for reconcilers that want to be revisited later.
pub fn requeue_after(d: Duration) -> Error {
    Error::Requeue(d)
}
