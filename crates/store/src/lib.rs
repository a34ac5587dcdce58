//! Weft store: the storage backend contract consumed by the controller runtime,
//! plus an in-RAM backend with versioned writes, owner cascade and a watch feed,
//! and the coalescer used to batch that feed.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use tokio::sync::mpsc;
use weft_core::{Id, Reference, Resource, Status, Tenancy, Type, WatchEvent};

pub mod coalesce;
pub mod mem;

pub use coalesce::{Change, Coalescer};
pub use mem::MemBackend;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Reference),
    #[error("conflict on {reference}: expected {expected:?}, found {actual:?}")]
    Conflict { reference: Reference, expected: String, actual: String },
    #[error("resource type {0} not registered")]
    Unregistered(Type),
    #[error("invalid resource: {0}")]
    Invalid(String),
    #[error("watch feed closed")]
    Closed,
}

impl From<StoreError> for weft_core::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(r) => weft_core::Error::NotFound(r),
            StoreError::Conflict { reference, expected, actual } => {
                weft_core::Error::Conflict { reference, expected, actual }
            }
            StoreError::Invalid(msg) => weft_core::Error::Validation(msg),
            other => weft_core::Error::Backend(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage/transport contract. Reads of missing resources return
/// [`StoreError::NotFound`]; deletes of missing resources succeed.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn read(&self, id: &Id) -> StoreResult<Resource>;

    /// `tenancy` components may be wildcards. Results are ordered by reference.
    async fn list(&self, ty: &Type, tenancy: &Tenancy, name_prefix: &str) -> StoreResult<Vec<Resource>>;

    /// Create or update. A non-empty `version` is a compare-and-swap guard.
    async fn write(&self, res: Resource) -> StoreResult<Resource>;

    async fn write_status(&self, id: &Id, key: &str, status: Status) -> StoreResult<Resource>;

    async fn delete(&self, id: &Id) -> StoreResult<()>;

    /// Change feed for one type. The first event is always
    /// [`weft_core::WatchEvent::Restarted`] with the current contents.
    fn watch(&self, ty: &Type) -> StoreResult<Watch>;
}

/// Receiving half of a change feed.
pub struct Watch {
    ty: Type,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watch {
    pub fn new(ty: Type, rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { ty, rx }
    }

    pub fn resource_type(&self) -> &Type {
        &self.ty
    }

    /// `None` once the backend has gone away.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}
