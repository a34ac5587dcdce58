//! What reconcilers, initializers and mappers get to work with: a storage
//! client whose writes are gated on leadership, and the shared cache.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use weft_cache::Cache;
use weft_core::{Error, Id, Resource, Result, Status, Tenancy, Type};
use weft_store::{Backend, StoreError};

/// Storage client handed to reconcilers. Reads always go through; writes,
/// status writes and deletes fail with [`Error::NotLeader`] on non-leaders.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
    leader: watch::Receiver<bool>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>, leader: watch::Receiver<bool>) -> Self {
        Self { backend, leader }
    }

    /// Client that always considers itself leader.
    pub fn ungated(backend: Arc<dyn Backend>) -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { backend, leader: rx }
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn gate(&self) -> Result<()> {
        if self.is_leader() { Ok(()) } else { Err(Error::NotLeader) }
    }

    /// `Ok(None)` when the resource does not exist.
    pub async fn read(&self, id: &Id) -> Result<Option<Resource>> {
        match self.backend.read(id).await {
            Ok(r) => Ok(Some(r)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self, ty: &Type, tenancy: &Tenancy, name_prefix: &str) -> Result<Vec<Resource>> {
        Ok(self.backend.list(ty, tenancy, name_prefix).await?)
    }

    pub async fn write(&self, res: Resource) -> Result<Resource> {
        self.gate()?;
        Ok(self.backend.write(res).await?)
    }

    pub async fn write_status(&self, id: &Id, key: &str, status: Status) -> Result<Resource> {
        self.gate()?;
        Ok(self.backend.write_status(id, key, status).await?)
    }

    pub async fn delete(&self, id: &Id) -> Result<()> {
        self.gate()?;
        Ok(self.backend.delete(id).await?)
    }
}

#[derive(Clone)]
pub struct Runtime {
    pub client: Client,
    pub cache: Arc<Cache>,
    controller: Arc<str>,
    cancel: CancellationToken,
}

impl Runtime {
    pub fn new(client: Client, cache: Arc<Cache>, controller: &str) -> Self {
        Self { client, cache, controller: Arc::from(controller), cancel: CancellationToken::new() }
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Fires when the pass this runtime was handed to should stop early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self.clone() }
    }

    /// `Err(Canceled)` once the pass has been canceled; for use between
    /// expensive steps of a reconcile.
    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_cancelled() { Err(Error::Canceled) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{Registration, Registry, Scope};
    use weft_store::MemBackend;

    const THING: Type = Type::from_static("demo", "v1", "Thing");

    #[tokio::test]
    async fn writes_are_gated_on_leadership() {
        let mut reg = Registry::new();
        reg.register(Registration::new(THING, Scope::Namespace));
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new(reg));
        let (tx, rx) = watch::channel(false);
        let client = Client::new(backend, rx);
        let res = Resource::new(Id::new(THING, Tenancy::default_namespace(), "a"), serde_json::json!({}));

        assert!(matches!(client.write(res.clone()).await, Err(Error::NotLeader)));
        assert!(client.read(&res.id).await.unwrap().is_none());

        tx.send(true).unwrap();
        let written = client.write(res).await.unwrap();
        assert!(client.read(&written.id).await.unwrap().is_some());
    }
}
