//! Drive one controller's reconciler by hand, without the manager loop.
//!
//! The cache is rebuilt from the backend before every call, so a test can
//! write inputs, reconcile, and inspect storage in straight-line code.

use std::sync::Arc;

use weft_cache::Cache;
use weft_core::{Id, Referent, Request, Resource, Result, Tenancy, Type};
use weft_store::Backend;

use crate::controller::Controller;
use crate::dependency::dedupe;
use crate::runtime::{Client, Runtime};

pub struct TestController {
    controller: Controller,
    runtime: Runtime,
}

impl TestController {
    /// Panics if the controller's indexes or queries conflict.
    pub fn new(controller: Controller, backend: Arc<dyn Backend>) -> Self {
        controller.validate();
        let cache = Arc::new(Cache::new());
        for ty in controller.watched_types() {
            cache.add_type(&ty);
        }
        for index in &controller.managed_indexes {
            if let Err(e) = cache.add_index(&controller.managed_type, index.clone()) {
                panic!("{}", e);
            }
        }
        for w in &controller.watches {
            for index in &w.indexes {
                if let Err(e) = cache.add_index(&w.ty, index.clone()) {
                    panic!("{}", e);
                }
            }
        }
        for (name, query) in &controller.queries {
            if let Err(e) = cache.add_query(name, Arc::clone(query)) {
                panic!("{}", e);
            }
        }
        let runtime = Runtime::new(Client::ungated(backend), cache, &controller.name);
        Self { controller, runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn cache(&self) -> &Cache {
        &self.runtime.cache
    }

    /// Make the cache mirror storage for every watched type.
    pub async fn sync(&self) -> Result<()> {
        for ty in self.controller.watched_types() {
            self.sync_type(&ty).await?;
        }
        Ok(())
    }

    async fn sync_type(&self, ty: &Type) -> Result<()> {
        let stored = self.runtime.client.list(ty, &Tenancy::wildcard(), "").await?;
        for cached in self.cache().list_tenancy(ty, &Tenancy::wildcard(), "")? {
            if !stored.iter().any(|s| weft_core::equal_reference(s, &*cached)) {
                self.cache().delete(&*cached)?;
            }
        }
        for res in stored {
            self.cache().insert(res)?;
        }
        Ok(())
    }

    /// Sync, then run one reconcile pass for `id`.
    pub async fn reconcile(&self, id: &Id) -> Result<()> {
        self.sync().await?;
        let reconciler = self.controller.reconciler.clone().ok_or_else(|| {
            weft_core::Error::Other(anyhow::anyhow!("controller {} has no reconciler", self.controller.name))
        })?;
        reconciler.reconcile(&self.runtime, &Request::new(id.clone())).await
    }

    /// Requests the manager would enqueue for a change to `res`, sorted and
    /// de-duplicated. Syncs first so mappers see current storage.
    pub async fn map(&self, res: &Resource) -> Result<Vec<Request>> {
        self.sync().await?;
        let mut out = Vec::new();
        if res.ty() == &self.controller.managed_type {
            out.push(Request::new(res.id.clone()));
        }
        if let Some(w) = self.controller.watch_for(res.ty()) {
            out.extend((w.mapper)(&self.runtime, res)?);
        }
        Ok(dedupe(out))
    }

    /// Reconcile every request [`TestController::map`] yields for `res`.
    pub async fn reconcile_mapped(&self, res: &Resource) -> Result<()> {
        for req in self.map(res).await? {
            self.reconcile(&req.id).await?;
        }
        Ok(())
    }
}
