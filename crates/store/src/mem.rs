//! In-RAM backend. Every write bumps a global version counter; generations only
//! move when the payload or owner changes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;
use weft_core::{Id, Reference, Referent, Registry, Resource, Status, Tenancy, Type, WatchEvent};

use crate::{Backend, StoreError, StoreResult, Watch};

struct Watcher {
    ty: Type,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct MemState {
    resources: BTreeMap<Reference, Resource>,
    version: u64,
    watchers: Vec<Watcher>,
}

impl MemState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn publish(&mut self, ty: &Type, ev: WatchEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for w in self.watchers.iter().filter(|w| &w.ty == ty) {
            let _ = w.tx.send(ev.clone());
        }
    }

    fn lookup(&self, id: &Id) -> StoreResult<&Resource> {
        let r = id.to_reference();
        match self.resources.get(&r) {
            Some(res) if id.uid.is_empty() || res.id.uid == id.uid => Ok(res),
            _ => Err(StoreError::NotFound(r)),
        }
    }
}

pub struct MemBackend {
    registry: Registry,
    state: Mutex<MemState>,
}

impl MemBackend {
    pub fn new(registry: Registry) -> Self {
        Self { registry, state: Mutex::new(MemState::default()) }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of writes accepted so far (status writes included).
    pub fn write_count(&self) -> u64 {
        self.state.lock().version
    }

    fn prepare(&self, mut res: Resource) -> StoreResult<Resource> {
        let reg = self.registry.get(&res.id.ty).ok_or_else(|| StoreError::Unregistered(res.id.ty.clone()))?;
        if res.id.tenancy.is_wildcard() {
            return Err(StoreError::Invalid(format!("wildcard tenancy on stored resource {}", res.id)));
        }
        if res.id.name.is_empty() {
            return Err(StoreError::Invalid("resource name is required".to_string()));
        }
        reg.scope.normalize(&mut res.id.tenancy);
        if let Some(mutate) = reg.mutate {
            mutate(&mut res).map_err(|e| StoreError::Invalid(e.to_string()))?;
        }
        if let Some(validate) = reg.validate {
            validate(&res).map_err(|e| StoreError::Invalid(e.to_string()))?;
        }
        Ok(res)
    }
}

fn owned_by(state: &MemState, owner: &Reference) -> Vec<Reference> {
    state
        .resources
        .values()
        .filter(|r| r.owner.as_ref().is_some_and(|o| weft_core::equal_reference(o, owner)))
        .map(|r| r.to_reference())
        .collect()
}

#[async_trait]
impl Backend for MemBackend {
    async fn read(&self, id: &Id) -> StoreResult<Resource> {
        self.state.lock().lookup(id).cloned()
    }

    async fn list(&self, ty: &Type, tenancy: &Tenancy, name_prefix: &str) -> StoreResult<Vec<Resource>> {
        if self.registry.get(ty).is_none() {
            return Err(StoreError::Unregistered(ty.clone()));
        }
        let st = self.state.lock();
        Ok(st
            .resources
            .values()
            .filter(|r| &r.id.ty == ty && tenancy.matches(&r.id.tenancy) && r.id.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn write(&self, res: Resource) -> StoreResult<Resource> {
        let mut res = self.prepare(res)?;
        let reference = res.to_reference();
        let mut st = self.state.lock();

        let existing = st.resources.get(&reference).cloned();
        if !res.version.is_empty() {
            let actual = existing.as_ref().map(|e| e.version.clone()).unwrap_or_default();
            if actual != res.version {
                counter!("store_conflict_total", 1u64);
                return Err(StoreError::Conflict { reference, expected: res.version, actual });
            }
        }
        match existing {
            Some(prev) => {
                if !res.id.uid.is_empty() && res.id.uid != prev.id.uid {
                    counter!("store_conflict_total", 1u64);
                    return Err(StoreError::Conflict { reference, expected: res.id.uid, actual: prev.id.uid });
                }
                if prev.data == res.data && prev.owner == res.owner && prev.metadata == res.metadata {
                    trace!(reference = %reference, "write is a no-op");
                    return Ok(prev);
                }
                let version = st.next_version();
                res.id.uid = prev.id.uid.clone();
                res.generation = if prev.data == res.data && prev.owner == res.owner { prev.generation } else { version.clone() };
                res.version = version;
                res.status = prev.status;
            }
            None => {
                let version = st.next_version();
                if res.id.uid.is_empty() {
                    res.id.uid = Uuid::new_v4().to_string();
                }
                res.generation = version.clone();
                res.version = version;
                res.status.clear();
            }
        }
        st.resources.insert(reference.clone(), res.clone());
        st.publish(&res.id.ty, WatchEvent::Upsert(res.clone()));
        counter!("store_write_total", 1u64);
        debug!(reference = %reference, version = %res.version, "write");
        Ok(res)
    }

    async fn write_status(&self, id: &Id, key: &str, status: Status) -> StoreResult<Resource> {
        let mut st = self.state.lock();
        let mut res = st.lookup(id)?.clone();
        if res.status.get(key) == Some(&status) {
            return Ok(res);
        }
        res.status.insert(key.to_string(), status);
        res.version = st.next_version();
        st.resources.insert(res.to_reference(), res.clone());
        st.publish(&res.id.ty, WatchEvent::Upsert(res.clone()));
        counter!("store_write_total", 1u64);
        Ok(res)
    }

    async fn delete(&self, id: &Id) -> StoreResult<()> {
        let mut st = self.state.lock();
        if st.lookup(id).is_err() {
            return Ok(());
        }
        // owner cascade, depth first
        let mut pending = vec![id.to_reference()];
        while let Some(r) = pending.pop() {
            let Some(gone) = st.resources.remove(&r) else { continue };
            pending.extend(owned_by(&st, &r));
            debug!(reference = %r, "delete");
            let ty = gone.id.ty.clone();
            st.publish(&ty, WatchEvent::Delete(gone));
        }
        Ok(())
    }

    fn watch(&self, ty: &Type) -> StoreResult<Watch> {
        if self.registry.get(ty).is_none() {
            return Err(StoreError::Unregistered(ty.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.state.lock();
        let snapshot: Vec<Resource> = st.resources.values().filter(|r| &r.id.ty == ty).cloned().collect();
        // sent under the lock so no write can slip in between snapshot and subscribe
        tx.send(WatchEvent::Restarted(snapshot)).map_err(|_| StoreError::Closed)?;
        st.watchers.push(Watcher { ty: ty.clone(), tx });
        Ok(Watch::new(ty.clone(), rx))
    }
}
