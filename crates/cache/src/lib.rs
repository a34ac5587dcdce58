//! Weft cache: in-RAM, per-type multi-index store of the latest known resources.
//!
//! Each registered type always carries the [`ID_INDEX`]; further indexes are
//! registered before the first insert (history is not re-indexed). Writes come
//! from the watch-ingest path only; reconcilers and dependency mappers read.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use weft_core::{Reference, Referent, Resource, Tenancy, Type, WILDCARD};

pub mod error;
pub mod index;
pub mod indexers;
pub mod selection;

pub use error::{CacheError, CacheResult};
pub use index::{reference_key, strip_separator, Arg, Builder, Index, IndexKeys, SEPARATOR};
pub use indexers::{
    bound_refs_index, decoded_multi_index, decoded_single_index, id_index, multi_index, owner_index,
    ref_index, ref_or_id_index, reference_from_args, single_index, string_from_args, ID_INDEX,
};
pub use selection::SelectionTracker;

/// Custom named query over the cache.
pub type Query = Arc<dyn Fn(&Cache, &[Arg]) -> anyhow::Result<ResourceIterator> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Treat the query key as a prefix (its trailing separator is stripped).
    pub prefix: bool,
}

/// Sequence of resources matched by one query.
///
/// Captures the matching entries when created and yields them lazily; a new
/// call is needed to observe later cache writes.
pub struct ResourceIterator {
    inner: std::vec::IntoIter<Arc<Resource>>,
}

impl ResourceIterator {
    pub fn new(items: Vec<Arc<Resource>>) -> Self {
        Self { inner: items.into_iter() }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for ResourceIterator {
    type Item = Arc<Resource>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

struct IndexStore {
    def: Index,
    /// key -> resources contributing that key, sorted by reference
    tree: BTreeMap<Vec<u8>, Vec<Arc<Resource>>>,
    /// reference -> keys it contributed on its last insert
    contributed: FxHashMap<Reference, IndexKeys>,
}

impl IndexStore {
    fn new(def: Index) -> Self {
        Self { def, tree: BTreeMap::new(), contributed: FxHashMap::default() }
    }

    fn remove(&mut self, r: &Reference) {
        let Some(keys) = self.contributed.remove(r) else { return };
        for k in keys {
            if let Some(entries) = self.tree.get_mut(&k) {
                entries.retain(|e| !weft_core::equal_reference(e.as_ref(), r));
                if entries.is_empty() {
                    self.tree.remove(&k);
                }
            }
        }
    }

    fn insert(&mut self, res: &Arc<Resource>, keys: IndexKeys) {
        let r = res.to_reference();
        self.remove(&r);
        if keys.is_empty() {
            return;
        }
        for k in keys.iter() {
            let entries = self.tree.entry(k.clone()).or_default();
            let pos = entries.partition_point(|e| e.to_reference() < r);
            entries.insert(pos, Arc::clone(res));
        }
        self.contributed.insert(r, keys);
    }

    fn exact(&self, key: &[u8]) -> Vec<Arc<Resource>> {
        self.tree.get(key).cloned().unwrap_or_default()
    }

    fn prefix(&self, prefix: &[u8]) -> Vec<Arc<Resource>> {
        self.tree
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .flat_map(|(_, v)| v.iter().cloned())
            .collect()
    }

    /// Entries whose key equals `key` or is a separator-aligned prefix of it.
    fn parents(&self, key: &[u8]) -> Vec<Arc<Resource>> {
        let mut out = Vec::new();
        for (i, b) in key.iter().enumerate() {
            if *b == SEPARATOR {
                out.extend(self.exact(&key[..=i]));
            }
        }
        if key.last() != Some(&SEPARATOR) {
            out.extend(self.exact(key));
        }
        out
    }
}

struct TypeStore {
    /// `indexes[0]` is always the id index.
    indexes: Vec<IndexStore>,
}

impl TypeStore {
    fn new() -> Self {
        Self { indexes: vec![IndexStore::new(id_index())] }
    }

    fn index(&self, ty: &Type, name: &str) -> CacheResult<&IndexStore> {
        self.indexes
            .iter()
            .find(|i| i.def.name() == name)
            .ok_or_else(|| CacheError::IndexNotFound { ty: ty.clone(), index: name.to_string() })
    }

    fn len(&self) -> usize {
        self.indexes[0].contributed.len()
    }
}

/// The indexed cache. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct Cache {
    types: RwLock<FxHashMap<Type, TypeStore>>,
    queries: RwLock<FxHashMap<String, Query>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Registering twice is a no-op.
    pub fn add_type(&self, ty: &Type) {
        self.types.write().entry(ty.clone()).or_insert_with(TypeStore::new);
    }

    /// Register an index for `ty`, registering the type if needed. Existing
    /// resources are not back-filled.
    pub fn add_index(&self, ty: &Type, index: Index) -> CacheResult<()> {
        let mut types = self.types.write();
        let store = types.entry(ty.clone()).or_insert_with(TypeStore::new);
        if store.indexes.iter().any(|i| i.def.name() == index.name()) {
            return Err(CacheError::IndexExists { ty: ty.clone(), index: index.name().to_string() });
        }
        if store.len() > 0 {
            warn!(ty = %ty, index = index.name(), "index registered after first insert; existing resources not indexed");
        }
        store.indexes.push(IndexStore::new(index));
        Ok(())
    }

    pub fn add_query(&self, name: &str, query: Query) -> CacheResult<()> {
        let mut queries = self.queries.write();
        if queries.contains_key(name) {
            return Err(CacheError::Query { name: name.to_string(), source: anyhow::anyhow!("already registered") });
        }
        queries.insert(name.to_string(), query);
        Ok(())
    }

    /// Insert or replace `res`. All keys are extracted before anything is
    /// mutated, so an extraction error leaves the previous entry intact.
    pub fn insert(&self, res: Resource) -> CacheResult<()> {
        let mut types = self.types.write();
        let store = types.get_mut(&res.id.ty).ok_or_else(|| CacheError::TypeNotRegistered(res.id.ty.clone()))?;

        let keys = store.indexes.iter().map(|i| i.def.keys_for(&res)).collect::<CacheResult<Vec<_>>>()?;
        let ty_label = res.id.ty.to_string();
        let res = Arc::new(res);
        for (idx, keys) in store.indexes.iter_mut().zip(keys) {
            idx.insert(&res, keys);
        }
        metrics::counter!("cache_insert_total", 1u64, "type" => ty_label);
        Ok(())
    }

    /// Remove the resource and every index entry it contributed. Missing entries are a no-op.
    pub fn delete(&self, r: &impl Referent) -> CacheResult<()> {
        let mut types = self.types.write();
        let store = types.get_mut(r.ty()).ok_or_else(|| CacheError::TypeNotRegistered(r.ty().clone()))?;
        let reference = r.to_reference();
        for idx in store.indexes.iter_mut() {
            idx.remove(&reference);
        }
        debug!(reference = %reference, "cache delete");
        Ok(())
    }

    pub fn get(&self, ty: &Type, index: &str, args: &[Arg]) -> CacheResult<Option<Arc<Resource>>> {
        Ok(self.list(ty, index, args)?.into_iter().next())
    }

    pub fn list(&self, ty: &Type, index: &str, args: &[Arg]) -> CacheResult<Vec<Arc<Resource>>> {
        Ok(self.list_iterator(ty, index, args, ListOptions::default())?.collect())
    }

    pub fn list_prefix(&self, ty: &Type, index: &str, args: &[Arg]) -> CacheResult<Vec<Arc<Resource>>> {
        Ok(self.list_iterator(ty, index, args, ListOptions { prefix: true })?.collect())
    }

    /// A resource that contributed several keys under the same prefix is
    /// returned once per key.
    pub fn list_iterator(&self, ty: &Type, index: &str, args: &[Arg], opts: ListOptions) -> CacheResult<ResourceIterator> {
        let types = self.types.read();
        let store = types.get(ty).ok_or_else(|| CacheError::TypeNotRegistered(ty.clone()))?;
        let idx = store.index(ty, index)?;
        let key = idx.def.key_for_args(args)?;
        let items = if opts.prefix { idx.prefix(&strip_separator(key)) } else { idx.exact(&key) };
        Ok(ResourceIterator::new(items))
    }

    /// Resources of `ty` whose `index` key matches `child` or a separator-aligned
    /// prefix of it.
    pub fn parents(&self, ty: &Type, index: &str, child: &impl Referent) -> CacheResult<Vec<Arc<Resource>>> {
        Ok(self.parents_iterator(ty, index, child)?.collect())
    }

    pub fn parents_iterator(&self, ty: &Type, index: &str, child: &impl Referent) -> CacheResult<ResourceIterator> {
        let types = self.types.read();
        let store = types.get(ty).ok_or_else(|| CacheError::TypeNotRegistered(ty.clone()))?;
        let idx = store.index(ty, index)?;
        let key = idx.def.key_for_args(&[Arg::Ref(child.to_reference())])?;
        Ok(ResourceIterator::new(idx.parents(&key)))
    }

    pub fn query(&self, name: &str, args: &[Arg]) -> CacheResult<ResourceIterator> {
        let query = self.queries.read().get(name).cloned().ok_or_else(|| CacheError::QueryNotFound(name.to_string()))?;
        query(self, args).map_err(|e| CacheError::Query { name: name.to_string(), source: e })
    }

    /// Exact lookup by reference through the id index.
    pub fn read(&self, r: &impl Referent) -> CacheResult<Option<Arc<Resource>>> {
        self.get(r.ty(), ID_INDEX, &[Arg::Ref(r.to_reference())])
    }

    /// Resources of `ty` in `tenancy` (components may be [`WILDCARD`]) whose name
    /// starts with `name_prefix`, ordered by tenancy then name.
    pub fn list_tenancy(&self, ty: &Type, tenancy: &Tenancy, name_prefix: &str) -> CacheResult<Vec<Arc<Resource>>> {
        if !tenancy.is_wildcard() {
            return self.list_prefix(ty, ID_INDEX, &[Arg::Tenancy(tenancy.clone()), Arg::Str(name_prefix.to_string())]);
        }
        let types = self.types.read();
        let store = types.get(ty).ok_or_else(|| CacheError::TypeNotRegistered(ty.clone()))?;
        let mut prefix = Builder::new();
        if tenancy.partition != WILDCARD {
            prefix.string(&tenancy.partition);
        }
        Ok(store.indexes[0]
            .prefix(&prefix.into_bytes())
            .into_iter()
            .filter(|r| tenancy.matches(r.tenancy()) && r.name().starts_with(name_prefix))
            .collect())
    }

    pub fn len(&self, ty: &Type) -> usize {
        self.types.read().get(ty).map(TypeStore::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Id;

    const ARTIST: Type = Type::from_static("demo", "v2", "Artist");

    fn artist(t: &Tenancy, name: &str) -> Resource {
        Resource::new(Id::new(ARTIST, t.clone(), name), serde_json::json!({}))
    }

    #[test]
    fn insert_requires_registration() {
        let c = Cache::new();
        assert!(matches!(c.insert(artist(&Tenancy::default_namespace(), "a")), Err(CacheError::TypeNotRegistered(_))));
        c.add_type(&ARTIST);
        c.insert(artist(&Tenancy::default_namespace(), "a")).unwrap();
        assert_eq!(c.len(&ARTIST), 1);
    }

    #[test]
    fn prefix_listing_is_aligned() {
        let c = Cache::new();
        c.add_type(&ARTIST);
        let t = Tenancy::default_namespace();
        for n in ["api-1", "api-2", "apix", "web"] {
            c.insert(artist(&t, n)).unwrap();
        }
        let names = |v: Vec<Arc<Resource>>| v.iter().map(|r| r.id.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(c.list_tenancy(&ARTIST, &t, "api-").unwrap()), vec!["api-1", "api-2"]);
        assert_eq!(names(c.list_tenancy(&ARTIST, &t, "").unwrap()).len(), 4);

        // a namespace named "default2" must not leak into "default"
        c.insert(artist(&Tenancy::new("default", "default2"), "api-9")).unwrap();
        assert_eq!(c.list_tenancy(&ARTIST, &t, "api-").unwrap().len(), 2);
        assert_eq!(c.list_tenancy(&ARTIST, &Tenancy::new("default", WILDCARD), "api-").unwrap().len(), 3);
    }

    #[test]
    fn delete_missing_is_noop() {
        let c = Cache::new();
        c.add_type(&ARTIST);
        c.delete(&Id::new(ARTIST, Tenancy::default_namespace(), "ghost")).unwrap();
    }
}
