//! Index definitions and the byte-key encoding shared by insert and query paths.
//!
//! Every index owns two extraction functions: one turning a stored resource into
//! zero or more keys, one turning query arguments into a key. Both must produce
//! byte-identical keys for logically equal inputs, so both are written against
//! the same [`Builder`].

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use weft_core::{Id, Reference, Referent, Resource, Tenancy};

use crate::error::{CacheError, CacheResult};

/// Terminates every component so that "ab"+"c" and "a"+"bc" never collide.
pub const SEPARATOR: u8 = 0x00;

/// Keys a single resource contributes to one index.
pub type IndexKeys = SmallVec<[Vec<u8>; 1]>;

/// Incremental key encoder.
#[derive(Debug, Default, Clone)]
pub struct Builder {
    buf: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string component followed by the separator.
    pub fn string(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(SEPARATOR);
        self
    }

    pub fn tenancy(&mut self, t: &Tenancy) -> &mut Self {
        self.string(&t.partition).string(&t.namespace)
    }

    /// group, version, kind, partition, namespace, name
    pub fn reference(&mut self, r: &impl Referent) -> &mut Self {
        let ty = r.ty();
        self.string(&ty.group).string(&ty.version).string(&ty.kind).tenancy(r.tenancy()).string(r.name())
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Key for a full reference (type included). Uid is never part of the key.
pub fn reference_key(r: &impl Referent) -> Vec<u8> {
    let mut b = Builder::new();
    b.reference(r);
    b.into_bytes()
}

/// Byte-align a key for prefix matching by dropping one trailing separator.
pub fn strip_separator(mut key: Vec<u8>) -> Vec<u8> {
    if key.last() == Some(&SEPARATOR) {
        key.pop();
    }
    key
}

/// One query argument. Indexes decide which shapes they accept.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Ref(Reference),
    Tenancy(Tenancy),
    Bytes(Vec<u8>),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self { Arg::Str(s.to_string()) }
}

impl From<String> for Arg {
    fn from(s: String) -> Self { Arg::Str(s) }
}

impl From<Reference> for Arg {
    fn from(r: Reference) -> Self { Arg::Ref(r) }
}

impl From<&Reference> for Arg {
    fn from(r: &Reference) -> Self { Arg::Ref(r.clone()) }
}

impl From<&Id> for Arg {
    fn from(id: &Id) -> Self { Arg::Ref(id.to_reference()) }
}

impl From<&Resource> for Arg {
    fn from(r: &Resource) -> Self { Arg::Ref(r.to_reference()) }
}

impl From<Tenancy> for Arg {
    fn from(t: Tenancy) -> Self { Arg::Tenancy(t) }
}

impl From<&Tenancy> for Arg {
    fn from(t: &Tenancy) -> Self { Arg::Tenancy(t.clone()) }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self { Arg::Bytes(b) }
}

/// Insert-time extraction. `Ok(None)` means "not indexable" and is distinct from
/// `Ok(Some(empty))` (indexable, no keys) only in intent; neither fails the insert.
pub type FromResourceFn = Arc<dyn Fn(&Resource) -> anyhow::Result<Option<IndexKeys>> + Send + Sync>;

/// Query-time extraction.
pub type FromArgsFn = Arc<dyn Fn(&[Arg]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// A named index definition. Storage lives in the cache.
#[derive(Clone)]
pub struct Index {
    name: String,
    from_resource: FromResourceFn,
    from_args: FromArgsFn,
}

impl Index {
    pub fn new(name: impl Into<String>, from_args: FromArgsFn, from_resource: FromResourceFn) -> Self {
        Self { name: name.into(), from_resource, from_args }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys for `res`, de-duplicated. Empty when the resource is not indexable.
    pub fn keys_for(&self, res: &Resource) -> CacheResult<IndexKeys> {
        let extracted = (self.from_resource)(res)
            .map_err(|e| CacheError::Extract { index: self.name.clone(), source: e })?;
        let mut keys = extracted.unwrap_or_default();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub fn key_for_args(&self, args: &[Arg]) -> CacheResult<Vec<u8>> {
        (self.from_args)(args).map_err(|e| CacheError::QueryArgs { index: self.name.clone(), message: e.to_string() })
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Type;

    #[test]
    fn reference_key_ignores_uid_and_is_component_safe() {
        let ty = Type::from_static("demo", "v2", "Artist");
        let a = Id::new(ty.clone(), Tenancy::default_namespace(), "ab").with_uid("1");
        let b = Reference::new(ty.clone(), Tenancy::default_namespace(), "ab");
        assert_eq!(reference_key(&a), reference_key(&b));

        let mut x = Builder::new();
        x.string("ab").string("c");
        let mut y = Builder::new();
        y.string("a").string("bc");
        assert_ne!(x.bytes(), y.bytes());
    }

    #[test]
    fn strip_separator_only_removes_one() {
        assert_eq!(strip_separator(vec![b'a', 0, 0]), vec![b'a', 0]);
        assert_eq!(strip_separator(vec![b'a']), vec![b'a']);
    }
}
