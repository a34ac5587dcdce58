//! Resource model: types, tenancy, references, ids and versioned resources.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Query-only sentinel meaning "any value" for a tenancy component or name.
pub const WILDCARD: &str = "*";
pub const DEFAULT_PARTITION: &str = "default";
pub const DEFAULT_NAMESPACE: &str = "default";
/// Peer name for resources that live in the local cluster.
pub const LOCAL_PEER: &str = "local";

/// Group/version/kind triple identifying a resource schema. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Type {
    pub group: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub kind: Cow<'static, str>,
}

impl Type {
    pub const fn from_static(group: &'static str, version: &'static str, kind: &'static str) -> Self {
        Self { group: Cow::Borrowed(group), version: Cow::Borrowed(version), kind: Cow::Borrowed(kind) }
    }

    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: Cow::Owned(group.into()),
            version: Cow::Owned(version.into()),
            kind: Cow::Owned(kind.into()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.kind)
    }
}

impl FromStr for Type {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Type::new(*group, *version, *kind))
            }
            _ => Err(Error::Other(anyhow::anyhow!("invalid type key: {} (expect group/version/Kind)", key))),
        }
    }
}

/// Tenancy scope of a resource. Either component may be [`WILDCARD`] in queries,
/// never on a stored resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tenancy {
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub namespace: String,
}

impl Tenancy {
    pub fn new(partition: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { partition: partition.into(), namespace: namespace.into() }
    }

    /// Partition-scoped tenancy (empty namespace).
    pub fn partition(partition: impl Into<String>) -> Self {
        Self { partition: partition.into(), namespace: String::new() }
    }

    /// `default.default`
    pub fn default_namespace() -> Self {
        Self::new(DEFAULT_PARTITION, DEFAULT_NAMESPACE)
    }

    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.partition == WILDCARD || self.namespace == WILDCARD
    }

    /// Does this (possibly wildcarded) query tenancy cover `other`?
    pub fn matches(&self, other: &Tenancy) -> bool {
        (self.partition == WILDCARD || self.partition == other.partition)
            && (self.namespace == WILDCARD || self.namespace == other.namespace)
    }
}

impl fmt::Display for Tenancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.partition, self.namespace)
    }
}

/// Anything that names a resource: a [`Reference`], an [`Id`] or a whole [`Resource`].
pub trait Referent {
    fn ty(&self) -> &Type;
    fn tenancy(&self) -> &Tenancy;
    fn name(&self) -> &str;

    fn to_reference(&self) -> Reference {
        Reference { ty: self.ty().clone(), tenancy: self.tenancy().clone(), name: self.name().to_string() }
    }

    fn is_type(&self, ty: &Type) -> bool {
        self.ty() == ty
    }
}

/// Stable, version-less pointer to a resource. Ordered by type, tenancy, then name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default)]
    pub tenancy: Tenancy,
    pub name: String,
}

impl Reference {
    pub fn new(ty: Type, tenancy: Tenancy, name: impl Into<String>) -> Self {
        Self { ty, tenancy, name: name.into() }
    }

    pub fn into_id(self) -> Id {
        Id { ty: self.ty, tenancy: self.tenancy, name: self.name, uid: String::new() }
    }
}

impl Referent for Reference {
    fn ty(&self) -> &Type { &self.ty }
    fn tenancy(&self) -> &Tenancy { &self.tenancy }
    fn name(&self) -> &str { &self.name }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.ty, self.tenancy, self.name)
    }
}

/// A reference plus the uid of one incarnation of the resource. An empty uid
/// matches any incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default)]
    pub tenancy: Tenancy,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

impl Id {
    pub fn new(ty: Type, tenancy: Tenancy, name: impl Into<String>) -> Self {
        Self { ty, tenancy, name: name.into(), uid: String::new() }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }
}

impl Referent for Id {
    fn ty(&self) -> &Type { &self.ty }
    fn tenancy(&self) -> &Tenancy { &self.tenancy }
    fn name(&self) -> &str { &self.name }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.ty, self.tenancy, self.name)?;
        if !self.uid.is_empty() {
            write!(f, "@{}", self.uid)?;
        }
        Ok(())
    }
}

impl From<Reference> for Id {
    fn from(r: Reference) -> Self { r.into_id() }
}

impl From<&Id> for Reference {
    fn from(id: &Id) -> Self { id.to_reference() }
}

/// Id of the same name and tenancy under another type. Used when a computed
/// resource is name-aligned with its input.
pub fn replace_type(ty: &Type, r: &impl Referent) -> Id {
    Id::new(ty.clone(), r.tenancy().clone(), r.name())
}

/// Reference equality ignoring uid.
pub fn equal_reference(a: &impl Referent, b: &impl Referent) -> bool {
    a.ty() == b.ty() && a.tenancy() == b.tenancy() && a.name() == b.name()
}

/// Ask a controller to reconcile the resource named by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub id: Id,
}

impl Request {
    pub fn new(id: Id) -> Self {
        Self { id }
    }
}

impl From<Id> for Request {
    fn from(id: Id) -> Self { Self { id } }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionState {
    #[default]
    Unknown,
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub state: ConditionState,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Status written by one controller under its own key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Status {
    #[serde(default)]
    pub observed_generation: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Status {
    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

/// Versioned record. `data` is the opaque payload; typed access goes through [`Decoded`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Id>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub generation: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, Status>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(id: Id, data: serde_json::Value) -> Self {
        Self {
            id,
            owner: None,
            version: String::new(),
            generation: String::new(),
            data,
            status: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Build an unsaved resource from a typed payload.
    pub fn from_payload<T: Payload>(tenancy: Tenancy, name: impl Into<String>, data: &T) -> Result<Self> {
        let value = serde_json::to_value(data).map_err(|e| Error::Decode { ty: T::resource_type(), source: e })?;
        Ok(Self::new(Id::new(T::resource_type(), tenancy, name), value))
    }

    pub fn with_owner(mut self, owner: Id) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_status(mut self, key: impl Into<String>, status: Status) -> Self {
        self.status.insert(key.into(), status);
        self
    }

    pub fn decode<T: Payload>(&self) -> Result<Decoded<T>> {
        Decoded::from_resource(self.clone())
    }
}

impl Referent for Resource {
    fn ty(&self) -> &Type { &self.id.ty }
    fn tenancy(&self) -> &Tenancy { &self.id.tenancy }
    fn name(&self) -> &str { &self.id.name }
}

/// Typed payload bound to one resource type.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn resource_type() -> Type;
}

/// A resource together with its decoded payload.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub resource: Resource,
    pub data: T,
}

impl<T: Payload> Decoded<T> {
    pub fn from_resource(resource: Resource) -> Result<Self> {
        let expected = T::resource_type();
        if resource.id.ty != expected {
            return Err(Error::InvalidType { expected, actual: resource.id.ty.clone() });
        }
        let data = serde_json::from_value(resource.data.clone())
            .map_err(|e| Error::Decode { ty: expected, source: e })?;
        Ok(Self { resource, data })
    }

    pub fn id(&self) -> &Id {
        &self.resource.id
    }
}

/// Change delivered by the storage watch. `Restarted` carries the full current
/// set of resources of the watched type and replaces whatever the consumer held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatchEvent {
    Upsert(Resource),
    Delete(Resource),
    Restarted(Vec<Resource>),
}

impl WatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Upsert(_) => "upsert",
            WatchEvent::Delete(_) => "delete",
            WatchEvent::Restarted(_) => "restarted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIST: Type = Type::from_static("demo", "v2", "Artist");

    #[test]
    fn type_parses_and_displays() {
        let t: Type = "demo/v2/Artist".parse().unwrap();
        assert_eq!(t, ARTIST);
        assert_eq!(t.to_string(), "demo/v2/Artist");
        assert!("v2/Artist".parse::<Type>().is_err());
    }

    #[test]
    fn references_order_by_type_then_tenancy_then_name() {
        let album = Type::from_static("demo", "v2", "Album");
        let mut refs = vec![
            Reference::new(ARTIST.clone(), Tenancy::default_namespace(), "b"),
            Reference::new(ARTIST.clone(), Tenancy::new("a", "a"), "z"),
            Reference::new(album.clone(), Tenancy::default_namespace(), "c"),
            Reference::new(ARTIST.clone(), Tenancy::default_namespace(), "a"),
        ];
        refs.sort();
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "z", "a", "b"]);
    }

    #[test]
    fn wildcard_tenancy_matches() {
        let t = Tenancy::new("p1", "ns1");
        assert!(Tenancy::wildcard().matches(&t));
        assert!(Tenancy::new("p1", WILDCARD).matches(&t));
        assert!(!Tenancy::new("p2", WILDCARD).matches(&t));
        assert!(Tenancy::new("p1", "ns1").matches(&t));
    }

    #[test]
    fn replace_type_drops_uid() {
        let id = Id::new(ARTIST.clone(), Tenancy::default_namespace(), "x").with_uid("123");
        let album = Type::from_static("demo", "v2", "Album");
        let out = replace_type(&album, &id);
        assert_eq!(out.ty, album);
        assert_eq!(out.name, "x");
        assert!(out.uid.is_empty());
        assert!(equal_reference(&id, &Id::new(ARTIST.clone(), Tenancy::default_namespace(), "x")));
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Artist { genre: String }

    impl Payload for Artist {
        fn resource_type() -> Type { ARTIST.clone() }
    }

    #[test]
    fn decode_checks_type_and_shape() {
        let res = Resource::from_payload(Tenancy::default_namespace(), "a", &Artist { genre: "jazz".into() }).unwrap();
        let dec = res.decode::<Artist>().unwrap();
        assert_eq!(dec.data.genre, "jazz");

        let mut wrong = res.clone();
        wrong.id.ty = Type::from_static("demo", "v2", "Album");
        assert!(matches!(wrong.decode::<Artist>(), Err(Error::InvalidType { .. })));

        let mut bad = res;
        bad.data = serde_json::json!({ "genre": 5 });
        assert!(matches!(bad.decode::<Artist>(), Err(Error::Decode { .. })));
    }
}
