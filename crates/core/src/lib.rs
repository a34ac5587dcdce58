//! Weft core types: resource model, bound references, selectors and errors.

#![forbid(unsafe_code)]

pub mod bound;
pub mod error;
pub mod registry;
pub mod resource;
pub mod selector;

pub use bound::{BoundReferenceCollector, BoundReferences};
pub use error::{requeue_after, Error, Result};
pub use registry::{Registration, Registry, Scope};
pub use resource::{
    equal_reference, replace_type, Condition, ConditionState, Decoded, Id, Payload, Reference,
    Referent, Request, Resource, Status, Tenancy, Type, WatchEvent, DEFAULT_NAMESPACE, DEFAULT_PARTITION, LOCAL_PEER,
    WILDCARD,
};
pub use selector::{SelectsWorkloads, WorkloadSelector};

pub mod prelude {
    pub use super::{
        replace_type, BoundReferenceCollector, Decoded, Error, Id, Payload, Reference, Referent, Request, Resource, Result,
        Tenancy, Type,
    };
}
