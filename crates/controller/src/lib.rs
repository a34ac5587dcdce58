//! Weft controller runtime.
//!
//! A [`Controller`] binds a reconciler to a managed type and to watches on
//! other types; the [`Manager`] feeds storage changes through the cache and
//! each controller's dependency mappers into a coalescing work queue, and
//! runs reconciles with backoff, timeouts and leader gating.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod controller;
pub mod dependency;
pub mod manager;
pub mod queue;
pub mod runtime;
pub mod testing;

pub use backoff::Backoff;
pub use controller::{Controller, Hook, Initializer, Placement, Reconciler, Watch};
pub use dependency::{
    dedupe, map_bound_refs, map_decoded, map_owner, map_owner_filtered, map_selection_tracker, map_selector,
    map_tenancy, map_with_transform, mapper, multi_mapper, replace_type, transform, transform_chain, transform_list,
    transform_parents, transform_refs, wrap_and_replace_type, DependencyMapper, DependencyTransform,
};
pub use manager::{LeaderHandle, Manager, ManagerConfig};
pub use queue::WorkQueue;
pub use runtime::{Client, Runtime};
pub use testing::TestController;
