//! Weft auth: workload identities, traffic permissions at identity,
//! namespace and partition level, and the computed per-identity view
//! that the mesh consumes.

#![forbid(unsafe_code)]

pub mod computed;
pub mod source;
pub mod types;

pub use computed::{
    destination_index, traffic_permissions_controller, CTP_BOUND_REFS_INDEX, DESTINATION_INDEX,
    TRAFFIC_PERMISSIONS_CONTROLLER,
};
pub use source::{
    allows, normalize_permission, normalize_source, source_indexes, source_matches, sources_allowing,
    ALLOW_SOURCE_EXACT_INDEX, ALLOW_SOURCE_WILDCARD_ALL_INDEX, ALLOW_SOURCE_WILDCARD_NAMESPACE_INDEX,
    ALLOW_SOURCE_WILDCARD_NAME_INDEX,
};
pub use types::*;

use weft_core::{Registration, Registry, Scope};

pub fn register_types(registry: &mut Registry) {
    registry.register(Registration::new(WORKLOAD_IDENTITY_TYPE, Scope::Namespace));
    registry.register(
        Registration::new(TRAFFIC_PERMISSIONS_TYPE, Scope::Namespace)
            .with_validate(types::validate_traffic_permissions),
    );
    registry.register(
        Registration::new(NAMESPACE_TRAFFIC_PERMISSIONS_TYPE, Scope::Namespace)
            .with_validate(types::validate_namespace_traffic_permissions),
    );
    registry.register(
        Registration::new(PARTITION_TRAFFIC_PERMISSIONS_TYPE, Scope::Partition)
            .with_validate(types::validate_partition_traffic_permissions),
    );
    registry.register(Registration::new(COMPUTED_TRAFFIC_PERMISSIONS_TYPE, Scope::Namespace));
}
