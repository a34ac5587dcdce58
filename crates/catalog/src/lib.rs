//! Weft catalog: workloads, the services that select them, and the
//! controller that records which identities each service reaches.

#![forbid(unsafe_code)]

pub mod identities;
pub mod types;

pub use identities::{
    bound_identities, bound_identities_index, resolve_identities, service_identities_controller,
    BOUND_IDENTITIES_CONDITION, SERVICE_IDENTITIES_CONTROLLER, STATUS_KEY,
};
pub use types::{Protocol, Service, ServicePort, Workload, SERVICE_TYPE, WORKLOAD_TYPE};

use weft_core::{Registration, Registry, Scope};

pub fn register_types(registry: &mut Registry) {
    registry.register(Registration::new(WORKLOAD_TYPE, Scope::Namespace).with_validate(types::validate_workload));
    registry.register(
        Registration::new(SERVICE_TYPE, Scope::Namespace)
            .with_mutate(types::mutate_service)
            .with_validate(types::validate_service),
    );
}
