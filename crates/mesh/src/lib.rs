//! Weft mesh: computed routes as read by the mesh, and the per-identity
//! implicit destinations controller.

#![forbid(unsafe_code)]

pub mod implicit;
pub mod types;

pub use implicit::{
    implicit_destinations_controller, BOUND_IDENTITIES_INDEX, CID_BOUND_REFS_INDEX, IMPLICIT_DESTINATIONS_CONTROLLER,
    ROUTE_BACKENDS_INDEX,
};
pub use types::{
    ComputedImplicitDestinations, ComputedRoutes, ImplicitDestination, COMPUTED_IMPLICIT_DESTINATIONS_TYPE,
    COMPUTED_ROUTES_TYPE,
};

use weft_core::{Registration, Registry, Scope};

pub fn register_types(registry: &mut Registry) {
    registry.register(Registration::new(COMPUTED_ROUTES_TYPE, Scope::Namespace));
    registry.register(Registration::new(COMPUTED_IMPLICIT_DESTINATIONS_TYPE, Scope::Namespace));
}
