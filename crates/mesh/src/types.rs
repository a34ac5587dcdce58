use serde::{Deserialize, Serialize};
use weft_core::{BoundReferences, Payload, Reference, Type};

pub const COMPUTED_ROUTES_TYPE: Type = Type::from_static("mesh", "v2beta1", "ComputedRoutes");
pub const COMPUTED_IMPLICIT_DESTINATIONS_TYPE: Type =
    Type::from_static("mesh", "v2beta1", "ComputedImplicitDestinations");

/// Routing summary for one Service, name-aligned with it. Produced by the
/// routes controller; read here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedRoutes {
    /// Ports that carry routes.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Services traffic may be sent to through these routes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<Reference>,
}

impl Payload for ComputedRoutes {
    fn resource_type() -> Type { COMPUTED_ROUTES_TYPE }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicitDestination {
    pub destination_ref: Reference,
    #[serde(default)]
    pub destination_ports: Vec<String>,
}

/// Every service a workload identity may reach, name-aligned with and owned
/// by that identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedImplicitDestinations {
    #[serde(default)]
    pub destinations: Vec<ImplicitDestination>,
    #[serde(default)]
    pub bound_references: Vec<Reference>,
}

impl Payload for ComputedImplicitDestinations {
    fn resource_type() -> Type { COMPUTED_IMPLICIT_DESTINATIONS_TYPE }
}

impl BoundReferences for ComputedImplicitDestinations {
    fn bound_references(&self) -> &[Reference] { &self.bound_references }
}
