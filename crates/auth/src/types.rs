use serde::{Deserialize, Serialize};
use weft_core::{BoundReferences, Error, Payload, Reference, Resource, Result, Type};

pub const WORKLOAD_IDENTITY_TYPE: Type = Type::from_static("auth", "v2beta1", "WorkloadIdentity");
pub const TRAFFIC_PERMISSIONS_TYPE: Type = Type::from_static("auth", "v2beta1", "TrafficPermissions");
pub const NAMESPACE_TRAFFIC_PERMISSIONS_TYPE: Type =
    Type::from_static("auth", "v2beta1", "NamespaceTrafficPermissions");
pub const PARTITION_TRAFFIC_PERMISSIONS_TYPE: Type =
    Type::from_static("auth", "v2beta1", "PartitionTrafficPermissions");
pub const COMPUTED_TRAFFIC_PERMISSIONS_TYPE: Type =
    Type::from_static("auth", "v2beta1", "ComputedTrafficPermissions");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentity {}

impl Payload for WorkloadIdentity {
    fn resource_type() -> Type { WORKLOAD_IDENTITY_TYPE }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Unspecified,
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub identity_name: String,
}

/// Who a permission applies to. Empty identity, namespace or partition widen
/// the match; see [`crate::source`] for how empties are filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sameness_group: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<ExcludeSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExcludeSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sameness_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_exact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_rules: Vec<DestinationRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficPermissions {
    pub destination: Destination,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Payload for TrafficPermissions {
    fn resource_type() -> Type { TRAFFIC_PERMISSIONS_TYPE }
}

/// Applies to every identity in its namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceTrafficPermissions {
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Payload for NamespaceTrafficPermissions {
    fn resource_type() -> Type { NAMESPACE_TRAFFIC_PERMISSIONS_TYPE }
}

/// Applies to every identity in its partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTrafficPermissions {
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Payload for PartitionTrafficPermissions {
    fn resource_type() -> Type { PARTITION_TRAFFIC_PERMISSIONS_TYPE }
}

/// Everything that applies to one WorkloadIdentity, name-aligned with and
/// owned by it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedTrafficPermissions {
    #[serde(default)]
    pub allow_permissions: Vec<Permission>,
    #[serde(default)]
    pub deny_permissions: Vec<Permission>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub bound_references: Vec<Reference>,
}

impl Payload for ComputedTrafficPermissions {
    fn resource_type() -> Type { COMPUTED_TRAFFIC_PERMISSIONS_TYPE }
}

impl BoundReferences for ComputedTrafficPermissions {
    fn bound_references(&self) -> &[Reference] { &self.bound_references }
}

fn validate_action(res: &Resource, action: Action) -> Result<()> {
    if action == Action::Unspecified {
        return Err(Error::Validation(format!("{}: action must be allow or deny", res.id)));
    }
    Ok(())
}

pub(crate) fn validate_traffic_permissions(res: &Resource) -> Result<()> {
    let tp = res.decode::<TrafficPermissions>()?;
    if tp.data.destination.identity_name.is_empty() {
        return Err(Error::Validation(format!("{}: destination identity is required", res.id)));
    }
    validate_action(res, tp.data.action)
}

pub(crate) fn validate_namespace_traffic_permissions(res: &Resource) -> Result<()> {
    validate_action(res, res.decode::<NamespaceTrafficPermissions>()?.data.action)
}

pub(crate) fn validate_partition_traffic_permissions(res: &Resource) -> Result<()> {
    validate_action(res, res.decode::<PartitionTrafficPermissions>()?.data.action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Tenancy;

    #[test]
    fn traffic_permissions_need_destination_and_action() {
        let t = Tenancy::default_namespace();
        let ok = TrafficPermissions {
            destination: Destination { identity_name: "api".into() },
            action: Action::Allow,
            permissions: vec![],
        };
        assert!(validate_traffic_permissions(&Resource::from_payload(t.clone(), "tp", &ok).unwrap()).is_ok());

        let no_action = TrafficPermissions { action: Action::Unspecified, ..ok.clone() };
        let res = Resource::from_payload(t.clone(), "tp", &no_action).unwrap();
        assert!(matches!(validate_traffic_permissions(&res), Err(Error::Validation(_))));

        let no_dest = TrafficPermissions { destination: Destination::default(), ..ok };
        let res = Resource::from_payload(t, "tp", &no_dest).unwrap();
        assert!(matches!(validate_traffic_permissions(&res), Err(Error::Validation(_))));
    }
}
