use serde::{Deserialize, Serialize};
use weft_core::{Error, Payload, Resource, Result, SelectsWorkloads, Type, WorkloadSelector};

pub const WORKLOAD_TYPE: Type = Type::from_static("catalog", "v2beta1", "Workload");
pub const SERVICE_TYPE: Type = Type::from_static("catalog", "v2beta1", "Service");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Name of the WorkloadIdentity this workload runs as.
    #[serde(default)]
    pub identity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

impl Payload for Workload {
    fn resource_type() -> Type { WORKLOAD_TYPE }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Http,
    Http2,
    Grpc,
    /// The sidecar-to-sidecar port. Never a routable destination.
    Mesh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub target_port: String,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub workloads: WorkloadSelector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn is_mesh_port(&self, port: &str) -> bool {
        self.ports.iter().any(|p| p.target_port == port && p.protocol == Protocol::Mesh)
    }
}

impl Payload for Service {
    fn resource_type() -> Type { SERVICE_TYPE }
}

impl SelectsWorkloads for Service {
    fn workload_selector(&self) -> Option<&WorkloadSelector> {
        Some(&self.workloads)
    }
}

/// Sorts and dedups the service's workload selector so equivalent selectors
/// store identically.
pub(crate) fn mutate_service(res: &mut Resource) -> Result<()> {
    let mut svc = res.decode::<Service>()?.data;
    for list in [&mut svc.workloads.names, &mut svc.workloads.prefixes] {
        list.sort();
        list.dedup();
    }
    res.data = serde_json::to_value(&svc).map_err(|e| Error::Decode { ty: SERVICE_TYPE, source: e })?;
    Ok(())
}

pub(crate) fn validate_workload(res: &Resource) -> Result<()> {
    let w = res.decode::<Workload>()?;
    if w.data.identity.is_empty() {
        return Err(Error::Validation(format!("workload {} has no identity", res.id)));
    }
    Ok(())
}

pub(crate) fn validate_service(res: &Resource) -> Result<()> {
    let svc = res.decode::<Service>()?;
    let mut seen = std::collections::BTreeSet::new();
    for p in &svc.data.ports {
        if !seen.insert(p.target_port.as_str()) {
            return Err(Error::Validation(format!("service {} declares port {:?} twice", res.id, p.target_port)));
        }
    }
    Ok(())
}
