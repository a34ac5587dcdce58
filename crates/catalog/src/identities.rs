//! Service-identities controller: records on every Service the sorted set of
//! workload identities its selector currently reaches.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use weft_cache::{multi_index, Arg, Builder, Cache, Index, SelectionTracker};
use weft_controller::{map_selection_tracker, Controller, Reconciler, Runtime};
use weft_core::{
    Condition, ConditionState, Reference, Referent, Request, Resource, Result, Status, Tenancy, WorkloadSelector,
};

use crate::types::{Service, Workload, SERVICE_TYPE, WORKLOAD_TYPE};

pub const SERVICE_IDENTITIES_CONTROLLER: &str = "service-identities";
pub const STATUS_KEY: &str = "catalog/service-identities";
pub const BOUND_IDENTITIES_CONDITION: &str = "BoundIdentities";

pub fn service_identities_controller() -> Controller {
    let tracker = Arc::new(SelectionTracker::new());
    Controller::new(SERVICE_IDENTITIES_CONTROLLER, SERVICE_TYPE)
        .with_watch(WORKLOAD_TYPE, map_selection_tracker(Arc::clone(&tracker), SERVICE_TYPE), vec![])
        .with_reconciler(ServiceIdentities { tracker })
}

struct ServiceIdentities {
    tracker: Arc<SelectionTracker>,
}

#[async_trait]
impl Reconciler for ServiceIdentities {
    async fn reconcile(&self, rt: &Runtime, req: &Request) -> Result<()> {
        let Some(res) = rt.cache.read(&req.id)? else {
            debug!(id = %req.id, "service gone, untracking selector");
            self.tracker.untrack_id(&req.id);
            return Ok(());
        };
        let svc = res.decode::<Service>()?;
        self.tracker.track_id_for_selector(&res.id, &svc.data.workloads);

        let identities = resolve_identities(&rt.cache, res.tenancy(), &svc.data.workloads)?;
        let status = Status {
            observed_generation: res.generation.clone(),
            conditions: vec![bound_identities_condition(&identities)],
        };
        if res.status.get(STATUS_KEY) == Some(&status) {
            return Ok(());
        }
        debug!(id = %res.id, identities = identities.len(), "updating bound identities");
        rt.client.write_status(&res.id, STATUS_KEY, status).await?;
        Ok(())
    }
}

/// Identities of every cached workload `selector` reaches in `tenancy`,
/// sorted and de-duplicated. Selected names with no workload are skipped.
pub fn resolve_identities(cache: &Cache, tenancy: &Tenancy, selector: &WorkloadSelector) -> Result<Vec<String>> {
    let mut out = BTreeSet::new();
    let mut add = |res: &Resource| -> Result<()> {
        let w = res.decode::<Workload>()?;
        if !w.data.identity.is_empty() {
            out.insert(w.data.identity);
        }
        Ok(())
    };
    for name in &selector.names {
        if let Some(w) = cache.read(&Reference::new(WORKLOAD_TYPE, tenancy.clone(), name.clone()))? {
            add(&*w)?;
        }
    }
    for prefix in &selector.prefixes {
        for w in cache.list_tenancy(&WORKLOAD_TYPE, tenancy, prefix)? {
            add(&*w)?;
        }
    }
    Ok(out.into_iter().collect())
}

fn bound_identities_condition(identities: &[String]) -> Condition {
    if identities.is_empty() {
        return Condition {
            kind: BOUND_IDENTITIES_CONDITION.to_string(),
            state: ConditionState::False,
            reason: "NoIdentities".to_string(),
            message: String::new(),
        };
    }
    Condition {
        kind: BOUND_IDENTITIES_CONDITION.to_string(),
        state: ConditionState::True,
        reason: "IdentitiesFound".to_string(),
        message: identities.join(","),
    }
}

/// Identity names recorded on a Service by this controller.
pub fn bound_identities(svc: &Resource) -> Vec<String> {
    svc.status
        .get(STATUS_KEY)
        .and_then(|s| s.condition(BOUND_IDENTITIES_CONDITION))
        .filter(|c| c.state == ConditionState::True)
        .map(|c| c.message.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Services keyed by `(tenancy, identity)` for each bound identity. Queried
/// with any reference whose tenancy and name are the identity's, such as a
/// WorkloadIdentity or a resource name-aligned with one.
pub fn bound_identities_index(name: &str) -> Index {
    multi_index(
        name,
        |args: &[Arg]| match args {
            [Arg::Ref(r)] => Ok(identity_key(&r.tenancy, &r.name)),
            [Arg::Tenancy(t), Arg::Str(identity)] => Ok(identity_key(t, identity)),
            _ => anyhow::bail!("expected an identity reference; got {:?}", args),
        },
        |res: &Resource| {
            let ids = bound_identities(res);
            if ids.is_empty() {
                return Ok(None);
            }
            Ok(Some(ids.iter().map(|i| identity_key(res.tenancy(), i)).collect()))
        },
    )
}

fn identity_key(tenancy: &Tenancy, identity: &str) -> Vec<u8> {
    let mut b = Builder::new();
    b.tenancy(tenancy).string(identity);
    b.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Id;

    #[test]
    fn condition_round_trips_through_status() {
        let svc = Resource::new(Id::new(SERVICE_TYPE, Tenancy::default_namespace(), "api"), serde_json::json!({}))
            .with_status(
                STATUS_KEY,
                Status {
                    observed_generation: "1".into(),
                    conditions: vec![bound_identities_condition(&["wi1".into(), "wi2".into()])],
                },
            );
        assert_eq!(bound_identities(&svc), vec!["wi1", "wi2"]);

        let idx = bound_identities_index("bound-identities");
        let keys = idx.keys_for(&svc).unwrap();
        assert_eq!(keys.len(), 2);
        let wi = Reference::new(WORKLOAD_TYPE, Tenancy::default_namespace(), "wi2");
        assert_eq!(keys[1], idx.key_for_args(&[Arg::Ref(wi)]).unwrap());
    }

    #[test]
    fn no_identities_is_not_indexed() {
        let svc = Resource::new(Id::new(SERVICE_TYPE, Tenancy::default_namespace(), "api"), serde_json::json!({}))
            .with_status(STATUS_KEY, Status { observed_generation: String::new(), conditions: vec![bound_identities_condition(&[])] });
        assert!(bound_identities(&svc).is_empty());
        assert!(bound_identities_index("b").keys_for(&svc).unwrap().is_empty());
    }
}
