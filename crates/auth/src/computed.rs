//! Computes one ComputedTrafficPermissions per WorkloadIdentity from every
//! TrafficPermissions naming it as destination and every namespace and
//! partition level permission covering it.

use async_trait::async_trait;
use tracing::{debug, warn};
use weft_cache::{bound_refs_index, decoded_single_index, Arg, Builder, Index};
use weft_controller::{
    map_bound_refs, map_decoded, map_tenancy, multi_mapper, replace_type, Controller, Reconciler, Runtime,
};
use weft_core::{BoundReferenceCollector, Id, Referent, Request, Resource, Result, Tenancy};

use crate::source::normalize_permission;
use crate::types::{
    Action, ComputedTrafficPermissions, NamespaceTrafficPermissions, PartitionTrafficPermissions, Permission,
    TrafficPermissions, COMPUTED_TRAFFIC_PERMISSIONS_TYPE, NAMESPACE_TRAFFIC_PERMISSIONS_TYPE,
    PARTITION_TRAFFIC_PERMISSIONS_TYPE, TRAFFIC_PERMISSIONS_TYPE, WORKLOAD_IDENTITY_TYPE,
};

pub const TRAFFIC_PERMISSIONS_CONTROLLER: &str = "traffic-permissions";
/// TrafficPermissions keyed by `(tenancy, destination identity)`.
pub const DESTINATION_INDEX: &str = "destination";
pub const CTP_BOUND_REFS_INDEX: &str = "bound-references";

pub fn traffic_permissions_controller() -> Controller {
    Controller::new(TRAFFIC_PERMISSIONS_CONTROLLER, COMPUTED_TRAFFIC_PERMISSIONS_TYPE)
        .with_managed_indexes(vec![bound_refs_index::<ComputedTrafficPermissions>(CTP_BOUND_REFS_INDEX)])
        .with_watch(WORKLOAD_IDENTITY_TYPE, replace_type(COMPUTED_TRAFFIC_PERMISSIONS_TYPE), vec![])
        .with_watch(
            TRAFFIC_PERMISSIONS_TYPE,
            // the new destination, plus whichever CTPs the previous version fed
            multi_mapper(vec![
                map_decoded::<TrafficPermissions, _>(|_, dec| Ok(destination_request(dec.resource.tenancy(), &dec.data))),
                map_bound_refs(COMPUTED_TRAFFIC_PERMISSIONS_TYPE, CTP_BOUND_REFS_INDEX),
            ]),
            vec![destination_index()],
        )
        .with_watch(
            NAMESPACE_TRAFFIC_PERMISSIONS_TYPE,
            map_tenancy(WORKLOAD_IDENTITY_TYPE, COMPUTED_TRAFFIC_PERMISSIONS_TYPE),
            vec![],
        )
        .with_watch(
            PARTITION_TRAFFIC_PERMISSIONS_TYPE,
            map_tenancy(WORKLOAD_IDENTITY_TYPE, COMPUTED_TRAFFIC_PERMISSIONS_TYPE),
            vec![],
        )
        .with_reconciler(ComputeTrafficPermissions)
}

fn destination_request(tenancy: &Tenancy, tp: &TrafficPermissions) -> Vec<Request> {
    if tp.destination.identity_name.is_empty() {
        return Vec::new();
    }
    let id = Id::new(COMPUTED_TRAFFIC_PERMISSIONS_TYPE, tenancy.clone(), tp.destination.identity_name.clone());
    vec![Request::new(id)]
}

fn destination_key(tenancy: &Tenancy, identity: &str) -> Vec<u8> {
    let mut b = Builder::new();
    b.tenancy(tenancy).string(identity);
    b.into_bytes()
}

pub fn destination_index() -> Index {
    decoded_single_index::<TrafficPermissions, _, _>(
        DESTINATION_INDEX,
        |args: &[Arg]| match args {
            [Arg::Ref(r)] => Ok(destination_key(&r.tenancy, &r.name)),
            _ => anyhow::bail!("expected a workload identity reference; got {:?}", args),
        },
        |dec| {
            let name = &dec.data.destination.identity_name;
            Ok((!name.is_empty()).then(|| destination_key(dec.resource.tenancy(), name)))
        },
    )
}

struct ComputeTrafficPermissions;

#[derive(Default)]
struct Collected {
    allow: Vec<Permission>,
    deny: Vec<Permission>,
    bound: BoundReferenceCollector,
}

impl Collected {
    fn add(&mut self, from: &Resource, action: Action, perms: &[Permission]) {
        self.bound.add(from);
        let target = match action {
            Action::Allow => &mut self.allow,
            Action::Deny => &mut self.deny,
            Action::Unspecified => {
                warn!(id = %from.id, "permissions without an action are ignored");
                return;
            }
        };
        target.extend(perms.iter().filter_map(|p| normalize_permission(p, from.tenancy())));
    }

    fn finish(mut self) -> ComputedTrafficPermissions {
        self.allow.sort();
        self.deny.sort();
        ComputedTrafficPermissions {
            is_default: self.allow.is_empty() && self.deny.is_empty(),
            allow_permissions: self.allow,
            deny_permissions: self.deny,
            bound_references: self.bound.list(),
        }
    }
}

#[async_trait]
impl Reconciler for ComputeTrafficPermissions {
    async fn reconcile(&self, rt: &Runtime, req: &Request) -> Result<()> {
        let ctp_id = weft_core::replace_type(&COMPUTED_TRAFFIC_PERMISSIONS_TYPE, &req.id);
        let Some(wi) = rt.cache.read(&weft_core::replace_type(&WORKLOAD_IDENTITY_TYPE, &req.id))? else {
            debug!(id = %ctp_id, "workload identity gone, removing computed permissions");
            return rt.client.delete(&ctp_id).await;
        };

        let mut collected = Collected::default();
        for tp in rt.cache.list(&TRAFFIC_PERMISSIONS_TYPE, DESTINATION_INDEX, &[Arg::Ref(wi.to_reference())])? {
            let dec = tp.decode::<TrafficPermissions>()?;
            collected.add(&tp, dec.data.action, &dec.data.permissions);
        }
        for ntp in rt.cache.list_tenancy(&NAMESPACE_TRAFFIC_PERMISSIONS_TYPE, wi.tenancy(), "")? {
            let dec = ntp.decode::<NamespaceTrafficPermissions>()?;
            collected.add(&ntp, dec.data.action, &dec.data.permissions);
        }
        let partition = Tenancy::partition(wi.tenancy().partition.clone());
        for ptp in rt.cache.list_tenancy(&PARTITION_TRAFFIC_PERMISSIONS_TYPE, &partition, "")? {
            let dec = ptp.decode::<PartitionTrafficPermissions>()?;
            collected.add(&ptp, dec.data.action, &dec.data.permissions);
        }
        let computed = collected.finish();

        if let Some(existing) = rt.client.read(&ctp_id).await? {
            let same_owner = existing.owner.as_ref().is_some_and(|o| o.uid == wi.id.uid);
            let same = existing.decode::<ComputedTrafficPermissions>().map(|d| d.data == computed).unwrap_or(false);
            if same && same_owner {
                return Ok(());
            }
        }

        debug!(
            id = %ctp_id,
            allow = computed.allow_permissions.len(),
            deny = computed.deny_permissions.len(),
            bound = computed.bound_references.len(),
            "writing computed traffic permissions"
        );
        let res = Resource::from_payload(wi.tenancy().clone(), wi.name(), &computed)?.with_owner(wi.id.clone());
        rt.client.write(res).await?;
        metrics::counter!("auth_ctp_write_total", 1u64, "default" => if computed.is_default { "true" } else { "false" });
        Ok(())
    }
}
