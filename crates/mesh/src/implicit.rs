//! Implicit destinations: for every workload identity, the services it may
//! reach without declaring them.
//!
//! An identity S may reach service X when some ComputedTrafficPermissions
//! allowing S belongs to an identity X's workloads run as, and X has
//! computed routes. Routes that list X as a backend make their own parent
//! service reachable too. Each hop is recorded as a bound reference on the
//! output, so edits that break the chain still reach the stale result.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use weft_auth::{
    allows, sources_allowing, source_indexes, ComputedTrafficPermissions, COMPUTED_TRAFFIC_PERMISSIONS_TYPE,
    WORKLOAD_IDENTITY_TYPE,
};
use weft_cache::{bound_refs_index, ref_index, Arg};
use weft_catalog::{bound_identities, bound_identities_index, Service, SERVICE_TYPE};
use weft_controller::{
    map_bound_refs, map_with_transform, multi_mapper, replace_type, transform, transform_chain, Controller,
    DependencyMapper, DependencyTransform, Reconciler, Runtime,
};
use weft_core::{
    equal_reference, BoundReferenceCollector, Reference, Referent, Request, Resource, Result, Tenancy, LOCAL_PEER,
    WILDCARD,
};

use crate::types::{
    ComputedImplicitDestinations, ComputedRoutes, ImplicitDestination, COMPUTED_IMPLICIT_DESTINATIONS_TYPE,
    COMPUTED_ROUTES_TYPE,
};

pub const IMPLICIT_DESTINATIONS_CONTROLLER: &str = "implicit-destinations";
pub const CID_BOUND_REFS_INDEX: &str = "bound-references";
/// Services keyed by the identities bound to them.
pub const BOUND_IDENTITIES_INDEX: &str = "bound-identities";
/// ComputedRoutes keyed by each backend they send to.
pub const ROUTE_BACKENDS_INDEX: &str = "backends";

/// With `default_allow`, identities whose permissions are all default let
/// every source in.
pub fn implicit_destinations_controller(default_allow: bool) -> Controller {
    let via = |chain: Vec<DependencyTransform>| -> DependencyMapper {
        multi_mapper(vec![
            map_with_transform(transform_chain(chain), replace_type(COMPUTED_IMPLICIT_DESTINATIONS_TYPE)),
            map_bound_refs(COMPUTED_IMPLICIT_DESTINATIONS_TYPE, CID_BOUND_REFS_INDEX),
        ])
    };

    Controller::new(IMPLICIT_DESTINATIONS_CONTROLLER, COMPUTED_IMPLICIT_DESTINATIONS_TYPE)
        .with_managed_indexes(vec![bound_refs_index::<ComputedImplicitDestinations>(CID_BOUND_REFS_INDEX)])
        .with_watch(WORKLOAD_IDENTITY_TYPE, replace_type(COMPUTED_IMPLICIT_DESTINATIONS_TYPE), vec![])
        .with_watch(COMPUTED_TRAFFIC_PERMISSIONS_TYPE, via(vec![ctp_to_sources(default_allow)]), source_indexes())
        .with_watch(
            SERVICE_TYPE,
            via(vec![service_to_ctps(), ctp_to_sources(default_allow)]),
            vec![bound_identities_index(BOUND_IDENTITIES_INDEX)],
        )
        .with_watch(
            COMPUTED_ROUTES_TYPE,
            via(vec![routes_to_services(), service_to_ctps(), ctp_to_sources(default_allow)]),
            vec![ref_index::<ComputedRoutes, _>(ROUTE_BACKENDS_INDEX, |dec| dec.data.backends.clone())],
        )
        .with_reconciler(ImplicitDestinations { default_allow })
}

/// Workload identities a CTP lets in.
fn ctp_to_sources(default_allow: bool) -> DependencyTransform {
    transform(move |rt, res| {
        let ctp = res.decode::<ComputedTrafficPermissions>()?;
        let mut scopes: Vec<(Tenancy, String)> = Vec::new();
        if default_allow && ctp.data.is_default {
            scopes.push((Tenancy::wildcard(), String::new()));
        }
        for src in ctp.data.allow_permissions.iter().flat_map(|p| &p.sources).filter(|s| s.peer == LOCAL_PEER) {
            let namespace = if src.namespace.is_empty() { WILDCARD } else { src.namespace.as_str() };
            scopes.push((Tenancy::new(src.partition.clone(), namespace), src.identity_name.clone()));
        }

        let mut out: BTreeMap<Reference, Arc<Resource>> = BTreeMap::new();
        for (tenancy, name) in scopes {
            for wi in rt.cache.list_tenancy(&WORKLOAD_IDENTITY_TYPE, &tenancy, &name)? {
                if allows(&ctp.data, &*wi, default_allow) {
                    out.entry(wi.to_reference()).or_insert(wi);
                }
            }
        }
        Ok(out.into_values().collect())
    })
}

/// CTPs of the identities bound to a service.
fn service_to_ctps() -> DependencyTransform {
    transform(|rt, svc| {
        let mut out = Vec::new();
        for identity in bound_identities(svc) {
            let r = Reference::new(COMPUTED_TRAFFIC_PERMISSIONS_TYPE, svc.tenancy().clone(), identity);
            if let Some(ctp) = rt.cache.read(&r)? {
                out.push(ctp);
            }
        }
        Ok(out)
    })
}

/// The service owning a set of routes, plus every service they route to.
fn routes_to_services() -> DependencyTransform {
    transform(|rt, res| {
        let routes = res.decode::<ComputedRoutes>()?;
        let mut out = Vec::new();
        if let Some(parent) = rt.cache.read(&weft_core::replace_type(&SERVICE_TYPE, res))? {
            out.push(parent);
        }
        for backend in routes.data.backends.iter().filter(|b| b.ty == SERVICE_TYPE) {
            if let Some(svc) = rt.cache.read(backend)? {
                out.push(svc);
            }
        }
        Ok(out)
    })
}

/// Routed ports of `svc`, leaving out its mesh port.
fn routed_ports(svc: &Resource, routes: &Resource) -> Result<Vec<String>> {
    let svc = svc.decode::<Service>()?;
    let routes = routes.decode::<ComputedRoutes>()?;
    Ok(routes.data.ports.into_iter().filter(|p| !svc.data.is_mesh_port(p)).collect())
}

struct ImplicitDestinations {
    default_allow: bool,
}

#[derive(Default)]
struct Destinations {
    ports: BTreeMap<Reference, BTreeSet<String>>,
    bound: BoundReferenceCollector,
}

impl Destinations {
    fn add(&mut self, svc: &Resource, ports: Vec<String>) {
        self.ports.entry(svc.to_reference()).or_default().extend(ports);
    }

    fn finish(self) -> ComputedImplicitDestinations {
        ComputedImplicitDestinations {
            destinations: self
                .ports
                .into_iter()
                .map(|(destination_ref, ports)| ImplicitDestination {
                    destination_ref,
                    destination_ports: ports.into_iter().collect(),
                })
                .collect(),
            bound_references: self.bound.list(),
        }
    }
}

impl ImplicitDestinations {
    fn collect(&self, rt: &Runtime, wi: &Resource) -> Result<Destinations> {
        let mut out = Destinations::default();
        for ctp in sources_allowing(&rt.cache, wi, self.default_allow)? {
            out.bound.add(&*ctp);
            for svc in rt.cache.list(&SERVICE_TYPE, BOUND_IDENTITIES_INDEX, &[Arg::Ref(ctp.to_reference())])? {
                out.bound.add(&*svc);
                let own_routes = weft_core::replace_type(&COMPUTED_ROUTES_TYPE, &*svc);
                let Some(routes) = rt.cache.read(&own_routes)? else {
                    debug!(service = %svc.id, "no computed routes yet, skipping");
                    continue;
                };
                out.bound.add(&*routes);
                out.add(&svc, routed_ports(&svc, &routes)?);

                // routes elsewhere that send to this service make their parent reachable too
                for parent_routes in rt.cache.list(&COMPUTED_ROUTES_TYPE, ROUTE_BACKENDS_INDEX, &[Arg::Ref(svc.to_reference())])? {
                    if equal_reference(&*parent_routes, &own_routes) {
                        continue;
                    }
                    out.bound.add(&*parent_routes);
                    let Some(parent) = rt.cache.read(&weft_core::replace_type(&SERVICE_TYPE, &*parent_routes))? else {
                        continue;
                    };
                    out.bound.add(&*parent);
                    out.add(&parent, routed_ports(&parent, &parent_routes)?);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Reconciler for ImplicitDestinations {
    async fn reconcile(&self, rt: &Runtime, req: &Request) -> Result<()> {
        let cid_id = weft_core::replace_type(&COMPUTED_IMPLICIT_DESTINATIONS_TYPE, &req.id);
        let Some(wi) = rt.cache.read(&weft_core::replace_type(&WORKLOAD_IDENTITY_TYPE, &req.id))? else {
            debug!(id = %cid_id, "workload identity gone, removing implicit destinations");
            return rt.client.delete(&cid_id).await;
        };

        let computed = self.collect(rt, &wi)?.finish();

        if let Some(existing) = rt.client.read(&cid_id).await? {
            let same_owner = existing.owner.as_ref().is_some_and(|o| o.uid == wi.id.uid);
            let same = existing.decode::<ComputedImplicitDestinations>().map(|d| d.data == computed).unwrap_or(false);
            if same && same_owner {
                return Ok(());
            }
        }

        debug!(
            id = %cid_id,
            destinations = computed.destinations.len(),
            bound = computed.bound_references.len(),
            "writing implicit destinations"
        );
        let res = Resource::from_payload(wi.tenancy().clone(), wi.name(), &computed)?.with_owner(wi.id.clone());
        rt.client.write(res).await?;
        metrics::counter!("mesh_cid_write_total", 1u64);
        Ok(())
    }
}
