use std::sync::Arc;

use pretty_assertions::assert_eq;
use weft_catalog::{
    bound_identities, register_types, service_identities_controller, Service, ServicePort, Workload, Protocol,
    SERVICE_TYPE,
};
use weft_controller::TestController;
use weft_core::{Id, Registry, Resource, Tenancy, WorkloadSelector};
use weft_store::{Backend, MemBackend};

fn ns() -> Tenancy {
    Tenancy::default_namespace()
}

fn setup() -> (Arc<MemBackend>, TestController) {
    let mut registry = Registry::new();
    register_types(&mut registry);
    let backend = Arc::new(MemBackend::new(registry));
    let tc = TestController::new(service_identities_controller(), backend.clone());
    (backend, tc)
}

fn workload(name: &str, identity: &str) -> Resource {
    Resource::from_payload(ns(), name, &Workload { identity: identity.into(), ports: vec!["http".into()] }).unwrap()
}

fn service(name: &str, selector: WorkloadSelector) -> Resource {
    let svc = Service {
        workloads: selector,
        ports: vec![ServicePort { target_port: "http".into(), protocol: Protocol::Http }],
    };
    Resource::from_payload(ns(), name, &svc).unwrap()
}

fn svc_id(name: &str) -> Id {
    Id::new(SERVICE_TYPE, ns(), name)
}

async fn identities(backend: &MemBackend, name: &str) -> Vec<String> {
    bound_identities(&backend.read(&svc_id(name)).await.unwrap())
}

#[tokio::test]
async fn records_sorted_identities_of_selected_workloads() {
    let (backend, tc) = setup();
    for (name, identity) in [("foo", "wi2"), ("api-1", "wi1"), ("api-2", "wi2"), ("bar", "wi3")] {
        backend.write(workload(name, identity)).await.unwrap();
    }
    backend
        .write(service("api", WorkloadSelector::names(["foo", "missing"]).with_prefixes(["api-"])))
        .await
        .unwrap();

    tc.reconcile(&svc_id("api")).await.unwrap();
    assert_eq!(identities(&backend, "api").await, vec!["wi1", "wi2"]);

    // nothing changed: no further write
    let writes = backend.write_count();
    tc.reconcile(&svc_id("api")).await.unwrap();
    assert_eq!(backend.write_count(), writes);
}

#[tokio::test]
async fn workload_changes_reach_selecting_services() {
    let (backend, tc) = setup();
    backend.write(workload("api-1", "wi1")).await.unwrap();
    backend.write(service("api", WorkloadSelector::default().with_prefixes(["api-"]))).await.unwrap();
    backend.write(service("other", WorkloadSelector::names(["web"]))).await.unwrap();
    tc.reconcile(&svc_id("api")).await.unwrap();
    tc.reconcile(&svc_id("other")).await.unwrap();
    assert!(identities(&backend, "other").await.is_empty());

    let moved = backend.write(workload("api-1", "wi9")).await.unwrap();
    let reqs = tc.map(&moved).await.unwrap();
    assert_eq!(reqs.iter().map(|r| r.id.name.as_str()).collect::<Vec<_>>(), vec!["api"]);
    tc.reconcile_mapped(&moved).await.unwrap();
    assert_eq!(identities(&backend, "api").await, vec!["wi9"]);

    // a workload that appears later is picked up through the tracked name
    let web = backend.write(workload("web", "wi4")).await.unwrap();
    tc.reconcile_mapped(&web).await.unwrap();
    assert_eq!(identities(&backend, "other").await, vec!["wi4"]);
}

#[tokio::test]
async fn deleted_service_stops_being_tracked() {
    let (backend, tc) = setup();
    let w = backend.write(workload("foo", "wi1")).await.unwrap();
    backend.write(service("api", WorkloadSelector::names(["foo"]))).await.unwrap();
    tc.reconcile(&svc_id("api")).await.unwrap();
    assert_eq!(tc.map(&w).await.unwrap().len(), 1);

    backend.delete(&svc_id("api")).await.unwrap();
    tc.reconcile(&svc_id("api")).await.unwrap();
    assert!(tc.map(&w).await.unwrap().is_empty());
}

#[tokio::test]
async fn selector_edit_replaces_tracked_names() {
    let (backend, tc) = setup();
    let foo = backend.write(workload("foo", "wi1")).await.unwrap();
    let bar = backend.write(workload("bar", "wi2")).await.unwrap();
    backend.write(service("api", WorkloadSelector::names(["foo"]))).await.unwrap();
    tc.reconcile(&svc_id("api")).await.unwrap();

    backend.write(service("api", WorkloadSelector::names(["bar"]))).await.unwrap();
    tc.reconcile(&svc_id("api")).await.unwrap();
    assert_eq!(identities(&backend, "api").await, vec!["wi2"]);
    assert!(tc.map(&foo).await.unwrap().is_empty());
    assert_eq!(tc.map(&bar).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stored_service_selector_is_sorted_and_deduplicated() {
    let (backend, _) = setup();
    let stored = backend
        .write(service("api", WorkloadSelector::names(["web", "api", "web"]).with_prefixes(["z-", "a-"])))
        .await
        .unwrap();
    let selector = stored.decode::<Service>().unwrap().data.workloads;
    assert_eq!(selector.names, vec!["api", "web"]);
    assert_eq!(selector.prefixes, vec!["a-", "z-"]);
}
