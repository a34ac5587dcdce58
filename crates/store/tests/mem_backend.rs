use weft_core::{Condition, ConditionState, Id, Registration, Registry, Resource, Scope, Status, Tenancy, Type, WatchEvent};
use weft_store::{Backend, MemBackend, StoreError};

const PARENT: Type = Type::from_static("demo", "v1", "Parent");
const CHILD: Type = Type::from_static("demo", "v1", "Child");
const GLOBAL: Type = Type::from_static("demo", "v1", "Global");

fn backend() -> MemBackend {
    let mut reg = Registry::new();
    reg.register(Registration::new(PARENT, Scope::Namespace));
    reg.register(Registration::new(CHILD, Scope::Namespace).with_validate(|r| {
        if r.owner.is_none() {
            return Err(weft_core::Error::Validation("child needs an owner".into()));
        }
        Ok(())
    }));
    reg.register(Registration::new(GLOBAL, Scope::Partition));
    MemBackend::new(reg)
}

fn parent(name: &str, v: i64) -> Resource {
    Resource::new(Id::new(PARENT, Tenancy::default_namespace(), name), serde_json::json!({ "v": v }))
}

#[tokio::test]
async fn versions_move_and_cas_guards_updates() {
    let b = backend();
    let created = b.write(parent("p", 1)).await.unwrap();
    assert!(!created.id.uid.is_empty());
    assert_eq!(created.generation, created.version);

    let mut stale = created.clone();
    stale.data = serde_json::json!({ "v": 2 });
    let updated = b.write(stale.clone()).await.unwrap();
    assert_ne!(updated.version, created.version);
    assert_eq!(updated.id.uid, created.id.uid);

    // stale version is rejected
    stale.data = serde_json::json!({ "v": 3 });
    let err = b.write(stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    // a version guard on something that does not exist is a conflict too
    let mut ghost = parent("ghost", 1);
    ghost.version = "99".into();
    assert!(matches!(b.write(ghost).await, Err(StoreError::Conflict { .. })));
}

#[tokio::test]
async fn status_survives_data_writes() {
    let b = backend();
    let created = b.write(parent("p", 1)).await.unwrap();
    let status = Status {
        observed_generation: created.generation.clone(),
        conditions: vec![Condition { kind: "Ready".into(), state: ConditionState::True, ..Default::default() }],
    };
    let with_status = b.write_status(&created.id, "demo/ready", status.clone()).await.unwrap();
    assert_eq!(with_status.generation, created.generation);

    let updated = b.write(parent("p", 2)).await.unwrap();
    assert_eq!(updated.status.get("demo/ready"), Some(&status));
    assert_ne!(updated.generation, created.generation);
}

#[tokio::test]
async fn delete_cascades_to_owned_resources() {
    let b = backend();
    let p = b.write(parent("p", 1)).await.unwrap();
    let child = Resource::new(Id::new(CHILD, Tenancy::default_namespace(), "c"), serde_json::json!({}))
        .with_owner(p.id.clone());
    b.write(child).await.unwrap();

    b.delete(&p.id).await.unwrap();
    let err = b.read(&Id::new(CHILD, Tenancy::default_namespace(), "c")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    // idempotent
    b.delete(&p.id).await.unwrap();
}

#[tokio::test]
async fn hooks_and_scope_apply_on_write() {
    let b = backend();
    let orphan = Resource::new(Id::new(CHILD, Tenancy::default_namespace(), "c"), serde_json::json!({}));
    assert!(matches!(b.write(orphan).await, Err(StoreError::Invalid(_))));

    let g = Resource::new(Id::new(GLOBAL, Tenancy::new("", "ns1"), "g"), serde_json::json!({}));
    let stored = b.write(g).await.unwrap();
    assert_eq!(stored.id.tenancy, Tenancy::partition("default"));
}

#[tokio::test]
async fn list_accepts_wildcards() {
    let b = backend();
    for (ns, name) in [("default", "a"), ("other", "b"), ("other", "c")] {
        let r = Resource::new(Id::new(PARENT, Tenancy::new("default", ns), name), serde_json::json!({}));
        b.write(r).await.unwrap();
    }
    assert_eq!(b.list(&PARENT, &Tenancy::wildcard(), "").await.unwrap().len(), 3);
    assert_eq!(b.list(&PARENT, &Tenancy::new("default", "other"), "").await.unwrap().len(), 2);
    assert_eq!(b.list(&PARENT, &Tenancy::new("default", "*"), "b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn watch_starts_with_snapshot_then_streams_changes() {
    let b = backend();
    b.write(parent("before", 1)).await.unwrap();
    let mut w = b.watch(&PARENT).unwrap();

    match w.next().await {
        Some(WatchEvent::Restarted(all)) => assert_eq!(all.len(), 1),
        other => panic!("unexpected first event: {other:?}"),
    }

    let after = b.write(parent("after", 1)).await.unwrap();
    match w.next().await {
        Some(WatchEvent::Upsert(r)) => assert_eq!(r.id, after.id),
        other => panic!("unexpected event: {other:?}"),
    }

    b.delete(&after.id).await.unwrap();
    assert!(matches!(w.next().await, Some(WatchEvent::Delete(_))));
}
