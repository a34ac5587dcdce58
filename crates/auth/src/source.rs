//! Source normalisation and the layered source indexes over computed
//! traffic permissions.
//!
//! A source identity is allowed by a ComputedTrafficPermissions through one
//! of four layers, from most to least specific:
//!
//! 1. `allow-source-exact`: an allow source naming the identity.
//! 2. `allow-source-wildcard-name`: an allow source naming its namespace.
//! 3. `allow-source-wildcard-namespace`: an allow source naming its partition.
//! 4. `allow-source-wildcard-all`: a default CTP, which allows everyone when
//!    the mesh runs in default-allow mode.
//!
//! Every layer is keyed by `(partition, namespace, name)` with `*` in the
//! positions the layer does not constrain.

use std::collections::BTreeMap;
use std::sync::Arc;

use weft_cache::{decoded_multi_index, Arg, Builder, Cache, Index};
use weft_core::{Decoded, Reference, Referent, Resource, Result, Tenancy, DEFAULT_NAMESPACE, DEFAULT_PARTITION, LOCAL_PEER, WILDCARD};

use crate::types::{ComputedTrafficPermissions, ExcludeSource, Permission, Source, COMPUTED_TRAFFIC_PERMISSIONS_TYPE};

pub const ALLOW_SOURCE_EXACT_INDEX: &str = "allow-source-exact";
pub const ALLOW_SOURCE_WILDCARD_NAME_INDEX: &str = "allow-source-wildcard-name";
pub const ALLOW_SOURCE_WILDCARD_NAMESPACE_INDEX: &str = "allow-source-wildcard-namespace";
pub const ALLOW_SOURCE_WILDCARD_ALL_INDEX: &str = "allow-source-wildcard-all";

/// Fill the empty parts of `src` from the tenancy of the resource that
/// declared it. Sources mixing a peer with a sameness group are not
/// meaningful and yield `None`.
pub fn normalize_source(src: &Source, owner: &Tenancy) -> Option<Source> {
    if !src.peer.is_empty() && !src.sameness_group.is_empty() {
        return None;
    }
    let mut out = src.clone();
    fill_tenancy(&out.identity_name, &mut out.namespace, &mut out.partition, owner);
    fill_peer(&mut out.peer, &out.sameness_group);
    out.exclude = src
        .exclude
        .iter()
        .filter(|e| e.peer.is_empty() || e.sameness_group.is_empty())
        .map(|e| {
            let mut e = e.clone();
            fill_tenancy(&e.identity_name, &mut e.namespace, &mut e.partition, owner);
            fill_peer(&mut e.peer, &e.sameness_group);
            e
        })
        .collect();
    out.exclude.sort();
    Some(out)
}

/// Normalise every source of `perm`. A permission whose sources were all
/// dropped is dropped with them.
pub fn normalize_permission(perm: &Permission, owner: &Tenancy) -> Option<Permission> {
    let sources: Vec<Source> = perm.sources.iter().filter_map(|s| normalize_source(s, owner)).collect();
    if sources.is_empty() && !perm.sources.is_empty() {
        return None;
    }
    let mut out = Permission { sources, destination_rules: perm.destination_rules.clone() };
    out.sources.sort();
    Some(out)
}

fn fill_tenancy(identity: &str, namespace: &mut String, partition: &mut String, owner: &Tenancy) {
    let foreign = !partition.is_empty() && *partition != owner.partition;
    if namespace.is_empty() && (!identity.is_empty() || (partition.is_empty() && !owner.namespace.is_empty())) {
        *namespace = if foreign || owner.namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            owner.namespace.clone()
        };
    }
    if partition.is_empty() {
        *partition = if owner.partition.is_empty() { DEFAULT_PARTITION.to_string() } else { owner.partition.clone() };
    }
}

fn fill_peer(peer: &mut String, sameness_group: &str) {
    if peer.is_empty() && sameness_group.is_empty() {
        *peer = LOCAL_PEER.to_string();
    }
}

fn covers(identity: &str, namespace: &str, partition: &str, peer: &str, target: &impl Referent) -> bool {
    peer == LOCAL_PEER
        && partition == target.tenancy().partition
        && (namespace.is_empty() || namespace == target.tenancy().namespace)
        && (identity.is_empty() || identity == target.name())
}

fn excluded(e: &ExcludeSource, target: &impl Referent) -> bool {
    covers(&e.identity_name, &e.namespace, &e.partition, &e.peer, target)
}

/// Does a normalised source match the identity `target`, exclusions included?
pub fn source_matches(src: &Source, target: &impl Referent) -> bool {
    covers(&src.identity_name, &src.namespace, &src.partition, &src.peer, target)
        && !src.exclude.iter().any(|e| excluded(e, target))
}

fn any_match(perms: &[Permission], target: &impl Referent) -> bool {
    perms.iter().flat_map(|p| &p.sources).any(|s| source_matches(s, target))
}

/// Does `ctp` let `source` in? An explicit deny wins over any allow; a
/// default CTP allows everyone only in default-allow mode.
pub fn allows(ctp: &ComputedTrafficPermissions, source: &impl Referent, default_allow: bool) -> bool {
    if any_match(&ctp.deny_permissions, source) {
        return false;
    }
    (default_allow && ctp.is_default) || any_match(&ctp.allow_permissions, source)
}

#[derive(Debug, Clone, Copy)]
enum Layer {
    Exact,
    WildcardName,
    WildcardNamespace,
    WildcardAll,
}

fn source_key(partition: &str, namespace: &str, name: &str) -> Vec<u8> {
    let mut b = Builder::new();
    b.string(partition).string(namespace).string(name);
    b.into_bytes()
}

fn source_key_from_args(args: &[Arg]) -> anyhow::Result<Vec<u8>> {
    match args {
        [Arg::Str(p), Arg::Str(ns), Arg::Str(name)] => Ok(source_key(p, ns, name)),
        [Arg::Ref(r)] => Ok(source_key(&r.tenancy.partition, &r.tenancy.namespace, &r.name)),
        _ => anyhow::bail!("expected (partition, namespace, name) or a reference; got {:?}", args),
    }
}

fn layer_keys(layer: Layer, dec: &Decoded<ComputedTrafficPermissions>) -> Vec<Vec<u8>> {
    if let Layer::WildcardAll = layer {
        return if dec.data.is_default { vec![source_key(WILDCARD, WILDCARD, WILDCARD)] } else { Vec::new() };
    }
    let mut keys: Vec<Vec<u8>> = dec
        .data
        .allow_permissions
        .iter()
        .flat_map(|p| &p.sources)
        .filter(|s| s.peer == LOCAL_PEER)
        .filter_map(|s| match (layer, s.identity_name.is_empty(), s.namespace.is_empty()) {
            (Layer::Exact, false, _) => Some(source_key(&s.partition, &s.namespace, &s.identity_name)),
            (Layer::WildcardName, true, false) => Some(source_key(&s.partition, &s.namespace, WILDCARD)),
            (Layer::WildcardNamespace, true, true) => Some(source_key(&s.partition, WILDCARD, WILDCARD)),
            _ => None,
        })
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

fn source_index(name: &str, layer: Layer) -> Index {
    decoded_multi_index::<ComputedTrafficPermissions, _, _>(name, source_key_from_args, move |dec| {
        let keys = layer_keys(layer, dec);
        Ok(if keys.is_empty() { None } else { Some(keys) })
    })
}

/// The four source indexes, to be registered on the ComputedTrafficPermissions type.
pub fn source_indexes() -> Vec<Index> {
    vec![
        source_index(ALLOW_SOURCE_EXACT_INDEX, Layer::Exact),
        source_index(ALLOW_SOURCE_WILDCARD_NAME_INDEX, Layer::WildcardName),
        source_index(ALLOW_SOURCE_WILDCARD_NAMESPACE_INDEX, Layer::WildcardNamespace),
        source_index(ALLOW_SOURCE_WILDCARD_ALL_INDEX, Layer::WildcardAll),
    ]
}

/// Every cached ComputedTrafficPermissions that lets the identity `source`
/// in, sorted and de-duplicated by reference. Index candidates are
/// re-checked with [`allows`] so exclusions and denies apply. Layer 4 is
/// consulted only when `default_allow` is set.
pub fn sources_allowing(cache: &Cache, source: &impl Referent, default_allow: bool) -> Result<Vec<Arc<Resource>>> {
    let t = source.tenancy();
    let s = |v: &str| Arg::Str(v.to_string());
    let mut layers = vec![
        (ALLOW_SOURCE_EXACT_INDEX, [s(&t.partition), s(&t.namespace), s(source.name())]),
        (ALLOW_SOURCE_WILDCARD_NAME_INDEX, [s(&t.partition), s(&t.namespace), s(WILDCARD)]),
        (ALLOW_SOURCE_WILDCARD_NAMESPACE_INDEX, [s(&t.partition), s(WILDCARD), s(WILDCARD)]),
    ];
    if default_allow {
        layers.push((ALLOW_SOURCE_WILDCARD_ALL_INDEX, [s(WILDCARD), s(WILDCARD), s(WILDCARD)]));
    }

    let mut out: BTreeMap<Reference, Arc<Resource>> = BTreeMap::new();
    for (index, args) in layers {
        for ctp in cache.list(&COMPUTED_TRAFFIC_PERMISSIONS_TYPE, index, &args)? {
            let r = ctp.to_reference();
            if out.contains_key(&r) {
                continue;
            }
            if allows(&ctp.decode::<ComputedTrafficPermissions>()?.data, source, default_allow) {
                out.insert(r, ctp);
            }
        }
    }
    Ok(out.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Type;

    const WI: Type = Type::from_static("auth", "v2beta1", "WorkloadIdentity");

    fn src(name: &str, ns: &str, p: &str) -> Source {
        Source { identity_name: name.into(), namespace: ns.into(), partition: p.into(), ..Source::default() }
    }

    #[test]
    fn empties_are_filled_from_the_owner() {
        let owner = Tenancy::new("p1", "ns1");
        let n = normalize_source(&src("foo", "", ""), &owner).unwrap();
        assert_eq!((n.namespace.as_str(), n.partition.as_str(), n.peer.as_str()), ("ns1", "p1", LOCAL_PEER));

        // namespace-wide within the owner's namespace
        let n = normalize_source(&src("", "", ""), &owner).unwrap();
        assert_eq!((n.namespace.as_str(), n.partition.as_str()), ("ns1", "p1"));

        // explicit partition with no namespace means the whole partition
        let n = normalize_source(&src("", "", "p2"), &owner).unwrap();
        assert_eq!((n.namespace.as_str(), n.partition.as_str()), ("", "p2"));

        // a partition-scoped owner leaves identity-less sources partition-wide
        let n = normalize_source(&src("", "", ""), &Tenancy::partition("p1")).unwrap();
        assert_eq!((n.namespace.as_str(), n.partition.as_str()), ("", "p1"));
    }

    #[test]
    fn peer_with_sameness_group_is_dropped() {
        let bad = Source { peer: "cl1".into(), sameness_group: "sg1".into(), ..src("foo", "", "") };
        assert!(normalize_source(&bad, &Tenancy::default_namespace()).is_none());

        let sg = Source { sameness_group: "sg1".into(), ..src("foo", "", "") };
        assert_eq!(normalize_source(&sg, &Tenancy::default_namespace()).unwrap().peer, "");

        let perm = Permission { sources: vec![bad], destination_rules: vec![] };
        assert!(normalize_permission(&perm, &Tenancy::default_namespace()).is_none());
    }

    #[test]
    fn exclusions_are_honoured() {
        let owner = Tenancy::default_namespace();
        let mut s = src("", "", "");
        s.exclude.push(ExcludeSource { identity_name: "bad".into(), ..ExcludeSource::default() });
        let s = normalize_source(&s, &owner).unwrap();
        assert!(source_matches(&s, &Reference::new(WI, owner.clone(), "good")));
        assert!(!source_matches(&s, &Reference::new(WI, owner.clone(), "bad")));
        assert!(!source_matches(&s, &Reference::new(WI, Tenancy::new("default", "other"), "good")));
    }
}
