//! Dependency mappers: turn a change on a watched type into reconcile
//! requests for a controller's own type.
//!
//! Mappers run on the watch-ingest path against the cache, which already
//! reflects the change being mapped. None of them de-duplicate; the work
//! queue coalesces requests for the same resource.

use std::collections::BTreeSet;
use std::sync::Arc;

use weft_cache::{Arg, SelectionTracker};
use weft_core::{Decoded, Payload, Reference, Referent, Request, Resource, Result, SelectsWorkloads, Tenancy, Type, WILDCARD};

use crate::Runtime;

pub type DependencyMapper = Arc<dyn Fn(&Runtime, &Resource) -> Result<Vec<Request>> + Send + Sync>;

/// One hop of a multi-hop relationship: resources related to the input.
pub type DependencyTransform = Arc<dyn Fn(&Runtime, &Resource) -> Result<Vec<Arc<Resource>>> + Send + Sync>;

pub fn mapper<F>(f: F) -> DependencyMapper
where
    F: Fn(&Runtime, &Resource) -> Result<Vec<Request>> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn transform<F>(f: F) -> DependencyTransform
where
    F: Fn(&Runtime, &Resource) -> Result<Vec<Arc<Resource>>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One request for the resource of `ty` with the same tenancy and name.
pub fn replace_type(ty: Type) -> DependencyMapper {
    mapper(move |_, res| Ok(vec![Request::new(weft_core::replace_type(&ty, res))]))
}

/// Decode the payload as `T` before mapping. Decode failures fail the mapping.
pub fn map_decoded<T, F>(f: F) -> DependencyMapper
where
    T: Payload,
    F: Fn(&Runtime, &Decoded<T>) -> Result<Vec<Request>> + Send + Sync + 'static,
{
    mapper(move |rt, res| {
        let dec = Decoded::<T>::from_resource(res.clone())?;
        f(rt, &dec)
    })
}

/// Run every mapper on the same input and concatenate the results.
pub fn multi_mapper(mappers: Vec<DependencyMapper>) -> DependencyMapper {
    mapper(move |rt, res| {
        let mut out = Vec::new();
        for m in &mappers {
            out.extend(m(rt, res)?);
        }
        Ok(out)
    })
}

/// Request the owner of the changed resource, if it has one.
pub fn map_owner() -> DependencyMapper {
    mapper(|_, res| Ok(res.owner.iter().map(|o| Request::new(o.clone())).collect()))
}

/// Like [`map_owner`], but only for owners of type `ty`.
pub fn map_owner_filtered(ty: Type) -> DependencyMapper {
    mapper(move |_, res| {
        Ok(res.owner.iter().filter(|o| o.ty == ty).map(|o| Request::new(o.clone())).collect())
    })
}

/// Request every resource of `computed` whose bound references (indexed
/// under `index`) currently contain the changed resource. Paired with a
/// mapper over the new payload this reaches both old and new dependents.
pub fn map_bound_refs(computed: Type, index: &str) -> DependencyMapper {
    let index = index.to_string();
    mapper(move |rt, res| {
        Ok(rt.cache.parents_iterator(&computed, &index, res)?.map(|r| Request::new(r.id.clone())).collect())
    })
}

/// Resolve the selector of a `T` against cached workloads of `workload`
/// in the same tenancy and request the name-aligned `target` of each match.
/// A selected name with no workload yet is skipped.
pub fn map_selector<T>(target: Type, workload: Type) -> DependencyMapper
where
    T: Payload + SelectsWorkloads,
{
    map_decoded::<T, _>(move |rt, dec| {
        let Some(selector) = dec.data.workload_selector() else { return Ok(Vec::new()) };
        let tenancy = dec.resource.tenancy();
        let mut out = Vec::new();
        for name in &selector.names {
            let r = Reference::new(workload.clone(), tenancy.clone(), name.clone());
            if let Some(w) = rt.cache.read(&r)? {
                out.push(Request::new(weft_core::replace_type(&target, &*w)));
            }
        }
        for prefix in &selector.prefixes {
            for w in rt.cache.list_tenancy(&workload, tenancy, prefix)? {
                out.push(Request::new(weft_core::replace_type(&target, &*w)));
            }
        }
        Ok(out)
    })
}

/// Ask `tracker` which resources select the changed resource's name and
/// request them as `target`. Only selectors in the same tenancy count.
pub fn map_selection_tracker(tracker: Arc<SelectionTracker>, target: Type) -> DependencyMapper {
    mapper(move |_, res| {
        Ok(tracker
            .get_ids_for_name(res.name())
            .into_iter()
            .filter(|id| id.tenancy() == res.tenancy())
            .map(|id| Request::new(weft_core::replace_type(&target, &id)))
            .collect())
    })
}

/// Fan a tenancy-wide resource out to every cached `list` resource it
/// covers, requesting the name-aligned `target` of each. A resource with an
/// empty namespace covers its whole partition.
pub fn map_tenancy(list: Type, target: Type) -> DependencyMapper {
    mapper(move |rt, res| {
        let t = res.tenancy();
        let scope = if t.namespace.is_empty() { Tenancy::new(t.partition.clone(), WILDCARD) } else { t.clone() };
        Ok(rt
            .cache
            .list_tenancy(&list, &scope, "")?
            .iter()
            .map(|r| Request::new(weft_core::replace_type(&target, &**r)))
            .collect())
    })
}

/// Feed the output of each transform into the next, left to right. Inputs
/// reached through several paths are visited once per stage.
pub fn transform_chain(transforms: Vec<DependencyTransform>) -> DependencyTransform {
    transform(move |rt, res| {
        let mut current = vec![Arc::new(res.clone())];
        for t in &transforms {
            let mut seen = BTreeSet::new();
            let mut next = Vec::new();
            for r in &current {
                for out in t(rt, &**r)? {
                    if seen.insert(out.to_reference()) {
                        next.push(out);
                    }
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        Ok(current)
    })
}

/// Run `transform`, then `mapper` on each resource it produced.
pub fn map_with_transform(transform: DependencyTransform, mapper: DependencyMapper) -> DependencyMapper {
    self::mapper(move |rt, res| {
        let mut out = Vec::new();
        for r in transform(rt, res)? {
            out.extend(mapper(rt, &*r)?);
        }
        Ok(out)
    })
}

/// Shorthand for a transform whose results are name-aligned with `target`.
pub fn wrap_and_replace_type(target: Type, transform: DependencyTransform) -> DependencyMapper {
    map_with_transform(transform, replace_type(target))
}

/// Resources of `ty` whose `index` entry matches the changed resource.
pub fn transform_parents(ty: Type, index: &str) -> DependencyTransform {
    let index = index.to_string();
    transform(move |rt, res| Ok(rt.cache.parents(&ty, &index, res)?))
}

/// Resources of `ty` returned by an exact `index` lookup whose arguments
/// are derived from the changed resource.
pub fn transform_list<F>(ty: Type, index: &str, args: F) -> DependencyTransform
where
    F: Fn(&Resource) -> Result<Vec<Arg>> + Send + Sync + 'static,
{
    let index = index.to_string();
    transform(move |rt, res| Ok(rt.cache.list(&ty, &index, &args(res)?)?))
}

/// Follow the references a `T` payload holds to their cached resources.
/// Dangling references are dropped.
pub fn transform_refs<T, F>(f: F) -> DependencyTransform
where
    T: Payload,
    F: Fn(&Decoded<T>) -> Vec<Reference> + Send + Sync + 'static,
{
    transform(move |rt, res| {
        let dec = Decoded::<T>::from_resource(res.clone())?;
        let mut out = Vec::new();
        for r in f(&dec) {
            if let Some(found) = rt.cache.read(&r)? {
                out.push(found);
            }
        }
        Ok(out)
    })
}

/// Sort and de-duplicate a request list by resource reference.
pub fn dedupe(mut reqs: Vec<Request>) -> Vec<Request> {
    reqs.sort_by(|a, b| a.id.to_reference().cmp(&b.id.to_reference()));
    reqs.dedup_by(|a, b| weft_core::equal_reference(&a.id, &b.id));
    reqs
}
