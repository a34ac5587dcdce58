//! Ready-made index constructors.

use std::sync::Arc;

use anyhow::bail;
use smallvec::smallvec;
use weft_core::{BoundReferences, Decoded, Payload, Reference, Referent, Resource};

use crate::index::{reference_key, Arg, Builder, Index, IndexKeys};

/// Every registered type gets this index: keyed by tenancy then name.
pub const ID_INDEX: &str = "id";

pub fn id_index() -> Index {
    Index::new(
        ID_INDEX,
        Arc::new(id_from_args),
        Arc::new(|res: &Resource| {
            let mut b = Builder::new();
            b.tenancy(&res.id.tenancy).string(&res.id.name);
            Ok(Some(smallvec![b.into_bytes()]))
        }),
    )
}

/// Accepts a reference, a tenancy (prefix queries over a whole tenancy), or a
/// tenancy and a name (or name prefix).
fn id_from_args(args: &[Arg]) -> anyhow::Result<Vec<u8>> {
    let mut b = Builder::new();
    match args {
        [Arg::Ref(r)] => {
            b.tenancy(&r.tenancy).string(&r.name);
        }
        [Arg::Tenancy(t)] => {
            b.tenancy(t).string("");
        }
        [Arg::Tenancy(t), Arg::Str(name)] => {
            b.tenancy(t).string(name);
        }
        _ => bail!("expected reference, tenancy, or tenancy and name; got {:?}", args),
    }
    Ok(b.into_bytes())
}

/// Query arguments naming a full reference, or an already encoded key.
pub fn reference_from_args(args: &[Arg]) -> anyhow::Result<Vec<u8>> {
    match args {
        [Arg::Ref(r)] => Ok(reference_key(r)),
        [Arg::Bytes(b)] => Ok(b.clone()),
        _ => bail!("expected a single reference; got {:?}", args),
    }
}

/// Query arguments naming a single string value.
pub fn string_from_args(args: &[Arg]) -> anyhow::Result<Vec<u8>> {
    match args {
        [Arg::Str(s)] => {
            let mut b = Builder::new();
            b.string(s);
            Ok(b.into_bytes())
        }
        _ => bail!("expected a single string; got {:?}", args),
    }
}

pub fn single_index<A, F>(name: &str, from_args: A, from_resource: F) -> Index
where
    A: Fn(&[Arg]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    F: Fn(&Resource) -> anyhow::Result<Option<Vec<u8>>> + Send + Sync + 'static,
{
    Index::new(
        name,
        Arc::new(from_args),
        Arc::new(move |res: &Resource| Ok(from_resource(res)?.map(|k| smallvec![k]))),
    )
}

pub fn multi_index<A, F>(name: &str, from_args: A, from_resource: F) -> Index
where
    A: Fn(&[Arg]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    F: Fn(&Resource) -> anyhow::Result<Option<Vec<Vec<u8>>>> + Send + Sync + 'static,
{
    Index::new(
        name,
        Arc::new(from_args),
        Arc::new(move |res: &Resource| Ok(from_resource(res)?.map(IndexKeys::from_vec))),
    )
}

/// Single-valued index over a decoded payload. Decode failures fail the insert.
pub fn decoded_single_index<T, A, F>(name: &str, from_args: A, f: F) -> Index
where
    T: Payload,
    A: Fn(&[Arg]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    F: Fn(&Decoded<T>) -> anyhow::Result<Option<Vec<u8>>> + Send + Sync + 'static,
{
    single_index(name, from_args, move |res| {
        let dec = Decoded::<T>::from_resource(res.clone())?;
        f(&dec)
    })
}

/// Multi-valued index over a decoded payload.
pub fn decoded_multi_index<T, A, F>(name: &str, from_args: A, f: F) -> Index
where
    T: Payload,
    A: Fn(&[Arg]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    F: Fn(&Decoded<T>) -> anyhow::Result<Option<Vec<Vec<u8>>>> + Send + Sync + 'static,
{
    multi_index(name, from_args, move |res| {
        let dec = Decoded::<T>::from_resource(res.clone())?;
        f(&dec)
    })
}

/// Index over the references a payload points at.
pub fn ref_index<T, F>(name: &str, f: F) -> Index
where
    T: Payload,
    F: Fn(&Decoded<T>) -> Vec<Reference> + Send + Sync + 'static,
{
    decoded_multi_index::<T, _, _>(name, reference_from_args, move |dec| {
        let refs = f(dec);
        if refs.is_empty() {
            return Ok(None);
        }
        Ok(Some(refs.iter().map(reference_key).collect()))
    })
}

/// Single reference-or-id field of a payload. Ids index under their
/// reference, so either kind of query argument finds them.
pub fn ref_or_id_index<T, R, F>(name: &str, f: F) -> Index
where
    T: Payload,
    R: Referent,
    F: Fn(&Decoded<T>) -> Option<R> + Send + Sync + 'static,
{
    decoded_single_index::<T, _, _>(name, reference_from_args, move |dec| Ok(f(dec).map(|r| reference_key(&r))))
}

/// Owned resources keyed by their owner. Unowned resources are not indexed.
pub fn owner_index(name: &str) -> Index {
    single_index(name, reference_from_args, |res| Ok(res.owner.as_ref().map(reference_key)))
}

/// One entry per bound reference recorded on a computed payload.
pub fn bound_refs_index<T>(name: &str) -> Index
where
    T: Payload + BoundReferences,
{
    ref_index::<T, _>(name, |dec| dec.data.bound_references().to_vec())
}
