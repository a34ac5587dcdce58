use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use weft_cache::{
    bound_refs_index, decoded_multi_index, decoded_single_index, owner_index, string_from_args, Arg, Builder, Cache,
    CacheError, ListOptions, ResourceIterator,
};
use weft_core::{BoundReferences, Id, Payload, Reference, Referent, Resource, Tenancy, Type};

const ARTIST: Type = Type::from_static("demo", "v2", "Artist");
const ALBUM: Type = Type::from_static("demo", "v2", "Album");
const PLAYLIST: Type = Type::from_static("demo", "v2", "Playlist");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Artist {
    genre: String,
    #[serde(default)]
    tags: Vec<String>,
}

impl Payload for Artist {
    fn resource_type() -> Type { ARTIST }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Playlist {
    bound_references: Vec<Reference>,
}

impl Payload for Playlist {
    fn resource_type() -> Type { PLAYLIST }
}

impl BoundReferences for Playlist {
    fn bound_references(&self) -> &[Reference] { &self.bound_references }
}

fn tenancy() -> Tenancy { Tenancy::default_namespace() }

fn artist(name: &str, genre: &str, tags: &[&str]) -> Resource {
    Resource::from_payload(
        tenancy(),
        name,
        &Artist { genre: genre.into(), tags: tags.iter().map(|s| s.to_string()).collect() },
    )
    .unwrap()
}

fn genre_index() -> weft_cache::Index {
    decoded_single_index::<Artist, _, _>("genre", string_from_args, |dec| {
        if dec.data.genre.is_empty() {
            return Ok(None);
        }
        let mut b = Builder::new();
        b.string(&dec.data.genre);
        Ok(Some(b.into_bytes()))
    })
}

fn tags_index() -> weft_cache::Index {
    decoded_multi_index::<Artist, _, _>("tags", string_from_args, |dec| {
        Ok(Some(
            dec.data
                .tags
                .iter()
                .map(|t| {
                    let mut b = Builder::new();
                    b.string(t);
                    b.into_bytes()
                })
                .collect(),
        ))
    })
}

fn names(v: &[Arc<Resource>]) -> Vec<String> {
    v.iter().map(|r| r.id.name.clone()).collect()
}

fn artist_cache() -> Cache {
    let c = Cache::new();
    c.add_index(&ARTIST, genre_index()).unwrap();
    c.add_index(&ARTIST, tags_index()).unwrap();
    c
}

#[test]
fn insert_replaces_prior_index_contributions() {
    let c = artist_cache();
    c.insert(artist("a1", "jazz", &["live"])).unwrap();
    assert_eq!(names(&c.list(&ARTIST, "genre", &["jazz".into()]).unwrap()), vec!["a1"]);

    c.insert(artist("a1", "rock", &["studio"])).unwrap();
    assert!(c.list(&ARTIST, "genre", &["jazz".into()]).unwrap().is_empty());
    assert!(c.list(&ARTIST, "tags", &["live".into()]).unwrap().is_empty());
    assert_eq!(names(&c.list(&ARTIST, "genre", &["rock".into()]).unwrap()), vec!["a1"]);
    assert_eq!(c.len(&ARTIST), 1);
}

#[test]
fn not_indexable_is_skipped_without_failing() {
    let c = artist_cache();
    c.insert(artist("quiet", "", &[])).unwrap();
    assert!(c.read(&Id::new(ARTIST, tenancy(), "quiet")).unwrap().is_some());
    assert!(c.list(&ARTIST, "genre", &["".into()]).unwrap().is_empty());
}

#[test]
fn extraction_error_aborts_only_that_insert() {
    let c = artist_cache();
    c.insert(artist("good", "jazz", &[])).unwrap();

    let mut bad = artist("good", "jazz", &[]);
    bad.data = serde_json::json!({ "genre": 42 });
    let err = c.insert(bad).unwrap_err();
    assert!(matches!(err, CacheError::Extract { .. }));

    // previous version still fully indexed
    let kept = c.get(&ARTIST, "genre", &["jazz".into()]).unwrap().unwrap();
    assert_eq!(kept.id.name, "good");
}

#[test]
fn prefix_list_returns_one_entry_per_matching_key() {
    let c = artist_cache();
    c.insert(artist("a1", "jazz", &["live", "live-bootleg"])).unwrap();
    c.insert(artist("a2", "jazz", &["livestream"])).unwrap();
    let got = c.list_prefix(&ARTIST, "tags", &["live".into()]).unwrap();
    assert_eq!(names(&got), vec!["a1", "a1", "a2"]);

    let it = c.list_iterator(&ARTIST, "tags", &["live".into()], ListOptions::default()).unwrap();
    assert_eq!(it.count(), 1);
}

#[test]
fn index_symmetry_for_every_registered_index() {
    let c = artist_cache();
    let res = artist("sym", "blues", &["one", "two"]);
    c.insert(res.clone()).unwrap();
    assert_eq!(names(&c.list(&ARTIST, "genre", &["blues".into()]).unwrap()), vec!["sym"]);
    for tag in ["one", "two"] {
        assert_eq!(names(&c.list(&ARTIST, "tags", &[tag.into()]).unwrap()), vec!["sym"]);
    }
    assert_eq!(c.read(&res.id).unwrap().unwrap().id, res.id);
}

#[test]
fn delete_removes_all_entries() {
    let c = artist_cache();
    let res = artist("gone", "jazz", &["x"]);
    c.insert(res.clone()).unwrap();
    c.delete(&res.id).unwrap();
    assert!(c.read(&res.id).unwrap().is_none());
    assert!(c.list(&ARTIST, "genre", &["jazz".into()]).unwrap().is_empty());
    assert!(c.list(&ARTIST, "tags", &["x".into()]).unwrap().is_empty());
    c.delete(&res.id).unwrap();
}

#[test]
fn unknown_index_is_an_error() {
    let c = artist_cache();
    assert!(matches!(c.list(&ARTIST, "nope", &["x".into()]), Err(CacheError::IndexNotFound { .. })));
    assert!(matches!(c.add_index(&ARTIST, genre_index()), Err(CacheError::IndexExists { .. })));
}

#[test]
fn owner_parents_and_bound_refs() {
    let c = Cache::new();
    c.add_index(&ALBUM, owner_index("owner")).unwrap();
    c.add_index(&PLAYLIST, bound_refs_index::<Playlist>("bound-refs")).unwrap();

    let owner = Id::new(ARTIST, tenancy(), "a1");
    let album = Resource::new(Id::new(ALBUM, tenancy(), "al1"), serde_json::json!({})).with_owner(owner.clone());
    c.insert(album).unwrap();
    assert_eq!(names(&c.list(&ALBUM, "owner", &[Arg::from(&owner)]).unwrap()), vec!["al1"]);

    let a1 = Reference::new(ARTIST, tenancy(), "a1");
    let a2 = Reference::new(ARTIST, tenancy(), "a2");
    let pl = Resource::from_payload(tenancy(), "p1", &Playlist { bound_references: vec![a1.clone(), a2.clone()] }).unwrap();
    c.insert(pl).unwrap();
    let pl2 = Resource::from_payload(tenancy(), "p2", &Playlist { bound_references: vec![a2.clone()] }).unwrap();
    c.insert(pl2).unwrap();

    assert_eq!(names(&c.parents(&PLAYLIST, "bound-refs", &a1).unwrap()), vec!["p1"]);
    assert_eq!(names(&c.parents(&PLAYLIST, "bound-refs", &a2).unwrap()), vec!["p1", "p2"]);
    assert!(c.parents(&PLAYLIST, "bound-refs", &Reference::new(ARTIST, tenancy(), "a3")).unwrap().is_empty());
}

#[test]
fn named_queries() {
    let c = artist_cache();
    c.insert(artist("a1", "jazz", &[])).unwrap();
    c.insert(artist("a2", "rock", &[])).unwrap();
    c.add_query(
        "not-genre",
        Arc::new(|cache: &Cache, args: &[Arg]| {
            let Some(Arg::Str(skip)) = args.first() else { anyhow::bail!("expected genre") };
            let out: Vec<_> = cache
                .list_tenancy(&ARTIST, &Tenancy::default_namespace(), "")?
                .into_iter()
                .filter(|r| r.decode::<Artist>().map(|d| &d.data.genre != skip).unwrap_or(false))
                .collect();
            Ok(ResourceIterator::new(out))
        }),
    )
    .unwrap();

    let got: Vec<_> = c.query("not-genre", &["jazz".into()]).unwrap().map(|r| r.name().to_string()).collect();
    assert_eq!(got, vec!["a2"]);
    assert!(matches!(c.query("not-genre", &[]), Err(CacheError::Query { .. })));
    assert!(matches!(c.query("missing", &[]), Err(CacheError::QueryNotFound(_))));
}
