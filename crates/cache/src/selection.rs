//! Reverse index from workload names to the resources whose selectors pick them.
//!
//! Two ordered trees (exact names and name prefixes) map to the ids that
//! contributed them, plus the last selector seen per id so that edits can be
//! applied as "untrack everything, insert the new entries".

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use weft_core::{Id, Reference, Referent, WorkloadSelector};

#[derive(Default)]
struct TrackerState {
    exact: BTreeMap<String, Vec<Id>>,
    prefixes: BTreeMap<String, Vec<Id>>,
    selectors: FxHashMap<Reference, (Id, WorkloadSelector)>,
}

impl TrackerState {
    fn untrack(&mut self, r: &Reference) {
        let Some((_, selector)) = self.selectors.remove(r) else { return };
        for name in &selector.names {
            remove_entry(&mut self.exact, name, r);
        }
        for prefix in &selector.prefixes {
            remove_entry(&mut self.prefixes, prefix, r);
        }
    }
}

fn remove_entry(tree: &mut BTreeMap<String, Vec<Id>>, key: &str, r: &Reference) {
    if let Some(ids) = tree.get_mut(key) {
        ids.retain(|id| !weft_core::equal_reference(id, r));
        if ids.is_empty() {
            tree.remove(key);
        }
    }
}

fn add_entry(tree: &mut BTreeMap<String, Vec<Id>>, key: &str, id: &Id) {
    let ids = tree.entry(key.to_string()).or_default();
    if !ids.iter().any(|x| weft_core::equal_reference(x, id)) {
        ids.push(id.clone());
    }
}

#[derive(Default)]
pub struct SelectionTracker {
    state: RwLock<TrackerState>,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `selector` as the current selector of `id`. A selector equal (as
    /// sets) to the tracked one is a no-op; anything else replaces it wholesale.
    pub fn track_id_for_selector(&self, id: &Id, selector: &WorkloadSelector) {
        let r = id.to_reference();
        let mut st = self.state.write();
        if let Some((_, prev)) = st.selectors.get(&r) {
            if prev.equivalent(selector) {
                return;
            }
        }
        st.untrack(&r);
        for name in &selector.names {
            add_entry(&mut st.exact, name, id);
        }
        for prefix in &selector.prefixes {
            add_entry(&mut st.prefixes, prefix, id);
        }
        st.selectors.insert(r, (id.clone(), selector.clone()));
    }

    /// Safe to call for ids that were never tracked.
    pub fn untrack_id(&self, id: &impl Referent) {
        self.state.write().untrack(&id.to_reference());
    }

    /// Ids whose current selector names `name` exactly or holds a prefix of it.
    /// Sorted and de-duplicated.
    pub fn get_ids_for_name(&self, name: &str) -> Vec<Id> {
        let st = self.state.read();
        let mut out: BTreeSet<Id> = BTreeSet::new();
        // walk every prefix of `name`, including "" and `name` itself
        let mut bounds: Vec<usize> = name.char_indices().map(|(i, _)| i).collect();
        bounds.push(name.len());
        for end in bounds {
            if let Some(ids) = st.prefixes.get(&name[..end]) {
                out.extend(ids.iter().cloned());
            }
        }
        if let Some(ids) = st.exact.get(name) {
            out.extend(ids.iter().cloned());
        }
        out.into_iter().collect()
    }

    pub fn tracked(&self) -> usize {
        self.state.read().selectors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{Tenancy, Type};

    const SVC: Type = Type::from_static("catalog", "v2beta1", "Service");

    fn id(name: &str) -> Id {
        Id::new(SVC, Tenancy::default_namespace(), name)
    }

    fn names(ids: Vec<Id>) -> Vec<String> {
        ids.into_iter().map(|i| i.name).collect()
    }

    #[test]
    fn names_and_prefixes() {
        let t = SelectionTracker::new();
        t.track_id_for_selector(&id("r"), &WorkloadSelector::names(["foo"]).with_prefixes(["api-"]));
        assert_eq!(names(t.get_ids_for_name("foo")), vec!["r"]);
        assert_eq!(names(t.get_ids_for_name("api-1")), vec!["r"]);
        assert!(t.get_ids_for_name("bar").is_empty());
    }

    #[test]
    fn reselect_leaves_no_stale_entries() {
        let t = SelectionTracker::new();
        t.track_id_for_selector(&id("r"), &WorkloadSelector::names(["foo"]).with_prefixes(["api-"]));
        t.track_id_for_selector(&id("r"), &WorkloadSelector::names(["bar"]));
        assert!(t.get_ids_for_name("foo").is_empty());
        assert!(t.get_ids_for_name("api-1").is_empty());
        assert_eq!(names(t.get_ids_for_name("bar")), vec!["r"]);

        t.untrack_id(&id("r"));
        assert!(t.get_ids_for_name("bar").is_empty());
        assert_eq!(t.tracked(), 0);
        t.untrack_id(&id("never"));
    }

    #[test]
    fn union_is_deduplicated() {
        let t = SelectionTracker::new();
        t.track_id_for_selector(&id("a"), &WorkloadSelector::names(["api-1"]).with_prefixes(["api", ""]));
        t.track_id_for_selector(&id("b"), &WorkloadSelector::default().with_prefixes(["api-"]));
        assert_eq!(names(t.get_ids_for_name("api-1")), vec!["a", "b"]);
        assert_eq!(names(t.get_ids_for_name("zzz")), vec!["a"]);
    }
}
