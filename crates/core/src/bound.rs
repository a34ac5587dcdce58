//! Bound references: the ledger of inputs recorded on every computed resource.
//!
//! A reconciler adds every resource it read that materially affected its output.
//! The finished list is written onto the computed payload so that a later edit
//! to any of those inputs can find the computed resource again, even after the
//! input no longer points at it.

use std::collections::BTreeSet;

use crate::resource::{Reference, Referent};

/// Accumulates references during one reconcile pass.
#[derive(Debug, Default, Clone)]
pub struct BoundReferenceCollector {
    refs: BTreeSet<Reference>,
}

impl BoundReferenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, r: &impl Referent) {
        self.refs.insert(r.to_reference());
    }

    pub fn add_all<'a, R: Referent + 'a>(&mut self, refs: impl IntoIterator<Item = &'a R>) {
        for r in refs {
            self.add(r);
        }
    }

    pub fn contains(&self, r: &impl Referent) -> bool {
        self.refs.contains(&r.to_reference())
    }

    pub fn len(&self) -> usize { self.refs.len() }
    pub fn is_empty(&self) -> bool { self.refs.is_empty() }

    /// Sorted, de-duplicated list ready to be stored on the computed resource.
    pub fn list(&self) -> Vec<Reference> {
        self.refs.iter().cloned().collect()
    }
}

/// Computed payloads expose their ledger so generic index code can read it.
pub trait BoundReferences {
    fn bound_references(&self) -> &[Reference];
}
