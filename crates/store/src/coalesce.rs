//! Change-event coalescer sitting between a watch feed and its consumer.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use weft_core::{Reference, Referent, Resource, WatchEvent};

/// Latest change per resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert(Resource),
    Delete(Resource),
}

impl Change {
    pub fn resource(&self) -> &Resource {
        match self {
            Change::Upsert(r) | Change::Delete(r) => r,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete(_))
    }
}

/// Coalescing queue keyed by reference with FIFO order. A later change for a
/// queued reference replaces the earlier one in place. Changes are never
/// dropped; `cap` only tells the consumer when to drain.
pub struct Coalescer {
    map: FxHashMap<Reference, Change>,
    order: VecDeque<Reference>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Distinct pending references have reached capacity.
    pub fn is_full(&self) -> bool { self.map.len() >= self.cap }

    pub fn push(&mut self, c: Change) {
        let key = c.resource().to_reference();
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, c);
    }

    /// Push a raw watch event. `Restarted` is not a per-resource change and is
    /// handed back to the caller, who must drain first to keep ordering.
    pub fn push_event(&mut self, ev: WatchEvent) -> Option<Vec<Resource>> {
        match ev {
            WatchEvent::Upsert(r) => self.push(Change::Upsert(r)),
            WatchEvent::Delete(r) => self.push(Change::Delete(r)),
            WatchEvent::Restarted(all) => return Some(all),
        }
        None
    }

    /// Drain all currently coalesced changes in arrival order.
    pub fn drain_ready(&mut self) -> Vec<Change> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(c) = self.map.remove(&key) {
                out.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{Id, Tenancy, Type};

    const THING: Type = Type::from_static("demo", "v1", "Thing");

    fn res(name: &str, v: i64) -> Resource {
        Resource::new(Id::new(THING, Tenancy::default_namespace(), name), serde_json::json!({ "v": v }))
    }

    #[test]
    fn later_change_replaces_earlier_in_place() {
        let mut c = Coalescer::with_capacity(8);
        c.push(Change::Upsert(res("a", 1)));
        c.push(Change::Upsert(res("b", 1)));
        c.push(Change::Delete(res("a", 2)));
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_delete());
        assert_eq!(out[0].resource().id.name, "a");
        assert!(c.is_empty());
    }

    #[test]
    fn overflow_keeps_every_change() {
        let mut c = Coalescer::with_capacity(2);
        c.push(Change::Upsert(res("a", 0)));
        assert!(!c.is_full());
        c.push(Change::Upsert(res("b", 0)));
        assert!(c.is_full());
        c.push(Change::Delete(res("c", 0)));
        c.push(Change::Upsert(res("a", 1)));
        let out = c.drain_ready();
        let names: Vec<_> = out.iter().map(|x| x.resource().id.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(out[0].resource().data["v"], 1);
        assert!(out[2].is_delete());
        assert!(!c.is_full());
    }

    #[test]
    fn restarted_is_handed_back() {
        let mut c = Coalescer::with_capacity(4);
        assert!(c.push_event(WatchEvent::Upsert(res("a", 0))).is_none());
        let all = c.push_event(WatchEvent::Restarted(vec![res("x", 0)])).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(c.len(), 1);
    }
}
