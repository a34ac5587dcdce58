//! Per-controller work queue.
//!
//! At most one pending request per resource reference: a new request for a
//! reference that is already queued replaces it, a request for a reference
//! currently being reconciled is parked until that pass finishes. Delayed
//! requests (backoff, requeue-after, periodic resync) are promoted once due
//! and are superseded by any immediate request for the same reference.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use weft_core::{Reference, Referent, Request};

#[derive(Default)]
struct QueueState {
    /// requests waiting to run, ready or delayed
    pending: FxHashMap<Reference, Request>,
    ready: VecDeque<Reference>,
    /// members of `ready`
    queued: FxHashSet<Reference>,
    delayed: BTreeMap<(Instant, u64), Reference>,
    due: FxHashMap<Reference, (Instant, u64)>,
    in_flight: FxHashSet<Reference>,
    /// references that received a new request while in flight
    dirty: FxHashSet<Reference>,
    attempts: FxHashMap<Reference, u32>,
    seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn make_ready(&mut self, key: Reference) {
        if let Some(slot) = self.due.remove(&key) {
            self.delayed.remove(&slot);
        }
        self.push_ready(key);
    }

    fn push_ready(&mut self, key: Reference) {
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    fn pop_ready(&mut self) -> Option<Reference> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some((&slot, _)) = self.delayed.first_key_value() {
            if slot.0 > now {
                break;
            }
            let Some(key) = self.delayed.remove(&slot) else { break };
            self.due.remove(&key);
            if self.in_flight.contains(&key) {
                self.dirty.insert(key);
            } else {
                self.push_ready(key);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.first_key_value().map(|(slot, _)| slot.0)
    }
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue for immediate processing, coalescing with anything pending.
    pub fn add(&self, req: Request) {
        let key = req.id.to_reference();
        {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            st.pending.insert(key.clone(), req);
            if st.in_flight.contains(&key) {
                if let Some(slot) = st.due.remove(&key) {
                    st.delayed.remove(&slot);
                }
                st.dirty.insert(key);
                return;
            }
            st.make_ready(key);
        }
        self.notify.notify_one();
    }

    /// Enqueue to run no earlier than `delay` from now. An already ready
    /// request for the same reference wins.
    pub fn add_after(&self, req: Request, delay: Duration) {
        if delay.is_zero() {
            return self.add(req);
        }
        let key = req.id.to_reference();
        {
            let mut st = self.state.lock();
            if st.shutdown || st.queued.contains(&key) || st.dirty.contains(&key) {
                return;
            }
            let at = Instant::now() + delay;
            if let Some(&(prev, _)) = st.due.get(&key) {
                if prev <= at {
                    return;
                }
            }
            if let Some(slot) = st.due.remove(&key) {
                st.delayed.remove(&slot);
            }
            st.seq += 1;
            let slot = (at, st.seq);
            st.delayed.insert(slot, key.clone());
            st.due.insert(key.clone(), slot);
            st.pending.insert(key, req);
        }
        self.notify.notify_one();
    }

    /// Wait for the next ready request and mark it in flight. `None` after shutdown.
    pub async fn next(&self) -> Option<Request> {
        loop {
            let notified = self.notify.notified();
            let wait = {
                let mut st = self.state.lock();
                if st.shutdown {
                    return None;
                }
                st.promote_due(Instant::now());
                while let Some(key) = st.pop_ready() {
                    if let Some(req) = st.pending.remove(&key) {
                        st.in_flight.insert(key);
                        if !st.ready.is_empty() {
                            self.notify.notify_one();
                        }
                        return Some(req);
                    }
                }
                st.next_due()
            };
            match wait {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish a pass. A request that arrived meanwhile runs next; otherwise
    /// `retry_after` (if any) schedules a delayed retry.
    pub fn done(&self, req: &Request, retry_after: Option<Duration>) {
        let key = req.id.to_reference();
        let requeue = {
            let mut st = self.state.lock();
            st.in_flight.remove(&key);
            if st.dirty.remove(&key) {
                if !st.pending.contains_key(&key) {
                    st.pending.insert(key.clone(), req.clone());
                }
                st.make_ready(key);
                self.notify.notify_one();
                None
            } else {
                retry_after
            }
        };
        if let Some(d) = requeue {
            self.add_after(req.clone(), d);
        }
    }

    /// Bump and return the failure count for `req`'s reference.
    pub fn record_failure(&self, req: &Request) -> u32 {
        let mut st = self.state.lock();
        let n = st.attempts.entry(req.id.to_reference()).or_insert(0);
        let attempt = *n;
        *n = n.saturating_add(1);
        attempt
    }

    pub fn forget(&self, req: &Request) {
        self.state.lock().attempts.remove(&req.id.to_reference());
    }

    /// Pending requests, ready or delayed.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued and release waiting workers.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            st.shutdown = true;
            st.pending.clear();
            st.ready.clear();
            st.queued.clear();
            st.delayed.clear();
            st.due.clear();
            st.dirty.clear();
        }
        self.notify.notify_waiters();
    }
}
