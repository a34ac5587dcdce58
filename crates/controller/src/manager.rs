//! Manager: owns the cache, the per-type watch ingest loops and every
//! controller's queue and workers.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use weft_cache::Cache;
use weft_core::{Error, Referent, Registry, Request, Resource, Result, Tenancy, Type, WatchEvent};
use weft_store::{Backend, Change, Coalescer, Watch as Feed};

use crate::backoff::Backoff;
use crate::controller::{Controller, Placement};
use crate::queue::WorkQueue;
use crate::runtime::{Client, Runtime};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Default backoff for controllers that do not set their own.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// A reconcile running longer than this is aborted and retried.
    pub reconcile_timeout: Duration,
    /// Concurrent reconciles per controller (distinct resources only).
    pub workers_per_controller: usize,
    /// How often coalesced watch events are applied.
    pub ingest_interval: Duration,
    pub ingest_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            reconcile_timeout: Duration::from_secs(30),
            workers_per_controller: 4,
            ingest_interval: Duration::from_millis(5),
            ingest_capacity: 1024,
        }
    }
}

/// Flips leadership for a running manager.
#[derive(Clone)]
pub struct LeaderHandle(Arc<watch::Sender<bool>>);

impl LeaderHandle {
    pub fn set(&self, leader: bool) {
        self.0.send_replace(leader);
    }

    pub fn is_leader(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct Manager {
    config: ManagerConfig,
    registry: Registry,
    backend: Arc<dyn Backend>,
    cache: Arc<Cache>,
    leader: Arc<watch::Sender<bool>>,
    runners: Vec<Arc<ControllerRunner>>,
}

impl Manager {
    /// Starts as a non-leader; see [`Manager::leader`].
    pub fn new(backend: Arc<dyn Backend>, registry: Registry, config: ManagerConfig) -> Self {
        let (tx, _) = watch::channel(false);
        Self { config, registry, backend, cache: Arc::new(Cache::new()), leader: Arc::new(tx), runners: Vec::new() }
    }

    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.cache)
    }

    pub fn leader(&self) -> LeaderHandle {
        LeaderHandle(Arc::clone(&self.leader))
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.send_replace(leader);
    }

    /// Add a controller and register its types, indexes and queries with the
    /// cache. Panics on anything that makes the controller unrunnable.
    pub fn register(&mut self, controller: Controller) {
        controller.validate();
        for ty in controller.watched_types() {
            if self.registry.get(&ty).is_none() {
                panic!("controller {}: type {} is not registered", controller.name, ty);
            }
            self.cache.add_type(&ty);
        }
        if self.runners.iter().any(|r| r.controller.name == controller.name) {
            panic!("controller {} registered twice", controller.name);
        }
        let indexes = controller
            .managed_indexes
            .iter()
            .map(|i| (&controller.managed_type, i))
            .chain(controller.watches.iter().flat_map(|w| w.indexes.iter().map(move |i| (&w.ty, i))));
        for (ty, index) in indexes {
            if let Err(e) = self.cache.add_index(ty, index.clone()) {
                panic!("controller {}: {}", controller.name, e);
            }
        }
        for (name, query) in &controller.queries {
            if let Err(e) = self.cache.add_query(name, Arc::clone(query)) {
                panic!("controller {}: {}", controller.name, e);
            }
        }

        let backoff = controller.backoff.unwrap_or_else(|| Backoff::new(self.config.backoff_base, self.config.backoff_max));
        let client = Client::new(Arc::clone(&self.backend), self.leader.subscribe());
        let runtime = Runtime::new(client, Arc::clone(&self.cache), &controller.name);
        info!(controller = %controller, "controller registered");
        self.runners.push(Arc::new(ControllerRunner {
            controller: Arc::new(controller),
            backoff,
            runtime,
            queue: ArcSwapOption::empty(),
            running: Mutex::new(None),
        }));
    }

    /// Run until `cancel` fires. Every watched type is loaded into the cache
    /// before any controller starts.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let types: BTreeSet<Type> = self.runners.iter().flat_map(|r| r.controller.watched_types()).collect();

        let mut feeds = Vec::with_capacity(types.len());
        for ty in types {
            let mut feed = self.backend.watch(&ty)?;
            match feed.next().await {
                Some(WatchEvent::Restarted(all)) => apply_snapshot(&ty, all, &self.cache, &[]),
                Some(other) => warn!(ty = %ty, kind = other.kind(), "watch did not start with a snapshot"),
                None => return Err(Error::Backend(format!("watch feed for {} closed", ty))),
            }
            debug!(ty = %ty, count = self.cache.len(&ty), "initial snapshot loaded");
            feeds.push((ty, feed));
        }

        let mut ingest = Vec::with_capacity(feeds.len());
        for (ty, feed) in feeds {
            let runners: Vec<_> =
                self.runners.iter().filter(|r| r.controller.watched_types().contains(&ty)).cloned().collect();
            ingest.push(tokio::spawn(ingest_loop(
                ty,
                feed,
                Arc::clone(&self.cache),
                runners,
                self.config.clone(),
                cancel.clone(),
            )));
        }

        for r in self.runners.iter().filter(|r| r.controller.placement == Placement::EachServer) {
            r.start(&self.config);
        }
        let singletons: Vec<_> =
            self.runners.iter().filter(|r| r.controller.placement == Placement::Singleton).cloned().collect();
        let mut leader_rx = self.leader.subscribe();
        info!(controllers = self.runners.len(), "manager running");
        loop {
            let is_leader = *leader_rx.borrow_and_update();
            for r in &singletons {
                if is_leader {
                    r.start(&self.config);
                } else if let Some(task) = r.stop() {
                    // a flap back to leader must not start a second runner over live passes
                    let _ = task.await;
                    info!(controller = %r.controller.name, "lost leadership; controller stopped");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = leader_rx.changed() => if changed.is_err() { break },
            }
        }

        let stopping: Vec<_> = self.runners.iter().filter_map(|r| r.stop()).collect();
        join_all(stopping).await;
        join_all(ingest).await;
        info!("manager stopped");
        Ok(())
    }
}

/// Watch ingest loop: events are coalesced per resource and applied
/// in batches, first to the cache, then to every interested controller.
async fn ingest_loop(
    ty: Type,
    mut feed: Feed,
    cache: Arc<Cache>,
    runners: Vec<Arc<ControllerRunner>>,
    config: ManagerConfig,
    cancel: CancellationToken,
) {
    let cap = config.ingest_capacity.max(1);
    let mut coalescer = Coalescer::with_capacity(cap);
    let mut ticker = tokio::time::interval(config.ingest_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = feed.next() => {
                match maybe {
                    Some(ev) => {
                        if let Some(all) = coalescer.push_event(ev) {
                            flush(&ty, &mut coalescer, &cache, &runners);
                            apply_snapshot(&ty, all, &cache, &runners);
                        } else if coalescer.is_full() {
                            flush(&ty, &mut coalescer, &cache, &runners);
                        }
                    }
                    None => {
                        debug!(ty = %ty, "watch feed closed; draining and exiting ingest loop");
                        flush(&ty, &mut coalescer, &cache, &runners);
                        break;
                    }
                }
            }
            _ = ticker.tick() => flush(&ty, &mut coalescer, &cache, &runners),
        }
    }
    info!(ty = %ty, "ingest loop stopped");
}

fn flush(ty: &Type, coalescer: &mut Coalescer, cache: &Cache, runners: &[Arc<ControllerRunner>]) {
    for change in coalescer.drain_ready() {
        apply_change(ty, change, cache, runners);
    }
}

fn apply_change(ty: &Type, change: Change, cache: &Cache, runners: &[Arc<ControllerRunner>]) {
    let applied = match &change {
        Change::Upsert(res) => cache.insert(res.clone()),
        Change::Delete(res) => cache.delete(res),
    };
    if let Err(e) = applied {
        warn!(ty = %ty, id = %change.resource().id, error = %e, "cache update failed");
    }
    for r in runners {
        r.dispatch(ty, change.resource());
    }
}

/// Replace the cached contents of `ty` with `all`, reporting anything that
/// disappeared as a delete.
fn apply_snapshot(ty: &Type, all: Vec<Resource>, cache: &Cache, runners: &[Arc<ControllerRunner>]) {
    let keep: BTreeSet<_> = all.iter().map(|r| r.to_reference()).collect();
    let gone: Vec<_> = match cache.list_tenancy(ty, &Tenancy::wildcard(), "") {
        Ok(cached) => cached.into_iter().filter(|r| !keep.contains(&r.to_reference())).collect(),
        Err(e) => {
            warn!(ty = %ty, error = %e, "listing cache for snapshot failed");
            Vec::new()
        }
    };
    for res in gone {
        apply_change(ty, Change::Delete((*res).clone()), cache, runners);
    }
    for res in all {
        apply_change(ty, Change::Upsert(res), cache, runners);
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct ControllerRunner {
    controller: Arc<Controller>,
    backoff: Backoff,
    runtime: Runtime,
    /// Present only while the controller runs.
    queue: ArcSwapOption<WorkQueue>,
    running: Mutex<Option<Running>>,
}

impl ControllerRunner {
    fn name(&self) -> &str {
        &self.controller.name
    }

    fn report_depth(&self, queue: &WorkQueue) {
        gauge!("controller_queue_depth", queue.len() as f64, "controller" => self.name().to_string());
    }

    /// Map one change onto requests. A change to the managed type always
    /// requests that resource.
    fn dispatch(&self, ty: &Type, res: &Resource) {
        let Some(queue) = self.queue.load_full() else { return };
        let managed = &self.controller.managed_type;
        if ty == managed {
            queue.add(Request::new(res.id.clone()));
        }
        if let Some(w) = self.controller.watch_for(ty) {
            let mapped = std::panic::catch_unwind(AssertUnwindSafe(|| (w.mapper)(&self.runtime, res)))
                .unwrap_or_else(|_| Err(Error::Other(anyhow::anyhow!("dependency mapper panicked"))));
            match mapped {
                Ok(reqs) => {
                    for req in reqs {
                        if &req.id.ty != managed {
                            warn!(controller = %self.name(), id = %req.id, "mapper produced a request for a foreign type");
                            continue;
                        }
                        queue.add(req);
                    }
                }
                Err(e) => warn!(controller = %self.name(), id = %res.id, error = %e, "dependency mapper failed"),
            }
        }
        self.report_depth(&queue);
    }

    /// Replay the cached contents of every watched type through dispatch.
    fn replay(&self) {
        for ty in self.controller.watched_types() {
            match self.runtime.cache.list_tenancy(&ty, &Tenancy::wildcard(), "") {
                Ok(all) => all.iter().for_each(|res| self.dispatch(&ty, res)),
                Err(e) => warn!(controller = %self.name(), ty = %ty, error = %e, "replay failed"),
            }
        }
    }

    /// Idempotent.
    fn start(self: &Arc<Self>, config: &ManagerConfig) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let queue = Arc::new(WorkQueue::new());
        self.queue.store(Some(Arc::clone(&queue)));
        self.replay();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).supervise(
            queue,
            cancel.clone(),
            config.workers_per_controller.max(1),
            config.reconcile_timeout,
        ));
        *running = Some(Running { cancel, task });
    }

    /// Returns the supervisor task to await, if the controller was running.
    fn stop(&self) -> Option<JoinHandle<()>> {
        let running = self.running.lock().take()?;
        running.cancel.cancel();
        if let Some(q) = self.queue.swap(None) {
            q.shutdown();
        }
        Some(running.task)
    }

    async fn supervise(self: Arc<Self>, queue: Arc<WorkQueue>, cancel: CancellationToken, workers: usize, timeout: Duration) {
        if let Some(init) = self.controller.initializer.clone() {
            let mut attempt = 0;
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = init.initialize(&self.runtime) => r,
                };
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = self.backoff.delay(attempt);
                        attempt += 1;
                        warn!(controller = %self.name(), error = %e, retry_in = ?delay, "initializer failed");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        if let Some(hook) = &self.controller.notify_start {
            hook(&self.runtime);
        }
        info!(controller = %self.name(), workers, "controller started");

        let handles: Vec<_> = (0..workers)
            .map(|_| tokio::spawn(Arc::clone(&self).worker(Arc::clone(&queue), cancel.clone(), timeout)))
            .collect();
        join_all(handles).await;

        if let Some(hook) = &self.controller.notify_stop {
            hook(&self.runtime);
        }
        info!(controller = %self.name(), "controller stopped");
    }

    async fn worker(self: Arc<Self>, queue: Arc<WorkQueue>, cancel: CancellationToken, timeout: Duration) {
        loop {
            let req = tokio::select! {
                _ = cancel.cancelled() => break,
                next = queue.next() => match next {
                    Some(req) => req,
                    None => break,
                },
            };
            let retry = self.process(&queue, &req, &cancel, timeout).await;
            queue.done(&req, retry);
            self.report_depth(&queue);
        }
    }

    /// One reconcile pass. Returns the delay before the request should run
    /// again, if at all.
    async fn process(&self, queue: &WorkQueue, req: &Request, cancel: &CancellationToken, timeout: Duration) -> Option<Duration> {
        let Some(reconciler) = self.controller.reconciler.clone() else { return None };
        let started = Instant::now();
        let pass = cancel.child_token();
        let rt = self.runtime.with_cancellation(pass.clone());
        let task_req = req.clone();
        let span = info_span!("reconcile", controller = %self.name(), id = %req.id);
        let mut handle = tokio::spawn(async move { reconciler.reconcile(&rt, &task_req).await }.instrument(span));

        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = tokio::time::sleep(timeout) => None,
            _ = cancel.cancelled() => None,
        };
        let result = match joined {
            Some(Ok(r)) => r,
            Some(Err(e)) if e.is_panic() => Err(Error::Other(anyhow::anyhow!("reconciler panicked: {}", panic_message(e)))),
            Some(Err(_)) => Err(Error::Canceled),
            None => {
                // the aborted pass must be gone before the request is released
                pass.cancel();
                handle.abort();
                let _ = handle.await;
                if cancel.is_cancelled() {
                    Err(Error::Canceled)
                } else {
                    Err(Error::Other(anyhow::anyhow!("reconcile timed out after {:?}", timeout)))
                }
            }
        };
        histogram!("controller_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => self.name().to_string());

        let (outcome, retry) = match result {
            Ok(()) => {
                queue.forget(req);
                let again = self.controller.force_reconcile_every.filter(|_| {
                    matches!(self.runtime.cache.read(&req.id), Ok(Some(_)))
                });
                debug!(controller = %self.name(), id = %req.id, "reconciled");
                ("success", again)
            }
            Err(Error::Requeue(after)) => {
                debug!(controller = %self.name(), id = %req.id, after = ?after, "requeue requested");
                ("requeue", Some(after))
            }
            Err(Error::Canceled) => {
                debug!(controller = %self.name(), id = %req.id, "reconcile canceled; requeued");
                ("canceled", Some(Duration::ZERO))
            }
            Err(e) => {
                let delay = self.backoff.delay(queue.record_failure(req));
                error!(controller = %self.name(), id = %req.id, error = %e, retry_in = ?delay, "reconcile failed");
                ("error", Some(delay))
            }
        };
        counter!("controller_reconcile_total", 1u64, "controller" => self.name().to_string(), "outcome" => outcome);
        retry
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
