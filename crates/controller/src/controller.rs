//! Controller definition: one managed type, one reconciler, and the watches
//! whose changes are mapped onto reconcile requests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use weft_cache::{Index, Query};
use weft_core::{Request, Result, Type};

use crate::backoff::Backoff;
use crate::dependency::DependencyMapper;
use crate::Runtime;

#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Bring the resource named by `req` in line with its inputs. Must be
    /// convergent: write only when the desired state differs from storage.
    async fn reconcile(&self, rt: &Runtime, req: &Request) -> Result<()>;
}

/// Runs once before a controller starts consuming its queue; retried with
/// backoff until it succeeds.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self, rt: &Runtime) -> Result<()>;
}

#[async_trait]
impl<T: Reconciler + ?Sized> Reconciler for Arc<T> {
    async fn reconcile(&self, rt: &Runtime, req: &Request) -> Result<()> {
        (**self).reconcile(rt, req).await
    }
}

#[async_trait]
impl<T: Initializer + ?Sized> Initializer for Arc<T> {
    async fn initialize(&self, rt: &Runtime) -> Result<()> {
        (**self).initialize(rt).await
    }
}

pub type Hook = Arc<dyn Fn(&Runtime) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Runs only on the leader replica.
    #[default]
    Singleton,
    /// Runs on every replica.
    EachServer,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Singleton => f.write_str("singleton"),
            Placement::EachServer => f.write_str("each-server"),
        }
    }
}

#[derive(Clone)]
pub struct Watch {
    pub ty: Type,
    pub mapper: DependencyMapper,
    pub indexes: Vec<Index>,
}

pub struct Controller {
    pub(crate) name: String,
    pub(crate) managed_type: Type,
    pub(crate) managed_indexes: Vec<Index>,
    pub(crate) watches: Vec<Watch>,
    pub(crate) queries: Vec<(String, Query)>,
    pub(crate) backoff: Option<Backoff>,
    pub(crate) placement: Placement,
    pub(crate) reconciler: Option<Arc<dyn Reconciler>>,
    pub(crate) initializer: Option<Arc<dyn Initializer>>,
    pub(crate) force_reconcile_every: Option<Duration>,
    pub(crate) notify_start: Option<Hook>,
    pub(crate) notify_stop: Option<Hook>,
}

impl Controller {
    pub fn new(name: &str, managed_type: Type) -> Self {
        Self {
            name: name.to_string(),
            managed_type,
            managed_indexes: Vec::new(),
            watches: Vec::new(),
            queries: Vec::new(),
            backoff: None,
            placement: Placement::default(),
            reconciler: None,
            initializer: None,
            force_reconcile_every: None,
            notify_start: None,
            notify_stop: None,
        }
    }

    /// Indexes to register on the managed type.
    pub fn with_managed_indexes(mut self, indexes: Vec<Index>) -> Self {
        self.managed_indexes.extend(indexes);
        self
    }

    /// Panics if `ty` is already watched or is the managed type; a second
    /// mapper for the same type belongs in a [`crate::multi_mapper`].
    pub fn with_watch(mut self, ty: Type, mapper: DependencyMapper, indexes: Vec<Index>) -> Self {
        if ty == self.managed_type || self.watches.iter().any(|w| w.ty == ty) {
            panic!("controller {}: type {} is already watched", self.name, ty);
        }
        self.watches.push(Watch { ty, mapper, indexes });
        self
    }

    pub fn with_query(mut self, name: &str, query: Query) -> Self {
        self.queries.push((name.to_string(), query));
        self
    }

    /// Overrides the manager-wide backoff for this controller.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Some(Backoff::new(base, max));
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_reconciler(mut self, r: impl Reconciler + 'static) -> Self {
        self.reconciler = Some(Arc::new(r));
        self
    }

    pub fn with_initializer(mut self, i: impl Initializer + 'static) -> Self {
        self.initializer = Some(Arc::new(i));
        self
    }

    /// Reconcile every resource again `every` after its last successful pass.
    pub fn with_force_reconcile_every(mut self, every: Duration) -> Self {
        self.force_reconcile_every = Some(every);
        self
    }

    pub fn with_notify_start(mut self, hook: impl Fn(&Runtime) + Send + Sync + 'static) -> Self {
        self.notify_start = Some(Arc::new(hook));
        self
    }

    pub fn with_notify_stop(mut self, hook: impl Fn(&Runtime) + Send + Sync + 'static) -> Self {
        self.notify_stop = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn managed_type(&self) -> &Type { &self.managed_type }
    pub fn placement(&self) -> Placement { self.placement }
    pub fn watches(&self) -> &[Watch] { &self.watches }

    /// Every type this controller needs a feed for: the managed type first.
    pub fn watched_types(&self) -> Vec<Type> {
        std::iter::once(self.managed_type.clone()).chain(self.watches.iter().map(|w| w.ty.clone())).collect()
    }

    pub(crate) fn watch_for(&self, ty: &Type) -> Option<&Watch> {
        self.watches.iter().find(|w| &w.ty == ty)
    }

    /// Panics when the controller cannot run.
    pub(crate) fn validate(&self) {
        if self.reconciler.is_none() {
            panic!("controller {} has no reconciler", self.name);
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let watches: Vec<String> = self.watches.iter().map(|w| w.ty.to_string()).collect();
        let backoff = self.backoff.unwrap_or_default();
        write!(
            f,
            "<Controller name={} type={} watches=[{}] backoff=<base={:?}, max={:?}> placement={}>",
            self.name,
            self.managed_type,
            watches.join(", "),
            backoff.base,
            backoff.max,
            self.placement,
        )
    }
}
