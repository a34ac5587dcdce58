//! Explicit type registration handed to the storage backend at startup.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::resource::{Resource, Tenancy, Type, DEFAULT_NAMESPACE, DEFAULT_PARTITION};

/// Tenancy granularity a type lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Partition,
    Namespace,
}

impl Scope {
    /// Fill defaults and clear components the scope does not carry.
    pub fn normalize(self, tenancy: &mut Tenancy) {
        match self {
            Scope::Cluster => {
                tenancy.partition.clear();
                tenancy.namespace.clear();
            }
            Scope::Partition => {
                if tenancy.partition.is_empty() {
                    tenancy.partition = DEFAULT_PARTITION.to_string();
                }
                tenancy.namespace.clear();
            }
            Scope::Namespace => {
                if tenancy.partition.is_empty() {
                    tenancy.partition = DEFAULT_PARTITION.to_string();
                }
                if tenancy.namespace.is_empty() {
                    tenancy.namespace = DEFAULT_NAMESPACE.to_string();
                }
            }
        }
    }
}

pub type MutateHook = fn(&mut Resource) -> Result<()>;
pub type ValidateHook = fn(&Resource) -> Result<()>;

#[derive(Debug, Clone)]
pub struct Registration {
    pub ty: Type,
    pub scope: Scope,
    pub mutate: Option<MutateHook>,
    pub validate: Option<ValidateHook>,
}

impl Registration {
    pub fn new(ty: Type, scope: Scope) -> Self {
        Self { ty, scope, mutate: None, validate: None }
    }

    pub fn with_mutate(mut self, hook: MutateHook) -> Self {
        self.mutate = Some(hook);
        self
    }

    pub fn with_validate(mut self, hook: ValidateHook) -> Self {
        self.validate = Some(hook);
        self
    }
}

/// Set of registered types. Built once and passed to whoever needs it.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    types: BTreeMap<Type, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics on duplicate registration.
    pub fn register(&mut self, reg: Registration) {
        if self.types.contains_key(&reg.ty) {
            panic!("resource type {} already registered", reg.ty);
        }
        self.types.insert(reg.ty.clone(), reg);
    }

    pub fn get(&self, ty: &Type) -> Option<&Registration> {
        self.types.get(ty)
    }

    pub fn types(&self) -> impl Iterator<Item = &Type> {
        self.types.keys()
    }
}
