use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Selects workloads by exact name or by name prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
}

impl WorkloadSelector {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { names: names.into_iter().map(Into::into).collect(), prefixes: Vec::new() }
    }

    pub fn with_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes.extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.prefixes.is_empty()
    }

    /// Structural equality treating both lists as sets.
    pub fn equivalent(&self, other: &WorkloadSelector) -> bool {
        fn set(v: &[String]) -> BTreeSet<&str> {
            v.iter().map(String::as_str).collect()
        }
        set(&self.names) == set(&other.names) && set(&self.prefixes) == set(&other.prefixes)
    }

    pub fn selects(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name) || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// Capability implemented by every payload that carries a workload selector.
pub trait SelectsWorkloads {
    fn workload_selector(&self) -> Option<&WorkloadSelector>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalence_ignores_order_and_duplicates() {
        let a = WorkloadSelector::names(["a", "b"]).with_prefixes(["x-"]);
        let b = WorkloadSelector::names(["b", "a", "a"]).with_prefixes(["x-"]);
        assert!(a.equivalent(&b));
        assert!(!a.equivalent(&WorkloadSelector::names(["a", "b"])));
    }

    #[test]
    fn selects_by_name_or_prefix() {
        let s = WorkloadSelector::names(["foo"]).with_prefixes(["api-"]);
        assert!(s.selects("foo"));
        assert!(s.selects("api-1"));
        assert!(!s.selects("bar"));
        assert!(!s.selects("fo"));
    }
}
