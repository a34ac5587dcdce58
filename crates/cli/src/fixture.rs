//! Resource fixture files: a YAML (or JSON) list of resources to seed the
//! in-memory backend with.
//!
//! ```yaml
//! - type: catalog/v2beta1/Service
//!   namespace: default
//!   name: api
//!   data:
//!     workloads: { prefixes: ["api-"] }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use weft_core::{Id, Resource, Tenancy, Type};

#[derive(Debug, Deserialize)]
pub struct Entry {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Entry {
    /// Empty tenancy components are left for the type's scope to fill in.
    pub fn into_resource(self) -> Result<Resource> {
        let ty: Type = self.ty.parse().with_context(|| format!("resource {}", self.name))?;
        let tenancy = Tenancy::new(self.partition, self.namespace);
        Ok(Resource::new(Id::new(ty, tenancy, self.name), self.data))
    }
}

pub fn parse(text: &str) -> Result<Vec<Resource>> {
    let entries: Vec<Entry> = serde_yaml::from_str(text).context("parse fixture")?;
    entries.into_iter().map(Entry::into_resource).collect()
}

pub fn load(path: &Path) -> Result<Vec<Resource>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read fixture {}", path.display()))?;
    parse(&text).with_context(|| format!("fixture {}", path.display()))
}
