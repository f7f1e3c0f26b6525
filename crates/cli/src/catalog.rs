//! Replica catalog read from a JSON file
//!
//! ```json
//! {
//!   "sites": { "cmssrm.fnal.gov": "T1_US_FNAL" },
//!   "files": {
//!     "/store/mc/sample/file.root": {
//!       "size": 1048576,
//!       "replicas": [{ "node": "cmssrm.fnal.gov", "location": "srm://cmssrm.fnal.gov/..." }]
//!     }
//!   }
//! }
//! ```

use anyhow::Context;
use async_trait::async_trait;
use filemover_core::{Lfn, LocationResolver, ReplicaSet, ResolveError, SiteNameMapper};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Replica catalog and site names loaded from JSON
#[derive(Debug, Default, Deserialize)]
pub struct StaticCatalog {
    /// Storage node to site name
    #[serde(default)]
    sites: HashMap<String, String>,
    #[serde(default)]
    files: HashMap<String, ReplicaSet>,
}

impl StaticCatalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing catalog {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let catalog: Self = serde_json::from_str(text)?;
        for name in catalog.files.keys() {
            Lfn::parse(name)?;
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl LocationResolver for StaticCatalog {
    async fn resolve(&self, lfn: &Lfn, _protocol: &str) -> Result<ReplicaSet, ResolveError> {
        self.files
            .get(lfn.as_str())
            .filter(|set| !set.replicas.is_empty())
            .cloned()
            .ok_or_else(|| ResolveError::NoReplicas(lfn.to_string()))
    }
}

impl SiteNameMapper for StaticCatalog {
    fn site_name(&self, node: &str) -> Option<String> {
        self.sites.get(node).cloned()
    }
}
