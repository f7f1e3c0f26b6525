//! Priority based source site selection

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Default priority rules: US Tier-1 first, then any Tier-2, then other Tier-1s.
pub const DEFAULT_PRIORITY_RULES: [(u32, &str); 3] = [(0, "T1_US"), (1, "T2"), (2, "T1")];

/// Storage site name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Site selection errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteSelectionError {
    #[error("Could not match site to any priority; possible sources: {0}")]
    NoMatchingSite(String),
    #[error("Priority rule table is empty")]
    EmptyTable,
    #[error("Invalid pattern {pattern:?} for priority {priority}: {reason}")]
    InvalidPattern {
        priority: u32,
        pattern: String,
        reason: String,
    },
}

/// Priority level to site pattern, lower levels tried first.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    rules: BTreeMap<u32, Regex>,
}

impl PriorityTable {
    pub fn new<S: AsRef<str>>(rules: impl IntoIterator<Item = (u32, S)>) -> Result<Self, SiteSelectionError> {
        let mut compiled = BTreeMap::new();
        for (priority, pattern) in rules {
            let pattern = pattern.as_ref();
            let regex = Regex::new(pattern).map_err(|e| SiteSelectionError::InvalidPattern {
                priority,
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
            compiled.insert(priority, regex);
        }
        if compiled.is_empty() {
            return Err(SiteSelectionError::EmptyTable);
        }
        Ok(Self { rules: compiled })
    }

    pub fn levels(&self) -> impl Iterator<Item = (u32, &str)> {
        self.rules.iter().map(|(p, r)| (*p, r.as_str()))
    }

    fn matches_any(&self, site: &SiteId) -> bool {
        self.rules.values().any(|r| r.is_match(site.as_str()))
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        let rules = DEFAULT_PRIORITY_RULES
            .iter()
            .filter_map(|(p, pattern)| Regex::new(pattern).ok().map(|r| (*p, r)))
            .collect();
        Self { rules }
    }
}

/// Priority based source site choice
#[derive(Debug, Clone, Default)]
pub struct SiteSelector {
    table: PriorityTable,
}

impl SiteSelector {
    pub fn new(table: PriorityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PriorityTable {
        &self.table
    }

    /// Pick the first candidate matching the lowest priority level, skipping
    /// excluded sites. Patterns are searched anywhere in the site name.
    pub fn pick_site(&self, candidates: &[SiteId], exclude: &HashSet<SiteId>) -> Result<SiteId, SiteSelectionError> {
        for pattern in self.table.rules.values() {
            let hit = candidates
                .iter()
                .filter(|site| !exclude.contains(*site))
                .find(|site| pattern.is_match(site.as_str()));
            if let Some(site) = hit {
                return Ok(site.clone());
            }
        }

        let names: Vec<&str> = candidates.iter().map(SiteId::as_str).collect();
        Err(SiteSelectionError::NoMatchingSite(names.join(", ")))
    }

    /// Candidates that some priority level would ever accept, deduplicated,
    /// in input order.
    pub fn eligible(&self, candidates: &[SiteId]) -> Vec<SiteId> {
        let mut seen = HashSet::new();
        candidates
            .iter()
            .filter(|site| self.table.matches_any(site))
            .filter(|site| seen.insert((*site).clone()))
            .cloned()
            .collect()
    }
}
