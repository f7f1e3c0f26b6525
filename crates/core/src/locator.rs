//! LFN to transfer source resolution
//!
//! `SourceLocator` asks the pluggable `LocationResolver` where replicas of an
//! LFN live, maps storage nodes to site names, drops sites known to be down
//! and lets the `SiteSelector` choose. Concurrent catalog queries for the
//! same `(lfn, protocol)` are collapsed by a `ResolutionCache`, and the last
//! answer is remembered for a short TTL so status polling does not hammer
//! the catalog.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lfn::Lfn;
use crate::resolution_cache::{ResolutionCache, ResolveError, ResourceLookup};
use crate::site_selector::{SiteId, SiteSelectionError, SiteSelector};

/// How long a resolved location is reused when nothing is excluded
pub const DEFAULT_LOCATION_TTL: Duration = Duration::from_secs(10);

/// One copy of a file in the federation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Storage node holding the copy
    pub node: String,
    /// URL or path the copy tool reads from
    pub location: String,
}

/// Catalog answer for one LFN
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub replicas: Vec<Replica>,
}

/// Remote replica catalog
#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn resolve(&self, lfn: &Lfn, protocol: &str) -> Result<ReplicaSet, ResolveError>;
}

/// Maps storage node names to the site names priority rules match against.
pub trait SiteNameMapper: Send + Sync {
    /// `None` means the node name is used as the site name.
    fn site_name(&self, node: &str) -> Option<String>;
}

/// Fixed node to site table
#[derive(Debug, Clone, Default)]
pub struct StaticSiteMapper {
    sites: HashMap<String, String>,
}

impl StaticSiteMapper {
    pub fn new(sites: HashMap<String, String>) -> Self {
        Self { sites }
    }
}

impl SiteNameMapper for StaticSiteMapper {
    fn site_name(&self, node: &str) -> Option<String> {
        self.sites.get(node).cloned()
    }
}

/// Catalog lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocateKey {
    pub lfn: Lfn,
    pub protocol: String,
}

/// Where to fetch an LFN from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedLocation {
    pub source: String,
    pub site: SiteId,
    pub expected_size: Option<u64>,
    /// Every site that could serve this LFN
    pub known_sites: Vec<SiteId>,
}

/// Source location errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Selection(#[from] SiteSelectionError),
    #[error("The LFN {0} has no known replicas")]
    NoReplicas(Lfn),
}

struct CatalogLookup {
    resolver: Arc<dyn LocationResolver>,
}

#[async_trait]
impl ResourceLookup<LocateKey, ReplicaSet> for CatalogLookup {
    async fn lookup(&self, key: &LocateKey) -> Result<ReplicaSet, ResolveError> {
        info!(target: "locator", lfn = %key.lfn, protocol = %key.protocol, "Querying replica catalog");
        let replicas = self.resolver.resolve(&key.lfn, &key.protocol).await?;
        info!(
            target: "locator",
            lfn = %key.lfn,
            replicas = replicas.replicas.len(),
            "Catalog returned replicas"
        );
        Ok(replicas)
    }
}

/// Picks a transfer source for an LFN
pub struct SourceLocator {
    cache: ResolutionCache<LocateKey, ReplicaSet>,
    mapper: Arc<dyn SiteNameMapper>,
    selector: SiteSelector,
    protocol: String,
    ttl: Duration,
    recent: Mutex<HashMap<LocateKey, (ResolvedLocation, Instant)>>,
    down_sites: RwLock<HashSet<SiteId>>,
}

impl SourceLocator {
    pub fn new(
        resolver: Arc<dyn LocationResolver>,
        mapper: Arc<dyn SiteNameMapper>,
        selector: SiteSelector,
        protocol: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache: ResolutionCache::new(CatalogLookup { resolver }),
            mapper,
            selector,
            protocol: protocol.into(),
            ttl,
            recent: Mutex::new(HashMap::new()),
            down_sites: RwLock::new(HashSet::new()),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Find a source for `lfn`, never choosing a site in `exclude`.
    pub async fn locate(&self, lfn: &Lfn, exclude: &HashSet<SiteId>) -> Result<ResolvedLocation, LocateError> {
        let key = LocateKey {
            lfn: lfn.clone(),
            protocol: self.protocol.clone(),
        };

        if exclude.is_empty() {
            if let Some(location) = self.recent_location(&key) {
                debug!(target: "locator", lfn = %lfn, site = %location.site, "Reusing recent location");
                return Ok(location);
            }
        }

        let replicas = self.cache.acquire(&key).await?;
        let chosen = self.choose(lfn, &replicas, exclude);
        self.cache.release(&key);
        let location = chosen?;

        info!(
            target: "locator",
            lfn = %lfn,
            site = %location.site,
            source = %location.source,
            "Resolved transfer source"
        );
        let mut recent = self.recent_map();
        recent.retain(|_, (_, at)| at.elapsed() < self.ttl);
        recent.insert(key, (location.clone(), Instant::now()));
        drop(recent);
        Ok(location)
    }

    fn choose(&self, lfn: &Lfn, replicas: &ReplicaSet, exclude: &HashSet<SiteId>) -> Result<ResolvedLocation, LocateError> {
        if replicas.replicas.is_empty() {
            return Err(LocateError::NoReplicas(lfn.clone()));
        }

        let down = self.down_sites.read().unwrap_or_else(|p| p.into_inner());
        let candidates: Vec<(SiteId, &Replica)> = replicas
            .replicas
            .iter()
            .map(|r| {
                let name = self.mapper.site_name(&r.node).unwrap_or_else(|| r.node.clone());
                (SiteId::new(name), r)
            })
            .filter(|(site, _)| {
                let usable = !down.contains(site);
                if !usable {
                    debug!(target: "locator", site = %site, "Skipping site marked down");
                }
                usable
            })
            .collect();
        drop(down);

        let sites: Vec<SiteId> = candidates.iter().map(|(s, _)| s.clone()).collect();
        let site = self.selector.pick_site(&sites, exclude)?;
        let source = candidates
            .iter()
            .find(|(s, _)| *s == site)
            .map(|(_, r)| r.location.clone())
            .ok_or_else(|| LocateError::NoReplicas(lfn.clone()))?;

        Ok(ResolvedLocation {
            source,
            site,
            expected_size: replicas.size,
            known_sites: self.selector.eligible(&sites),
        })
    }

    fn recent_map(&self) -> std::sync::MutexGuard<'_, HashMap<LocateKey, (ResolvedLocation, Instant)>> {
        self.recent.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn recent_location(&self, key: &LocateKey) -> Option<ResolvedLocation> {
        let mut recent = self.recent_map();
        let fresh = match recent.get(key) {
            Some((location, at)) => (at.elapsed() < self.ttl).then(|| location.clone()),
            None => return None,
        };
        match fresh {
            Some(location) => {
                let down = self.down_sites.read().unwrap_or_else(|p| p.into_inner());
                (!down.contains(&location.site)).then_some(location)
            }
            None => {
                recent.remove(key);
                None
            }
        }
    }

    /// Stop choosing `site` until `mark_up` is called.
    pub fn mark_down(&self, site: SiteId) {
        warn!(target: "locator", site = %site, "Marking site down");
        self.down_sites
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(site);
    }

    pub fn mark_up(&self, site: &SiteId) {
        let removed = self
            .down_sites
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(site);
        if removed {
            info!(target: "locator", site = %site, "Site back up");
        }
    }

    pub fn down_sites(&self) -> Vec<SiteId> {
        let mut sites: Vec<SiteId> = self
            .down_sites
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        sites.sort();
        sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site_selector::PriorityTable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedCatalog {
        replicas: ReplicaSet,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LocationResolver for FixedCatalog {
        async fn resolve(&self, _lfn: &Lfn, _protocol: &str) -> Result<ReplicaSet, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.replicas.clone())
        }
    }

    fn replica(node: &str) -> Replica {
        Replica {
            node: node.to_string(),
            location: format!("srm://{node}/data/file.root"),
        }
    }

    fn locator(nodes: &[&str], mapper: StaticSiteMapper) -> (SourceLocator, Arc<FixedCatalog>) {
        let catalog = Arc::new(FixedCatalog {
            replicas: ReplicaSet {
                size: Some(1024),
                replicas: nodes.iter().map(|n| replica(n)).collect(),
            },
            calls: AtomicUsize::new(0),
        });
        let table = PriorityTable::new([(0, "T1_US"), (1, "T2")]).unwrap();
        let locator = SourceLocator::new(
            catalog.clone(),
            Arc::new(mapper),
            SiteSelector::new(table),
            "srmv2",
            DEFAULT_LOCATION_TTL,
        );
        (locator, catalog)
    }

    fn lfn() -> Lfn {
        Lfn::parse("/store/mc/a/b.root").unwrap()
    }

    #[tokio::test]
    async fn test_locate_prefers_priority_and_remembers() {
        let (locator, catalog) = locator(&["T2_DE_DESY", "T1_US_FNAL"], StaticSiteMapper::default());

        let first = locator.locate(&lfn(), &HashSet::new()).await.unwrap();
        assert_eq!(first.site.as_str(), "T1_US_FNAL");
        assert_eq!(first.source, "srm://T1_US_FNAL/data/file.root");
        assert_eq!(first.expected_size, Some(1024));
        assert_eq!(first.known_sites.len(), 2);

        let second = locator.locate(&lfn(), &HashSet::new()).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exclusion_bypasses_memo() {
        let (locator, catalog) = locator(&["T2_DE_DESY", "T1_US_FNAL"], StaticSiteMapper::default());
        locator.locate(&lfn(), &HashSet::new()).await.unwrap();

        let exclude = HashSet::from([SiteId::from("T1_US_FNAL")]);
        let retry = locator.locate(&lfn(), &exclude).await.unwrap();
        assert_eq!(retry.site.as_str(), "T2_DE_DESY");
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mapper_and_down_sites() {
        let mapper = StaticSiteMapper::new(HashMap::from([(
            "cmssrm.fnal.gov".to_string(),
            "T1_US_FNAL".to_string(),
        )]));
        let (locator, _) = locator(&["cmssrm.fnal.gov", "T2_IT_Bari"], mapper);

        let location = locator.locate(&lfn(), &HashSet::new()).await.unwrap();
        assert_eq!(location.site.as_str(), "T1_US_FNAL");
        assert_eq!(location.source, "srm://cmssrm.fnal.gov/data/file.root");

        locator.mark_down(SiteId::from("T1_US_FNAL"));
        let location = locator.locate(&lfn(), &HashSet::new()).await.unwrap();
        assert_eq!(location.site.as_str(), "T2_IT_Bari");
        assert_eq!(location.known_sites, vec![SiteId::from("T2_IT_Bari")]);

        locator.mark_up(&SiteId::from("T1_US_FNAL"));
        assert!(locator.down_sites().is_empty());
    }

    #[tokio::test]
    async fn test_expired_memo_entries_evicted_on_insert() {
        let catalog = Arc::new(FixedCatalog {
            replicas: ReplicaSet {
                size: None,
                replicas: vec![replica("T1_US_FNAL")],
            },
            calls: AtomicUsize::new(0),
        });
        let locator = SourceLocator::new(
            catalog,
            Arc::new(StaticSiteMapper::default()),
            SiteSelector::new(PriorityTable::new([(0, "T1_US")]).unwrap()),
            "srmv2",
            Duration::from_millis(20),
        );

        for name in ["/store/mc/a/one.root", "/store/mc/a/two.root"] {
            locator.locate(&Lfn::parse(name).unwrap(), &HashSet::new()).await.unwrap();
        }
        assert_eq!(locator.recent_map().len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        locator
            .locate(&Lfn::parse("/store/mc/a/three.root").unwrap(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(locator.recent_map().len(), 1);
    }

    #[tokio::test]
    async fn test_no_replicas() {
        let (locator, _) = locator(&[], StaticSiteMapper::default());
        assert!(matches!(
            locator.locate(&lfn(), &HashSet::new()).await,
            Err(LocateError::NoReplicas(_))
        ));
    }

    #[tokio::test]
    async fn test_no_matching_site() {
        let (locator, _) = locator(&["T3_XX_Nowhere"], StaticSiteMapper::default());
        assert!(matches!(
            locator.locate(&lfn(), &HashSet::new()).await,
            Err(LocateError::Selection(SiteSelectionError::NoMatchingSite(_)))
        ));
    }
}
