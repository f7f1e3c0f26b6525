//! Transfer manager
//!
//! The façade every front end talks to. It:
//! - validates LFNs before touching anything
//! - shares one `TransferRequest` between all users asking for the same LFN
//! - enforces per-user quotas (except for root)
//! - keeps failed LFNs in a sticky failure table until they are re-requested
//! - owns the worker pool, the pool sweeper and the optional download area
//!
//! All bookkeeping sits behind one lock that is never held across an await.

use filemover_storage::{
    CacheSweeper, DownloadArea, DownloadEntry, StorageError, StoragePool, SweepReport, SweeperConfig,
};
use chrono::Duration as ChronoDuration;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityLog;
use crate::config::{ConfigError, ManagerConfig};
use crate::lfn::{Lfn, LfnError};
use crate::locator::{LocationResolver, SiteNameMapper, SourceLocator};
use crate::quota::{QuotaError, UserQuota};
use crate::site_selector::{SiteId, SiteSelector};
use crate::status::TransferStatus;
use crate::transfer::{TransferError, TransferRequest, TransferSettings};
use crate::worker_pool::{PoolError, WorkerPool};

/// Identity allowed to cancel any request and exempt from quotas
pub const ROOT_USER: &str = "root";

/// Transfer manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("File manager has not been configured")]
    NotConfigured,
    #[error(transparent)]
    InvalidLfn(#[from] LfnError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Request for {lfn} failed: {source}")]
    Admission {
        lfn: Lfn,
        #[source]
        source: TransferError,
    },
    #[error("{0} has not finished transferring")]
    NotComplete(Lfn),
    #[error("No download area is configured")]
    NoDownloadArea,
}

/// What `request` did with the caller's interest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new transfer was created and queued
    Queued,
    /// The caller joined a transfer another user already started
    Joined,
    /// The caller already held this LFN
    AlreadyRequested,
}

struct Engine {
    config: ManagerConfig,
    pool: StoragePool,
    locator: Arc<SourceLocator>,
    settings: Arc<TransferSettings>,
    workers: WorkerPool,
    sweeper: CacheSweeper,
    quota: UserQuota,
    downloads: Option<DownloadArea>,
}

#[derive(Default)]
struct RequestBook {
    requests: HashMap<Lfn, Arc<TransferRequest>>,
    users_by_lfn: HashMap<Lfn, HashSet<String>>,
    lfns_by_user: HashMap<String, HashSet<Lfn>>,
    failed: HashMap<Lfn, TransferStatus>,
}

impl RequestBook {
    fn holds(&self, user: &str, lfn: &Lfn) -> bool {
        self.lfns_by_user.get(user).map_or(false, |l| l.contains(lfn))
    }

    /// LFNs the user holds that are still being worked on. Only reads the
    /// requests' done flags; nothing is polled under the book lock.
    fn active_for(&self, user: &str) -> usize {
        self.lfns_by_user.get(user).map_or(0, |lfns| {
            lfns.iter()
                .filter(|lfn| self.requests.get(*lfn).map_or(false, |t| !t.is_done()))
                .count()
        })
    }

    fn add_interest(&mut self, lfn: &Lfn, user: &str) {
        self.lfns_by_user
            .entry(user.to_string())
            .or_default()
            .insert(lfn.clone());
        self.users_by_lfn
            .entry(lfn.clone())
            .or_default()
            .insert(user.to_string());
    }

    /// Drop one user's interest; returns how many users remain.
    fn remove_interest(&mut self, lfn: &Lfn, user: &str) -> usize {
        if let Some(lfns) = self.lfns_by_user.get_mut(user) {
            lfns.remove(lfn);
            if lfns.is_empty() {
                self.lfns_by_user.remove(user);
            }
        }
        match self.users_by_lfn.get_mut(lfn) {
            Some(users) => {
                users.remove(user);
                users.len()
            }
            None => 0,
        }
    }

    /// Stop tracking `lfn` altogether, for every user.
    fn forget(&mut self, lfn: &Lfn) -> Option<Arc<TransferRequest>> {
        for user in self.users_by_lfn.remove(lfn).unwrap_or_default() {
            if let Some(lfns) = self.lfns_by_user.get_mut(&user) {
                lfns.remove(lfn);
                if lfns.is_empty() {
                    self.lfns_by_user.remove(&user);
                }
            }
        }
        self.requests.remove(lfn)
    }

    /// `forget`, but only if `lfn` is still tracked by `transfer`.
    fn forget_if(&mut self, lfn: &Lfn, transfer: &Arc<TransferRequest>) -> bool {
        let current = self
            .requests
            .get(lfn)
            .map_or(false, |t| Arc::ptr_eq(t, transfer));
        if current {
            self.forget(lfn);
        }
        current
    }
}

/// Explicitly constructed, shared service object; wrap it in an `Arc` and
/// hand it to whichever front end needs it.
pub struct TransferManager {
    resolver: Arc<dyn LocationResolver>,
    mapper: Arc<dyn SiteNameMapper>,
    activity: Arc<ActivityLog>,
    engine: Mutex<Option<Arc<Engine>>>,
    book: Mutex<RequestBook>,
}

impl TransferManager {
    pub fn new(resolver: Arc<dyn LocationResolver>, mapper: Arc<dyn SiteNameMapper>) -> Self {
        Self {
            resolver,
            mapper,
            activity: Arc::new(ActivityLog::new()),
            engine: Mutex::new(None),
            book: Mutex::new(RequestBook::default()),
        }
    }

    fn book(&self) -> MutexGuard<'_, RequestBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn engine_slot(&self) -> MutexGuard<'_, Option<Arc<Engine>>> {
        self.engine.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn engine(&self) -> Result<Arc<Engine>, ManagerError> {
        self.engine_slot().clone().ok_or(ManagerError::NotConfigured)
    }

    pub fn is_configured(&self) -> bool {
        self.engine_slot().is_some()
    }

    /// Validate `config`, open the pool and start the workers and sweeper.
    /// A second call is a no-op. Must run inside a tokio runtime.
    pub fn configure(&self, config: ManagerConfig) -> Result<(), ManagerError> {
        let mut slot = self.engine_slot();
        if slot.is_some() {
            debug!("File manager already configured");
            return Ok(());
        }

        config.validate()?;
        let pool = StoragePool::open(config.base_directory.clone())?;
        let selector = SiteSelector::new(config.priority_table()?);
        let locator = Arc::new(SourceLocator::new(
            self.resolver.clone(),
            self.mapper.clone(),
            selector,
            config.protocol.clone(),
            config.location_ttl,
        ));
        let settings = Arc::new(TransferSettings {
            command: config.command()?,
            poll_interval: config.poll_interval,
        });
        let downloads = config
            .download_area
            .as_ref()
            .map(|root| DownloadArea::new(root.clone(), pool.clone()));
        let sweeper = CacheSweeper::start(SweeperConfig {
            root: pool.store_root(),
            quota_bytes: config.quota_bytes(),
            interval: config.sweep_interval,
        });
        let workers = WorkerPool::new(config.worker_pool());

        info!(
            base = %config.base_directory.display(),
            max_size_gb = config.max_size_gb,
            movers = config.max_movers,
            protocol = %config.protocol,
            "File manager configured"
        );

        *slot = Some(Arc::new(Engine {
            quota: UserQuota::new(config.quota()),
            config,
            pool,
            locator,
            settings,
            workers,
            sweeper,
            downloads,
        }));
        Ok(())
    }

    pub fn config(&self) -> Option<ManagerConfig> {
        self.engine_slot().as_ref().map(|e| e.config.clone())
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    /// Register `user`'s interest in `lfn`, starting a transfer if nobody
    /// else has. Clears any recorded failure for `lfn`.
    pub async fn request(&self, lfn: &str, user: &str) -> Result<Admission, ManagerError> {
        let lfn = Lfn::parse(lfn)?;
        let engine = self.engine()?;
        self.prune_activity(&engine);

        let transfer = {
            let mut book = self.book();
            if book.holds(user, &lfn) {
                debug!(lfn = %lfn, user, "User already holds this LFN");
                return Ok(Admission::AlreadyRequested);
            }
            if user != ROOT_USER {
                engine.quota.admit(user, book.active_for(user))?;
            }
            if book.failed.remove(&lfn).is_some() {
                info!(lfn = %lfn, user, "Clearing previous failure for a fresh request");
            }
            book.add_interest(&lfn, user);
            if book.requests.contains_key(&lfn) {
                info!(lfn = %lfn, user, "Joining existing transfer");
                return Ok(Admission::Joined);
            }

            let transfer = Arc::new(TransferRequest::new(
                lfn.clone(),
                engine.pool.clone(),
                engine.locator.clone(),
                engine.settings.clone(),
                self.activity.clone(),
                user,
            ));
            book.requests.insert(lfn.clone(), transfer.clone());
            transfer
        };

        if let Err(source) = transfer.request().await {
            warn!(lfn = %lfn, user, error = %source, "Unable to set up transfer");
            {
                let mut book = self.book();
                if book.forget_if(&lfn, &transfer) {
                    book.failed
                        .insert(lfn.clone(), TransferStatus::failed(source.to_string()));
                }
            }
            transfer.finish();
            return Err(ManagerError::Admission { lfn, source });
        }

        if let Err(e) = engine.workers.queue(transfer.clone()) {
            error!(lfn = %lfn, error = %e, "Unable to queue transfer");
            self.book().forget_if(&lfn, &transfer);
            transfer.finish();
            return Err(e.into());
        }

        info!(lfn = %lfn, user, "Transfer queued");
        Ok(Admission::Queued)
    }

    /// Withdraw `user`'s interest in `lfn`. The transfer itself is cancelled
    /// once nobody else wants it, or right away when `user` is root.
    /// Returns whether a transfer was cancelled.
    pub async fn cancel(&self, lfn: &str, user: &str) -> Result<bool, ManagerError> {
        let lfn = Lfn::parse(lfn)?;

        let transfer = {
            let mut book = self.book();
            if !book.requests.contains_key(&lfn) {
                info!(lfn = %lfn, user, "Cancel requested for an LFN that is not being transferred");
                return Ok(false);
            }
            let forced = user == ROOT_USER;
            if !forced && !book.holds(user, &lfn) {
                info!(lfn = %lfn, user, "LFN was not requested by this user; not cancelling");
                return Ok(false);
            }

            let remaining = book.remove_interest(&lfn, user);
            if forced {
                info!(lfn = %lfn, "Root cancelling transfer");
                book.forget(&lfn)
            } else if remaining == 0 {
                book.forget(&lfn)
            } else {
                let users = book
                    .users_by_lfn
                    .get(&lfn)
                    .map(|u| u.iter().cloned().collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                info!(lfn = %lfn, user, still_requested_by = %users, "Other users still want this LFN; not cancelling");
                None
            }
        };

        match transfer {
            Some(transfer) => {
                info!(lfn = %lfn, user, "Sending cancel to transfer");
                transfer.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current status of `lfn`. Failures become sticky: the LFN leaves
    /// tracking and the failure is reported until it is requested again.
    pub async fn status(&self, lfn: &str) -> Result<TransferStatus, ManagerError> {
        let lfn = Lfn::parse(lfn)?;

        let transfer = {
            let book = self.book();
            if let Some(failure) = book.failed.get(&lfn) {
                return Ok(failure.clone());
            }
            match book.requests.get(&lfn) {
                Some(transfer) => transfer.clone(),
                None => return Ok(TransferStatus::not_requested()),
            }
        };

        let status = match transfer.status().await {
            Ok(status) => status,
            Err(e) => {
                error!(lfn = %lfn, error = %e, "Unable to determine transfer status");
                return Ok(TransferStatus::unknown());
            }
        };

        if status.is_failure() {
            let recorded = {
                let mut book = self.book();
                let recorded = book.forget_if(&lfn, &transfer);
                if recorded {
                    book.failed.insert(lfn.clone(), status.clone());
                }
                recorded
            };
            if recorded {
                warn!(lfn = %lfn, status = %status, "Transfer failed; recording failure");
                transfer.finish();
            }
        }
        Ok(status)
    }

    /// LFNs `user` currently holds, sorted.
    pub fn requests_for(&self, user: &str) -> Vec<Lfn> {
        let mut lfns: Vec<Lfn> = self
            .book()
            .lfns_by_user
            .get(user)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default();
        lfns.sort();
        lfns
    }

    /// Users sharing the transfer of `lfn`, sorted.
    pub fn interested_users(&self, lfn: &Lfn) -> Vec<String> {
        let mut users: Vec<String> = self
            .book()
            .users_by_lfn
            .get(lfn)
            .map(|u| u.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Plain text history of the tracked transfer of `lfn`.
    pub fn activity_report(&self, lfn: &Lfn) -> Option<String> {
        let id = self.book().requests.get(lfn).map(|t| t.activity_id())?;
        self.activity.render(id)
    }

    pub async fn sweep_now(&self) -> Result<SweepReport, ManagerError> {
        Ok(self.engine()?.sweeper.sweep_now().await?)
    }

    /// Link a completed transfer into `user`'s download area.
    pub fn publish(&self, lfn: &str, user: &str) -> Result<PathBuf, ManagerError> {
        let lfn = Lfn::parse(lfn)?;
        let engine = self.engine()?;
        let downloads = engine.downloads.as_ref().ok_or(ManagerError::NoDownloadArea)?;

        let done = {
            let book = self.book();
            (user == ROOT_USER || book.holds(user, &lfn))
                && book.requests.get(&lfn).map_or(false, |t| t.is_done())
        };
        if !done {
            return Err(ManagerError::NotComplete(lfn));
        }
        let link = downloads.publish(user, lfn.relative_path())?;
        info!(lfn = %lfn, user, link = %link.display(), "Published file to download area");
        Ok(link)
    }

    /// Cancel `user`'s interest and drop the file from their download
    /// area. Returns whether the pool copy was deleted too.
    pub async fn remove(&self, lfn: &str, user: &str) -> Result<bool, ManagerError> {
        let parsed = Lfn::parse(lfn)?;
        let engine = self.engine()?;
        let downloads = engine.downloads.as_ref().ok_or(ManagerError::NoDownloadArea)?;

        self.cancel(lfn, user).await?;
        let removed = downloads.remove(user, parsed.relative_path())?;
        info!(lfn = %parsed, user, pool_copy_removed = removed, "Removed file from download area");
        Ok(removed)
    }

    pub fn downloads(&self, user: &str) -> Result<Vec<DownloadEntry>, ManagerError> {
        let engine = self.engine()?;
        let downloads = engine.downloads.as_ref().ok_or(ManagerError::NoDownloadArea)?;
        Ok(downloads.list(user)?)
    }

    /// Drop ended activity records older than the configured retention.
    fn prune_activity(&self, engine: &Engine) {
        let retention = ChronoDuration::from_std(engine.config.activity_retention)
            .unwrap_or_else(|_| ChronoDuration::days(365));
        let pruned = self.activity.prune(retention);
        if pruned > 0 {
            debug!(pruned, remaining = self.activity.len(), "Pruned ended activities");
        }
    }

    /// Stop choosing `site` as a source until `mark_site_up`.
    pub fn mark_site_down(&self, site: &str) -> Result<(), ManagerError> {
        self.engine()?.locator.mark_down(SiteId::new(site));
        Ok(())
    }

    pub fn mark_site_up(&self, site: &str) -> Result<(), ManagerError> {
        self.engine()?.locator.mark_up(&SiteId::new(site));
        Ok(())
    }

    /// Stop accepting work and wait for queued transfers to finish.
    pub async fn graceful_exit(&self) -> Result<(), ManagerError> {
        let engine = self.engine()?;
        info!("Draining transfer workers");
        engine.workers.drain();
        engine.workers.join().await?;
        Ok(())
    }

    /// `graceful_exit`, then cancel whatever is still live and stop the
    /// sweeper. The manager is unconfigured afterwards.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let Some(engine) = self.engine_slot().take() else {
            return Ok(());
        };
        engine.workers.drain();
        let joined = engine.workers.join().await;

        let live: Vec<Arc<TransferRequest>> = {
            let mut book = self.book();
            let lfns: Vec<Lfn> = book
                .requests
                .iter()
                .filter(|(_, t)| !t.is_done())
                .map(|(lfn, _)| lfn.clone())
                .collect();
            lfns.iter().filter_map(|lfn| book.forget(lfn)).collect()
        };
        for transfer in live {
            warn!(lfn = %transfer.lfn(), "Cancelling unfinished transfer at shutdown");
            transfer.cancel();
        }

        engine.sweeper.stop().await;
        info!("File manager shut down");
        Ok(joined?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{ReplicaSet, StaticSiteMapper};
    use crate::resolution_cache::ResolveError;
    use crate::status::StatusCode;
    use async_trait::async_trait;

    struct NoCatalog;

    #[async_trait]
    impl LocationResolver for NoCatalog {
        async fn resolve(&self, lfn: &Lfn, _protocol: &str) -> Result<ReplicaSet, ResolveError> {
            Err(ResolveError::NoReplicas(lfn.to_string()))
        }
    }

    fn manager() -> TransferManager {
        TransferManager::new(Arc::new(NoCatalog), Arc::new(StaticSiteMapper::default()))
    }

    fn config(base: &std::path::Path) -> ManagerConfig {
        ManagerConfig {
            base_directory: base.to_path_buf(),
            transfer_command: "/bin/false".into(),
            max_movers: 1,
            ..ManagerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_requires_configuration() {
        let manager = manager();
        assert!(!manager.is_configured());
        assert!(matches!(
            manager.request("/store/a/b.root", "alice").await,
            Err(ManagerError::NotConfigured)
        ));
        assert_eq!(
            manager.status("/store/a/b.root").await.unwrap(),
            TransferStatus::not_requested()
        );
    }

    #[tokio::test]
    async fn test_configure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.configure(config(dir.path())).unwrap();
        let other = tempfile::tempdir().unwrap();
        manager.configure(config(other.path())).unwrap();
        assert_eq!(manager.config().unwrap().base_directory, dir.path());
        manager.shutdown().await.unwrap();
        assert!(!manager.is_configured());
    }

    #[tokio::test]
    async fn test_configure_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        let mut bad = config(dir.path());
        bad.max_movers = 0;
        assert!(matches!(manager.configure(bad), Err(ManagerError::Config(_))));
        assert!(!manager.is_configured());
    }

    #[tokio::test]
    async fn test_admission_failure_is_sticky_until_requested_again() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.configure(config(dir.path())).unwrap();

        let err = manager.request("/store/a/b.root", "alice").await.unwrap_err();
        assert!(matches!(err, ManagerError::Admission { .. }));
        assert!(manager.requests_for("alice").is_empty());

        let status = manager.status("/store/a/b.root").await.unwrap();
        assert_eq!(status.code, StatusCode::Failed);
        assert!(status.message.contains("/store/a/b.root"));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ended_activities_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        let mut config = config(dir.path());
        config.activity_retention = std::time::Duration::ZERO;
        manager.configure(config).unwrap();

        assert!(manager.request("/store/a/b.root", "alice").await.is_err());
        assert_eq!(manager.activity().len(), 1);
        assert_eq!(manager.activity().active(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(manager.request("/store/a/c.root", "alice").await.is_err());
        // Only the second request's record is left.
        assert_eq!(manager.activity().len(), 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_rejection_keeps_recorded_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        let mut config = config(dir.path());
        config.day_transfer = 1;
        manager.configure(config).unwrap();

        assert!(matches!(
            manager.request("/store/a/b.root", "alice").await,
            Err(ManagerError::Admission { .. })
        ));
        assert!(matches!(
            manager.request("/store/a/b.root", "alice").await,
            Err(ManagerError::QuotaExceeded(QuotaError::DailyLimit { limit: 1 }))
        ));
        assert_eq!(
            manager.status("/store/a/b.root").await.unwrap().code,
            StatusCode::Failed
        );

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_site_marking_requires_configuration() {
        let manager = manager();
        assert!(matches!(manager.mark_site_down("T1_US_FNAL"), Err(ManagerError::NotConfigured)));
        let dir = tempfile::tempdir().unwrap();
        manager.configure(config(dir.path())).unwrap();
        manager.mark_site_down("T1_US_FNAL").unwrap();
        manager.mark_site_up("T1_US_FNAL").unwrap();
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_untracked_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.configure(config(dir.path())).unwrap();
        assert!(!manager.cancel("/store/a/b.root", "alice").await.unwrap());
        assert!(!manager.cancel("/store/a/b.root", ROOT_USER).await.unwrap());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_area_required() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.configure(config(dir.path())).unwrap();
        assert!(matches!(
            manager.publish("/store/a/b.root", "alice"),
            Err(ManagerError::NoDownloadArea)
        ));
        manager.shutdown().await.unwrap();
    }
}
