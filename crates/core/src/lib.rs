//! FileMover transfer engine
//!
//! Accepts requests to fetch logical files (LFNs) from remote storage
//! sites into a local pool, deduplicates concurrent requests, runs an
//! external copy tool per transfer and reports progress.

pub mod activity;
pub mod config;
pub mod lfn;
pub mod locator;
pub mod manager;
pub mod quota;
pub mod resolution_cache;
pub mod site_selector;
pub mod status;
pub mod supervisor;
pub mod transfer;
pub mod worker_pool;

pub use activity::{ActivityId, ActivityLog};
pub use config::{ConfigError, ManagerConfig};
pub use lfn::{Lfn, LfnError};
pub use locator::{
    LocateError, LocationResolver, Replica, ReplicaSet, ResolvedLocation, SiteNameMapper,
    SourceLocator, StaticSiteMapper,
};
pub use manager::{Admission, ManagerError, TransferManager, ROOT_USER};
pub use quota::{QuotaConfig, QuotaError, UserQuota};
pub use resolution_cache::{ResolutionCache, ResolveError, ResourceLookup};
pub use site_selector::{PriorityTable, SiteId, SiteSelectionError, SiteSelector};
pub use status::{StatusCode, TransferStatus};
pub use supervisor::{SupervisorError, TransferCommand, TransferSupervisor};
pub use transfer::{TransferError, TransferRequest, TransferSettings};
pub use worker_pool::{PoolError, PoolTask, WorkerPool, WorkerPoolConfig};
