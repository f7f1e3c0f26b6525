//! Per-LFN transfer state machine
//!
//! A `TransferRequest` is shared by every user interested in one LFN. It
//! resolves a source, launches a supervised copy and, when a copy fails,
//! quietly retries from another replica site until every known site has
//! been tried. Retries run inside `start`, so they hold the same pool
//! worker as the first attempt.

use async_trait::async_trait;
use filemover_storage::{StorageError, StoragePool};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::activity::{ActivityId, ActivityLog};
use crate::lfn::Lfn;
use crate::locator::{LocateError, ResolvedLocation, SourceLocator};
use crate::site_selector::SiteId;
use crate::status::{messages, StatusCode, TransferStatus};
use crate::supervisor::{SupervisorError, TransferCommand, TransferSupervisor};
use crate::worker_pool::{PoolTask, TaskError};

/// Transfer request errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("You must first request a file")]
    NotRequested,
    #[error("Transfer has already been started")]
    AlreadyStarted,
    #[error("No source has been resolved for {0}")]
    NotResolved(Lfn),
    #[error("Unable to find a source for {lfn}: {source}")]
    Locate {
        lfn: Lfn,
        #[source]
        source: LocateError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Settings shared by every transfer
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub command: TransferCommand,
    pub poll_interval: Duration,
}

#[derive(Default)]
struct RequestState {
    requested: bool,
    started: bool,
    cancelled: bool,
    cached: bool,
    /// The copy finished successfully.
    done: bool,
    /// `start` has returned; no further attempt will be made.
    settled: bool,
    location: Option<ResolvedLocation>,
    excluded: HashSet<SiteId>,
    supervisor: Option<Arc<TransferSupervisor>>,
}

/// Shared per-LFN transfer state machine
pub struct TransferRequest {
    lfn: Lfn,
    pool: StoragePool,
    locator: Arc<SourceLocator>,
    settings: Arc<TransferSettings>,
    activity: Arc<ActivityLog>,
    activity_id: ActivityId,
    state: Mutex<RequestState>,
}

impl TransferRequest {
    pub fn new(
        lfn: Lfn,
        pool: StoragePool,
        locator: Arc<SourceLocator>,
        settings: Arc<TransferSettings>,
        activity: Arc<ActivityLog>,
        user: &str,
    ) -> Self {
        let activity_id = activity.start(user, lfn.as_str());
        Self {
            lfn,
            pool,
            locator,
            settings,
            activity,
            activity_id,
            state: Mutex::new(RequestState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn lfn(&self) -> &Lfn {
        &self.lfn
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity_id
    }

    pub fn destination(&self) -> Result<PathBuf, StorageError> {
        self.pool.path_for(self.lfn.relative_path())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Sites already tried (or being tried) for this LFN.
    pub fn excluded_sites(&self) -> Vec<SiteId> {
        let mut sites: Vec<SiteId> = self.state().excluded.iter().cloned().collect();
        sites.sort();
        sites
    }

    pub fn current_site(&self) -> Option<SiteId> {
        self.state().location.as_ref().map(|l| l.site.clone())
    }

    /// True once the file sits complete in the pool. Never polls the copy
    /// tool.
    pub fn is_done(&self) -> bool {
        let state = self.state();
        !state.cancelled && (state.cached || state.done)
    }

    fn in_cache(&self) -> bool {
        self.pool.contains(self.lfn.relative_path())
    }

    /// Resolve a source (unless the file is already in the pool) and make
    /// sure the destination directory exists.
    pub async fn request(&self) -> Result<(), TransferError> {
        if self.in_cache() {
            info!(lfn = %self.lfn, "File already in pool; skipping source lookup");
            self.activity.event(self.activity_id, "File already present in the pool.");
            self.state().cached = true;
        } else {
            let exclude = self.state().excluded.clone();
            let location = self
                .locator
                .locate(&self.lfn, &exclude)
                .await
                .map_err(|source| TransferError::Locate {
                    lfn: self.lfn.clone(),
                    source,
                })?;
            self.activity.event(
                self.activity_id,
                format!("Resolved source {} at site {}.", location.source, location.site),
            );
            let mut state = self.state();
            state.excluded.insert(location.site.clone());
            state.location = Some(location);
        }

        self.pool.ensure_parent(self.lfn.relative_path())?;
        self.state().requested = true;
        Ok(())
    }

    fn new_supervisor(&self, location: &ResolvedLocation) -> Result<TransferSupervisor, TransferError> {
        Ok(TransferSupervisor::new(
            self.settings.command.clone(),
            location.source.clone(),
            self.destination()?,
            location.expected_size,
            self.settings.poll_interval,
        ))
    }

    /// Run the copy, retrying from other sites after failures. Blocks
    /// until the last attempt exits or the transfer is cancelled.
    pub async fn start(&self) -> Result<(), TransferError> {
        let first = {
            let mut state = self.state();
            if !state.requested {
                return Err(TransferError::NotRequested);
            }
            if state.started {
                return Err(TransferError::AlreadyStarted);
            }
            state.started = true;
            if state.cancelled {
                info!(lfn = %self.lfn, "Transfer cancelled before it started");
                state.settled = true;
                return Ok(());
            }
            if state.cached || self.in_cache() {
                info!(lfn = %self.lfn, "File in cache; no transfer needed");
                state.cached = true;
                state.settled = true;
                return Ok(());
            }
            let prepared = state
                .location
                .clone()
                .ok_or_else(|| TransferError::NotResolved(self.lfn.clone()))
                .and_then(|location| self.new_supervisor(&location));
            match prepared {
                Ok(supervisor) => {
                    let supervisor = Arc::new(supervisor);
                    state.supervisor = Some(supervisor.clone());
                    supervisor
                }
                Err(e) => {
                    state.settled = true;
                    return Err(e);
                }
            }
        };

        let mut supervisor = first;
        loop {
            let status = self.attempt(&supervisor).await;
            if status.code == StatusCode::Done {
                self.state().done = true;
            }
            if status.code != StatusCode::TransferFailed {
                break;
            }
            match self.relaunch_elsewhere(&status).await {
                Some(next) => supervisor = next,
                None => break,
            }
        }
        self.state().settled = true;
        Ok(())
    }

    /// Launch one copy and supervise it to the end.
    async fn attempt(&self, supervisor: &TransferSupervisor) -> TransferStatus {
        let command = supervisor.command_line();
        self.activity.command_start(self.activity_id, &command);
        // A spawn failure is recorded as the supervisor's final status.
        let status = match supervisor.launch().await {
            Ok(status) => status,
            Err(e) => {
                warn!(lfn = %self.lfn, error = %e, "Unable to launch transfer");
                supervisor.status()
            }
        };
        self.activity.command_end(self.activity_id, &command);
        self.activity
            .command_output(self.activity_id, &command, status.message.clone());
        status
    }

    pub async fn status(&self) -> Result<TransferStatus, TransferError> {
        let (supervisor, settled) = {
            let mut state = self.state();
            if state.cancelled {
                return Ok(TransferStatus::cancelled());
            }
            if state.cached {
                // A later fresh request starts from a clean slate.
                state.excluded.clear();
                return Ok(TransferStatus::cached());
            }
            match &state.supervisor {
                Some(supervisor) => (supervisor.clone(), state.settled),
                None if state.requested => return Ok(TransferStatus::requested()),
                None => {
                    return Ok(TransferStatus::new(
                        StatusCode::TransferWrapperNotLaunched,
                        messages::TRANSFER_WRAPPER_NOT_LAUNCHED,
                    ))
                }
            }
        };

        let status = supervisor.status();
        if status.code == StatusCode::Done {
            self.state().done = true;
        }
        if status.code == StatusCode::TransferFailed && !settled {
            // The worker is about to try another site.
            return Ok(TransferStatus::new(StatusCode::InProgress, messages::RETRYING));
        }
        Ok(status)
    }

    /// Prepare a copy from an untried site after a failed one. `None` once
    /// every known site has been tried or the transfer was cancelled.
    async fn relaunch_elsewhere(&self, failure: &TransferStatus) -> Option<Arc<TransferSupervisor>> {
        let exclude = {
            let state = self.state();
            if state.cancelled {
                return None;
            }
            let exhausted = state
                .location
                .as_ref()
                .map_or(true, |l| l.known_sites.iter().all(|s| state.excluded.contains(s)));
            if exhausted {
                info!(lfn = %self.lfn, tried = state.excluded.len(), "All replica sites tried; giving up");
                return None;
            }
            state.excluded.clone()
        };

        let location = match self.locator.locate(&self.lfn, &exclude).await {
            Ok(location) => location,
            Err(e) => {
                warn!(lfn = %self.lfn, error = %e, "No alternative source after failure");
                return None;
            }
        };

        let supervisor = {
            let mut state = self.state();
            if state.cancelled {
                return None;
            }
            let supervisor = match self.new_supervisor(&location) {
                Ok(supervisor) => Arc::new(supervisor),
                Err(e) => {
                    warn!(lfn = %self.lfn, error = %e, "Unable to prepare retry");
                    return None;
                }
            };
            state.excluded.insert(location.site.clone());
            state.location = Some(location.clone());
            state.supervisor = Some(supervisor.clone());
            supervisor
        };

        warn!(
            lfn = %self.lfn,
            site = %location.site,
            previous = %failure.message,
            "Transfer failed; retrying from another site"
        );
        self.activity.event(
            self.activity_id,
            format!("{} Retrying from site {}.", failure.message, location.site),
        );
        Some(supervisor)
    }

    /// Stop the transfer. Safe before start and after completion.
    pub fn cancel(&self) {
        let supervisor = {
            let mut state = self.state();
            state.cancelled = true;
            state.supervisor.clone()
        };
        match supervisor {
            Some(supervisor) => {
                info!(lfn = %self.lfn, "Passing cancel to the transfer supervisor");
                supervisor.cancel();
            }
            None => warn!(lfn = %self.lfn, "Cancelling a transfer which never started"),
        }
        self.activity.event(self.activity_id, messages::CANCELLED);
        self.activity.end(self.activity_id);
    }

    /// Close the activity record once the request leaves tracking.
    pub fn finish(&self) {
        self.activity.end(self.activity_id);
    }
}

#[async_trait]
impl PoolTask for TransferRequest {
    async fn start(&self) -> Result<(), TaskError> {
        TransferRequest::start(self).await.map_err(Into::into)
    }

    fn cancel(&self) {
        TransferRequest::cancel(self)
    }

    fn describe(&self) -> String {
        format!("transfer of {}", self.lfn)
    }
}
