//! Fixed-size transfer worker pool
//!
//! A small number of long-lived worker tasks pull `PoolTask`s off a shared
//! FIFO queue and run each one to completion. The number of workers bounds
//! the number of concurrent physical transfers.
//!
//! Shutdown has two flavours:
//! - `drain()` stops accepting work; workers exit once the queue is empty
//! - `kill()` makes workers exit as soon as their current task returns

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Work the pool can run.
#[async_trait]
pub trait PoolTask: Send + Sync {
    /// Run the task to completion.
    async fn start(&self) -> Result<(), TaskError>;

    /// Ask a running `start` to return early.
    fn cancel(&self);

    fn describe(&self) -> String;
}

/// Worker pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Cannot queue - we are currently draining")]
    Draining,
    #[error("Cannot queue - the pool has been killed")]
    Killed,
    #[error("Worker {worker} did not exit after its task was cancelled")]
    JoinTimeout { worker: usize },
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// How long an idle worker sleeps before re-checking the shutdown flags
    pub idle_wait: Duration,
    /// How long `join` waits for a worker before cancelling its task
    pub join_timeout: Duration,
    /// How long a cancelled task gets to wind down
    pub cancel_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            idle_wait: Duration::from_secs(1),
            join_timeout: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(4),
        }
    }
}

type SharedTask = Arc<dyn PoolTask>;

struct Shared {
    queue: Mutex<VecDeque<SharedTask>>,
    running: Mutex<HashMap<usize, SharedTask>>,
    wakeup: Notify,
    killed: AtomicBool,
    draining: AtomicBool,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<SharedTask>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn running(&self) -> MutexGuard<'_, HashMap<usize, SharedTask>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Fixed set of workers sharing one FIFO queue
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<(usize, JoinHandle<()>)>>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Spawn the workers on the current runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            killed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        });

        let handles = (0..config.workers.max(1))
            .map(|id| (id, tokio::spawn(worker_loop(id, shared.clone(), config.idle_wait))))
            .collect();

        info!(target: "worker_pool", workers = config.workers.max(1), "Worker pool started");
        Self {
            shared,
            handles: Mutex::new(handles),
            config,
        }
    }

    pub fn queue(&self, task: SharedTask) -> Result<(), PoolError> {
        if self.shared.killed.load(Ordering::SeqCst) {
            return Err(PoolError::Killed);
        }
        if self.shared.draining.load(Ordering::SeqCst) {
            return Err(PoolError::Draining);
        }
        info!(target: "worker_pool", task = %task.describe(), "Queueing task");
        self.shared.queue().push_back(task);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Workers exit as soon as they are between tasks.
    pub fn kill(&self) {
        warn!(target: "worker_pool", "Killing worker pool");
        self.shared.killed.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_waiters();
    }

    /// Stop accepting work and let the workers finish the queue.
    pub fn drain(&self) {
        info!(target: "worker_pool", queued = self.queued(), "Draining worker pool");
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_waiters();
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn running(&self) -> usize {
        self.shared.running().len()
    }

    pub fn workers(&self) -> usize {
        self.config.workers.max(1)
    }

    fn cancel_running(&self, worker: usize) {
        let task = self.shared.running().get(&worker).cloned();
        if let Some(task) = task {
            warn!(target: "worker_pool", worker_id = worker, task = %task.describe(), "Cancelling task on stuck worker");
            task.cancel();
        }
    }

    /// Wait for every worker to exit.
    ///
    /// A worker still busy after `join_timeout` has its task cancelled and
    /// gets `cancel_grace` to finish; queued tasks are no longer handed out
    /// from then on. If it still hangs the remaining workers are aborted.
    pub async fn join(&self) -> Result<(), PoolError> {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        let mut handles = handles.into_iter();

        while let Some((id, mut handle)) = handles.next() {
            if let Ok(result) = tokio::time::timeout(self.config.join_timeout, &mut handle).await {
                log_exit(id, result);
                continue;
            }

            warn!(target: "worker_pool", worker_id = id, "Worker is still alive");
            self.shared.killed.store(true, Ordering::SeqCst);
            self.cancel_running(id);
            info!(
                target: "worker_pool",
                grace_secs = self.config.cancel_grace.as_secs_f64(),
                "Waiting for cancelled task to clean up"
            );

            match tokio::time::timeout(self.config.cancel_grace, &mut handle).await {
                Ok(result) => log_exit(id, result),
                Err(_) => {
                    error!(target: "worker_pool", worker_id = id, "Worker ignored cancellation; aborting pool");
                    self.kill();
                    handle.abort();
                    for (_, rest) in handles {
                        rest.abort();
                    }
                    return Err(PoolError::JoinTimeout { worker: id });
                }
            }
        }

        info!(target: "worker_pool", "All workers exited");
        Ok(())
    }
}

fn log_exit(id: usize, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(target: "worker_pool", worker_id = id, error = %e, "Worker ended abnormally");
    }
}

async fn worker_loop(id: usize, shared: Arc<Shared>, idle_wait: Duration) {
    info!(target: "worker_pool", worker_id = id, "Worker started");

    loop {
        let task = loop {
            if shared.killed.load(Ordering::SeqCst) {
                info!(target: "worker_pool", worker_id = id, "Worker exiting due to kill flag");
                return;
            }
            {
                let mut queue = shared.queue();
                if let Some(task) = queue.pop_front() {
                    shared.running().insert(id, task.clone());
                    break task;
                }
                if shared.draining.load(Ordering::SeqCst) {
                    info!(target: "worker_pool", worker_id = id, "Queue empty; worker exiting gracefully");
                    return;
                }
            }
            let _ = tokio::time::timeout(idle_wait, shared.wakeup.notified()).await;
        };

        let description = task.describe();
        info!(target: "worker_pool", worker_id = id, task = %description, "Starting task");
        match AssertUnwindSafe(task.start()).catch_unwind().await {
            Ok(Ok(())) => info!(target: "worker_pool", worker_id = id, task = %description, "Task finished"),
            Ok(Err(e)) => error!(
                target: "worker_pool",
                worker_id = id,
                task = %description,
                error = %e,
                "Task failed"
            ),
            Err(_) => error!(target: "worker_pool", worker_id = id, task = %description, "Task panicked"),
        }
        shared.running().remove(&id);
    }
}
