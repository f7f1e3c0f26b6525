//! Reference-counted resolution cache
//!
//! Maps a key to an expensively resolved value. Guarantees:
//! - at most one lookup in flight per key; concurrent callers wait for it
//! - a resolved value stays cached while its reference count is positive
//! - the release hook runs exactly once when the count drops to zero
//! - failures are never cached; callers retry within a small budget

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Number of extra resolution attempts after a failed lookup
pub const DEFAULT_RECURSION_BUDGET: u32 = 2;

/// Resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Lookup failed for {key}: {reason}")]
    LookupFailed { key: String, reason: String },
    #[error("No replicas known for {0}")]
    NoReplicas(String),
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
    #[error("Resolution of {0} was abandoned")]
    Abandoned(String),
}

/// The pluggable resolver behind a `ResolutionCache`.
#[async_trait]
pub trait ResourceLookup<K, V>: Send + Sync {
    async fn lookup(&self, key: &K) -> Result<V, ResolveError>;

    /// Side effect run when the last reference to `key` is released.
    fn release(&self, _key: &K) {}
}

#[derive(Debug, Clone)]
enum Flight {
    Pending,
    Resolved,
    Failed(ResolveError),
}

struct Entry<V> {
    value: V,
    refs: usize,
}

struct CacheState<K, V> {
    resolved: HashMap<K, Entry<V>>,
    in_flight: HashMap<K, watch::Receiver<Flight>>,
}

enum Role {
    Resolver(watch::Sender<Flight>),
    Waiter(watch::Receiver<Flight>),
}

/// Reference counted cache with one lookup in flight per key
pub struct ResolutionCache<K, V> {
    lookup: Box<dyn ResourceLookup<K, V>>,
    state: Mutex<CacheState<K, V>>,
    recursion_budget: u32,
}

/// Removes the in-flight marker if the resolving future is dropped before
/// it finishes, so waiters are not stranded.
struct FlightGuard<'a, K: Eq + Hash, V> {
    state: &'a Mutex<CacheState<K, V>>,
    key: &'a K,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for FlightGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.in_flight.remove(self.key);
        }
    }
}

impl<K, V> ResolutionCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(lookup: impl ResourceLookup<K, V> + 'static) -> Self {
        Self::with_budget(lookup, DEFAULT_RECURSION_BUDGET)
    }

    pub fn with_budget(lookup: impl ResourceLookup<K, V> + 'static, recursion_budget: u32) -> Self {
        Self {
            lookup: Box::new(lookup),
            state: Mutex::new(CacheState {
                resolved: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            recursion_budget,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take a reference on the value for `key`, resolving it if needed.
    pub async fn acquire(&self, key: &K) -> Result<V, ResolveError> {
        let mut budget = self.recursion_budget;

        loop {
            let role = {
                let mut state = self.state();
                if let Some(entry) = state.resolved.get_mut(key) {
                    entry.refs += 1;
                    return Ok(entry.value.clone());
                }
                match state.in_flight.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(Flight::Pending);
                        state.in_flight.insert(key.clone(), rx);
                        Role::Resolver(tx)
                    }
                }
            };

            let failure = match role {
                Role::Resolver(tx) => {
                    let mut guard = FlightGuard {
                        state: &self.state,
                        key,
                        armed: true,
                    };
                    debug!(?key, "Resolving");
                    let result = self.lookup.lookup(key).await;
                    guard.armed = false;

                    {
                        let mut state = self.state();
                        state.in_flight.remove(key);
                        if let Ok(value) = &result {
                            state.resolved.insert(
                                key.clone(),
                                Entry {
                                    value: value.clone(),
                                    refs: 1,
                                },
                            );
                        }
                    }

                    match result {
                        Ok(value) => {
                            let _ = tx.send(Flight::Resolved);
                            return Ok(value);
                        }
                        Err(e) => {
                            let _ = tx.send(Flight::Failed(e.clone()));
                            e
                        }
                    }
                }
                Role::Waiter(mut rx) => {
                    let outcome = match rx.wait_for(|f| !matches!(f, Flight::Pending)).await {
                        Ok(flight) => (*flight).clone(),
                        Err(_) => Flight::Failed(ResolveError::Abandoned(format!("{key:?}"))),
                    };

                    {
                        let mut state = self.state();
                        if let Some(entry) = state.resolved.get_mut(key) {
                            entry.refs += 1;
                            return Ok(entry.value.clone());
                        }
                    }

                    match outcome {
                        Flight::Failed(e) => e,
                        // Resolved but released again before we could take a reference.
                        _ => {
                            debug!(?key, "Resolved value vanished before we got to it; retrying");
                            continue;
                        }
                    }
                }
            };

            if budget == 0 {
                error!(?key, error = %failure, "Resolution failed; giving up");
                return Err(failure);
            }
            budget -= 1;
            warn!(?key, error = %failure, remaining = budget, "Resolution failed; retrying");
        }
    }

    /// Drop one reference. At zero the entry is evicted and the release hook
    /// runs.
    pub fn release(&self, key: &K) {
        let evicted = {
            let mut state = self.state();
            match state.resolved.get_mut(key) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        state.resolved.remove(key);
                        true
                    } else {
                        false
                    }
                }
                None => {
                    error!(?key, "Released a key which is not held");
                    false
                }
            }
        };

        if evicted {
            debug!(?key, "Last reference released");
            self.lookup.release(key);
        }
    }

    pub fn ref_count(&self, key: &K) -> usize {
        self.state().resolved.get(key).map_or(0, |e| e.refs)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state().resolved.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state().resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}
