//! Single-flight execution keyed by cache key.
//!
//! The first caller for a key spawns the operation onto the runtime; callers
//! arriving while it runs await the same shared result. The operation runs
//! detached from any one caller, so a disconnecting client does not cancel
//! work other waiters depend on.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoalesceError {
    #[error("in-flight operation aborted: {0}")]
    Aborted(String),
}

/// What one caller of [`Coalescer::run_exclusive`] got back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flight<V> {
    pub result: Result<V, CoalesceError>,
    /// True when the caller awaited work another caller had started.
    pub joined: bool,
}

type Pending<V> = Shared<BoxFuture<'static, Result<V, CoalesceError>>>;
type Inflight<K, V> = Arc<Mutex<HashMap<K, Pending<V>>>>;

pub struct Coalescer<K, V> {
    inflight: Inflight<K, V>,
}

/// Deregisters a key when dropped. Lives inside the spawned task so the key is
/// released on completion, panic, or runtime shutdown alike.
struct Release<K: Eq + Hash, V> {
    key: K,
    inflight: Inflight<K, V>,
}

impl<K: Eq + Hash, V> Drop for Release<K, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        inflight.remove(&self.key);
    }
}

impl<K, V> Default for Coalescer<K, V> {
    fn default() -> Self {
        Self { inflight: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Pending<V>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with an operation currently running.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Runs `operation` unless one is already running for `key`, in which case
    /// its result is awaited instead. `operation` is only invoked by the
    /// caller that starts the work; whether this caller joined is decided
    /// under the same lock that registers new work.
    pub async fn run_exclusive<F, Fut>(&self, key: K, operation: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (pending, joined) = {
            let mut inflight = self.lock();
            match inflight.get(&key) {
                Some(pending) => {
                    tracing::debug!("Joining in-flight operation for {:?}", key);
                    (pending.clone(), true)
                }
                None => {
                    // Registered before the lock is released, so the task's
                    // release guard can never run ahead of the insert.
                    let release = Release { key: key.clone(), inflight: Arc::clone(&self.inflight) };
                    let work = operation();
                    let handle = tokio::spawn(async move {
                        let _release = release;
                        work.await
                    });
                    let pending = async move {
                        handle.await.map_err(|e| {
                            let reason = if e.is_panic() { "panicked" } else { "cancelled" };
                            CoalesceError::Aborted(reason.to_string())
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, pending.clone());
                    (pending, false)
                }
            }
        };
        Flight { result: pending.await, joined }
    }
}
