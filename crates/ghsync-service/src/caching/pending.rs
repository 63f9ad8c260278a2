//! Coalescing of concurrent operations for the same key.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use crate::utils::defer::defer;

use super::CacheName;

/// The shared outcome of a coalesced operation.
///
/// Every caller attached to the same operation receives a clone of the same result.
pub type Outcome<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Tells a running operation whether it is still the registered one for its key.
#[derive(Debug, Clone)]
pub struct Generation(Arc<AtomicBool>);

impl Generation {
    /// Returns `false` once the operation was superseded by a newer one, or forgotten.
    pub fn is_current(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }

    fn supersede(&self) {
        self.0.store(true, Ordering::Release);
    }
}

struct PendingOperation<T, E> {
    id: u64,
    started_at: Instant,
    generation: Generation,
    outcome: Outcome<T, E>,
}

type Registry<K, T, E> = Arc<Mutex<HashMap<K, PendingOperation<T, E>>>>;

fn lock<K, T, E>(registry: &Registry<K, T, E>) -> MutexGuard<'_, HashMap<K, PendingOperation<T, E>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registry of in-flight operations, keyed by what they compute.
///
/// While an operation for a key is pending, further calls for the same key attach to it instead
/// of starting a new one. Operations are spawned onto the runtime when registered, so they run
/// to completion even if every caller goes away. The entry is removed as soon as the operation
/// settles, successfully, with an error or by panicking, and before any attached caller
/// observes the result.
///
/// An operation older than the configured timeout no longer blocks: the next call for its key
/// starts a fresh operation. The old operation is not cancelled, callers already attached to it
/// still receive its result. Its [`Generation`] reports it as superseded.
pub struct PendingOperations<K, T, E> {
    name: CacheName,
    timeout: Duration,
    operations: Registry<K, T, E>,
    next_id: AtomicU64,
}

impl<K, T, E> fmt::Debug for PendingOperations<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperations")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("pending", &lock(&self.operations).len())
            .finish()
    }
}

impl<K, T, E> PendingOperations<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(name: CacheName, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            operations: Default::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns the outcome of the operation for `key`, starting it with `factory` if needed.
    ///
    /// `factory` is only invoked when no operation for `key` is pending, or the pending one
    /// exceeded the timeout. It is called with the registry locked and must not call back into
    /// it. The operation it returns is spawned on the current runtime.
    pub fn coalesce<F, Fut>(&self, key: K, factory: F) -> Outcome<T, E>
    where
        F: FnOnce(Generation) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn_operation(key, factory, false)
    }

    /// Starts a new operation for `key`, superseding the pending one if there is any.
    pub fn restart<F, Fut>(&self, key: K, factory: F) -> Outcome<T, E>
    where
        F: FnOnce(Generation) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn_operation(key, factory, true)
    }

    fn spawn_operation<F, Fut>(&self, key: K, factory: F, restart: bool) -> Outcome<T, E>
    where
        F: FnOnce(Generation) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.name.as_ref();
        let mut operations = lock(&self.operations);

        if let Some(pending) = operations.get(&key) {
            let elapsed = pending.started_at.elapsed();
            if restart {
                metric!(counter("pending.restarted") += 1, "cache" => name);
                tracing::debug!(%key, "Superseding in-flight operation");
            } else if elapsed <= self.timeout {
                metric!(counter("pending.coalesced") += 1, "cache" => name);
                tracing::trace!(%key, "Attaching to in-flight operation");
                return pending.outcome.clone();
            } else {
                metric!(counter("pending.timed_out") += 1, "cache" => name);
                tracing::warn!(%key, ?elapsed, "Pending operation timed out, starting a new one");
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let generation = Generation(Arc::new(AtomicBool::new(false)));
        let operation = factory(generation.clone());
        let guard = {
            let registry = Arc::clone(&self.operations);
            let key = key.clone();
            defer(move || remove_operation(&registry, &key, id))
        };
        let task = async move {
            let result = AssertUnwindSafe(operation).catch_unwind().await;
            // Evict from the registry before anyone observes the result.
            drop(guard);
            match result {
                Ok(result) => result,
                Err(panic) => panic::resume_unwind(panic),
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        let outcome = tokio::spawn(task)
            .map(|joined| match joined {
                Ok(result) => result,
                Err(err) => match err.try_into_panic() {
                    Ok(panic) => panic::resume_unwind(panic),
                    Err(err) => panic!("pending operation did not complete: {err}"),
                },
            })
            .boxed()
            .shared();

        let replaced = operations.insert(
            key,
            PendingOperation {
                id,
                started_at: Instant::now(),
                generation,
                outcome: outcome.clone(),
            },
        );
        if let Some(replaced) = replaced {
            replaced.generation.supersede();
        }
        metric!(counter("pending.started") += 1, "cache" => name);
        metric!(gauge("pending.count") = operations.len() as u64, "cache" => name);

        outcome
    }

    /// Returns the number of pending operations.
    pub fn pending_count(&self) -> usize {
        lock(&self.operations).len()
    }

    /// Forgets all pending operations without cancelling them.
    pub fn clear_all(&self) {
        let drained = std::mem::take(&mut *lock(&self.operations));
        for pending in drained.values() {
            pending.generation.supersede();
        }
        tracing::debug!(
            cache = self.name.as_ref(),
            "Cleared {} pending operations",
            drained.len()
        );
    }
}

/// Removes the operation `id` registered under `key`, unless it was already replaced.
fn remove_operation<K: Eq + Hash, T, E>(registry: &Registry<K, T, E>, key: &K, id: u64) {
    let mut operations = lock(registry);
    if matches!(operations.get(key), Some(pending) if pending.id == id) {
        operations.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future;
    use serde_json::{Value, json};
    use tokio::time::sleep;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn operations<T>() -> PendingOperations<String, T, String>
    where
        T: Clone + Send + Sync + 'static,
    {
        PendingOperations::new(CacheName::Users, TIMEOUT)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_operation() {
        let pending = operations::<Value>();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = || {
            let calls = Arc::clone(&calls);
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_millis(200)).await;
                    Ok(json!({"login": "alice"}))
                }
            }
        };

        let first = pending.coalesce("user:42".into(), fetch());
        let second = pending.coalesce("user:42".into(), fetch());
        assert_eq!(pending.pending_count(), 1);

        let (first, second) = future::join(first, second).await;
        assert_eq!(first, Ok(json!({"login": "alice"})));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_not_retained() {
        let pending = operations::<u32>();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = || {
            let calls = Arc::clone(&calls);
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_millis(10)).await;
                    Err("rate limited".to_owned())
                }
            }
        };

        let first = pending.coalesce("user:42".into(), failing());
        let second = pending.coalesce("user:42".into(), failing());
        let (first, second) = future::join(first, second).await;
        assert_eq!(first, Err("rate limited".to_owned()));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pending.pending_count(), 0);

        // The failure is not cached, the next call starts a new operation.
        let third = pending.coalesce("user:42".into(), failing()).await;
        assert_eq!(third, Err("rate limited".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let pending = operations::<&'static str>();
        let alice = pending.coalesce("user:alice".into(), |_| async { Ok("alice") });
        let bob = pending.coalesce("user:bob".into(), |_| async {
            sleep(Duration::from_millis(10)).await;
            Ok("bob")
        });
        assert_eq!(pending.pending_count(), 2);

        assert_eq!(alice.await, Ok("alice"));
        assert_eq!(pending.pending_count(), 1);
        assert_eq!(bob.await, Ok("bob"));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_removed_before_result_is_observed() {
        let pending = Arc::new(operations::<usize>());

        let outcome = pending.coalesce("user:42".into(), |_| async { Ok(1) });
        let waiter = {
            let pending = Arc::clone(&pending);
            let outcome = outcome.clone();
            tokio::spawn(async move {
                let result = outcome.await;
                (result, pending.pending_count())
            })
        };

        let result = outcome.await;
        assert_eq!(result, Ok(1));
        assert_eq!(pending.pending_count(), 0);
        assert_eq!(waiter.await.unwrap(), (Ok(1), 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_operation_is_replaced() {
        let pending = operations::<u32>();

        let mut stuck_generation = None;
        let stuck = pending.coalesce("user:42".into(), |generation| {
            stuck_generation = Some(generation);
            future::pending()
        });
        let attached = pending.coalesce("user:42".into(), |_| async { Ok(2) });
        assert_eq!(pending.pending_count(), 1);
        let stuck_generation = stuck_generation.unwrap();
        assert!(stuck_generation.is_current());

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;

        let fresh = pending.coalesce("user:42".into(), |generation| async move {
            Ok(if generation.is_current() { 3 } else { 0 })
        });
        assert_eq!(fresh.await, Ok(3));
        assert_eq!(pending.pending_count(), 0);

        // The stuck operation was not cancelled, its callers are still waiting on it.
        assert!(!stuck_generation.is_current());
        assert!(stuck.peek().is_none());
        assert!(attached.peek().is_none());
    }

    async fn explode() -> Result<u32, String> {
        sleep(Duration::from_millis(10)).await;
        panic!("boom")
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_is_removed() {
        let pending = operations::<u32>();

        let outcome = pending.coalesce("user:42".into(), |_| explode());
        assert_eq!(pending.pending_count(), 1);

        let joined = tokio::spawn(outcome).await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_completes_without_callers() {
        let pending = operations::<u32>();
        let completed = Arc::new(AtomicUsize::new(0));

        let outcome = {
            let completed = Arc::clone(&completed);
            pending.coalesce("user:42".into(), move |_| async move {
                sleep(Duration::from_millis(200)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
        };
        drop(outcome);
        assert_eq!(pending.pending_count(), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_supersedes_pending_operation() {
        let pending = operations::<u32>();

        let old = pending.coalesce("user:42".into(), |generation| async move {
            sleep(Duration::from_secs(5)).await;
            Ok(if generation.is_current() { 1 } else { 0 })
        });
        let new = pending.restart("user:42".into(), |generation| async move {
            Ok(if generation.is_current() { 2 } else { 0 })
        });
        assert_eq!(pending.pending_count(), 1);

        assert_eq!(new.await, Ok(2));
        assert_eq!(old.await, Ok(0));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all() {
        let pending = operations::<u32>();
        let outcome = pending.coalesce("user:42".into(), |_| async { Ok(1) });
        let _other = pending.coalesce("user:43".into(), |_| async { Ok(2) });
        assert_eq!(pending.pending_count(), 2);

        pending.clear_all();
        assert_eq!(pending.pending_count(), 0);
        assert_eq!(outcome.await, Ok(1));
    }
}
