//! Per-key call coalescing.
//!
//! Concurrent callers that ask for the same key while a call is in flight
//! await the same shared result instead of starting their own. The call runs
//! as its own task: it completes and leaves the table even when every caller
//! has gone away, so later callers always start a fresh call.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::warn;

type SharedCall<V> = Shared<BoxFuture<'static, Option<V>>>;

struct InFlight<V> {
    id: u64,
    call: SharedCall<V>,
}

pub struct SingleFlight<K, V> {
    calls: Arc<DashMap<K, InFlight<V>>>,
    next_id: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

/// Removes a call's table entry when its task ends, however it ends.
struct Unregister<K: Eq + Hash, V> {
    calls: Arc<DashMap<K, InFlight<V>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for Unregister<K, V> {
    fn drop(&mut self) {
        self.calls.remove_if(&self.key, |_, entry| entry.id == self.id);
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key`, or join the call already in flight.
    ///
    /// Returns the value and whether this caller started the call, or `None`
    /// if the call's task panicked or was cancelled by runtime shutdown.
    /// Must be called within a Tokio runtime.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Option<(V, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (call, leader) = match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().call.clone(), false),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let guard = Unregister {
                    calls: Arc::clone(&self.calls),
                    key,
                    id,
                };
                let work = make();
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    work.await
                });
                let call = async move {
                    match handle.await {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(error = %e, "Coalesced call did not complete");
                            None
                        }
                    }
                }
                .boxed()
                .shared();
                entry.insert(InFlight {
                    id,
                    call: call.clone(),
                });
                (call, true)
            }
        };

        call.await.map(|value| (value, leader))
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}
