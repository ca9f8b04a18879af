//! Deduplicating creating cache
//!
//! A memoization map whose values are expensive to create (pre-dexing a
//! library, hashing a large archive). For any key:
//! - a finished value is returned straight from the map,
//! - the first requester becomes the sole producer and runs the factory
//!   outside the lock,
//! - later requesters block on the producer's [`Latch`] and re-read the map.
//!
//! The producer/waiter decision and the latch installation happen in a single
//! critical section, so two threads can never both believe they are the
//! producer. Requests for different keys never wait on each other.
//!
//! ## Factory failures
//!
//! A factory error is returned to the producing caller only. The in-flight
//! entry is removed and its latch released (also on panic, through a drop
//! guard), so waiters wake up, find the key absent and retry production
//! themselves. Keys are never poisoned.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::latch::Latch;

/// Returned by [`CreatingCache::clear`] while values are still being created.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot clear cache: {in_flight} value(s) still being created")]
pub struct CacheBusy {
    pub in_flight: usize,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the map.
    pub hits: u64,
    /// Lookups that started a production.
    pub misses: u64,
}

/// Outcome of a single atomic lookup.
enum ValueState<V> {
    /// The value is ready.
    Existing(V),
    /// The caller must produce the value and release this latch.
    New(Arc<Latch>),
    /// Another thread is producing the value.
    Processing(Arc<Latch>),
}

struct CacheState<K, V> {
    values: HashMap<K, V>,
    in_flight: HashMap<K, Arc<Latch>>,
    stats: CacheStats,
}

type Factory<K, V, E> = dyn Fn(&K) -> Result<V, E> + Send + Sync;

/// Blocking cache that runs its factory at most once per key at a time.
///
/// Values are cloned out of the map, so large values should be wrapped in
/// an `Arc`.
pub struct CreatingCache<K, V, E> {
    factory: Box<Factory<K, V, E>>,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V, E> CreatingCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache around a value factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            state: Mutex::new(CacheState {
                values: HashMap::new(),
                in_flight: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Get the value for `key`, creating it if needed.
    ///
    /// Blocks while another thread is creating the same key.
    pub fn get(&self, key: &K) -> Result<V, E> {
        loop {
            match self.lookup(key) {
                ValueState::Existing(value) => return Ok(value),
                ValueState::New(latch) => return self.produce(key, latch),
                ValueState::Processing(latch) => latch.wait(),
            }
        }
    }

    /// Like [`get`](Self::get), but gives up waiting when `token` is cancelled.
    ///
    /// Returns `Ok(None)` if the wait was interrupted. A caller that ends up as
    /// the producer always runs the factory to completion.
    pub fn get_interruptible(&self, key: &K, token: &CancellationToken) -> Result<Option<V>, E> {
        loop {
            if token.is_cancelled() {
                return Ok(None);
            }
            match self.lookup(key) {
                ValueState::Existing(value) => return Ok(Some(value)),
                ValueState::New(latch) => return self.produce(key, latch).map(Some),
                ValueState::Processing(latch) => {
                    if !latch.wait_interruptible(token) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Return the value for `key` if it is already created.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.lock().values.get(key).cloned()
    }

    /// Number of finished values.
    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    /// True if no finished value is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().values.is_empty()
    }

    /// Number of keys currently being created.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Hit/miss counters since creation or the last [`clear`](Self::clear).
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Drop every finished value and reset the counters.
    ///
    /// Fails while any key is being created: the waiters on those keys would
    /// otherwise never see their value.
    pub fn clear(&self) -> Result<(), CacheBusy> {
        let mut state = self.lock();
        if !state.in_flight.is_empty() {
            return Err(CacheBusy {
                in_flight: state.in_flight.len(),
            });
        }
        state.values.clear();
        state.stats = CacheStats::default();
        Ok(())
    }

    /// Decide, under the lock, whether the caller reads, produces or waits.
    fn lookup(&self, key: &K) -> ValueState<V> {
        let mut state = self.lock();
        if let Some(value) = state.values.get(key) {
            let value = value.clone();
            state.stats.hits += 1;
            return ValueState::Existing(value);
        }
        if let Some(latch) = state.in_flight.get(key) {
            return ValueState::Processing(Arc::clone(latch));
        }
        let latch = Arc::new(Latch::new());
        state.in_flight.insert(key.clone(), Arc::clone(&latch));
        state.stats.misses += 1;
        ValueState::New(latch)
    }

    fn produce(&self, key: &K, latch: Arc<Latch>) -> Result<V, E> {
        let guard = ProductionGuard {
            cache: self,
            key,
            latch,
            installed: false,
        };
        let value = (self.factory)(key)?;
        guard.install(value.clone());
        Ok(value)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the in-flight entry whether or not the factory succeeded.
struct ProductionGuard<'a, K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a CreatingCache<K, V, E>,
    key: &'a K,
    latch: Arc<Latch>,
    installed: bool,
}

impl<K, V, E> ProductionGuard<'_, K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn install(mut self, value: V) {
        {
            let mut state = self.cache.lock();
            state.values.insert(self.key.clone(), value);
            state.in_flight.remove(self.key);
        }
        self.installed = true;
        self.latch.count_down();
    }
}

impl<K, V, E> Drop for ProductionGuard<'_, K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if self.installed {
            return;
        }
        self.cache.lock().in_flight.remove(self.key);
        self.latch.count_down();
    }
}
