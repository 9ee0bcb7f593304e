//! Request-scoped batching loaders.
//!
//! Both loader kinds share one batching engine, [`Batcher`], and differ
//! only in how a flushed window is fetched and mapped back to keys:
//!
//! - [`BatchLoader`]: `key -> Option<Arc<Record>>` via `WHERE key IN (...)`
//! - [`RelationLoader`]: `parent -> Vec<Arc<Child>>` via
//!   `WHERE parent IN (...)`, partitioned by parent key
//!
//! # Batching protocol
//!
//! A batch window collects keys in two phases:
//!
//! 1. **Accumulate.** The first caller that finds no open window opens one
//!    and becomes its leader. It registers its key and yields once to the
//!    scheduler, so every sibling future that is already runnable gets
//!    polled and can register its key into the same window.
//! 2. **Flush.** When the leader is resumed it closes the window, marks its
//!    keys in flight and fetches them (in chunks of
//!    [`LoaderConfig::max_batch_size`]). Every fetched key is cached,
//!    present or absent, before the waiters are woken.
//!
//! Followers wait on the window's `watch` channel. A leader that is
//! dropped mid-flight releases its window and wakes the followers with
//! `Abandoned`; one of them takes over as the next leader.
//!
//! The cache dominates batching: a key resolved once in a request is
//! never fetched again, and values are shared as `Arc`s so equal keys
//! yield the same object.

mod batch;
mod relation;

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use diskuze_state::Transaction;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{ResolveError, ResolveResult};
use crate::unit_of_work::UnitOfWork;

pub use batch::{BatchLoader, EntitySource};
pub use relation::{Children, RelationLoader, RelationSource};

/// Default upper bound on keys sent in one `IN (...)` round trip.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Loader tuning shared by every loader of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Windows larger than this are fetched in several round trips.
    pub max_batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl LoaderConfig {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }
}

/// Fetch strategy for one loader kind.
#[async_trait]
pub(crate) trait Flush: Send + Sync + 'static {
    type Key: Copy + Eq + Hash + Ord + Debug + Send + Sync + 'static;
    /// Cached outcome for one key.
    type Value: Clone + Send + Sync + 'static;

    /// Entity kind, for logs and contract errors.
    fn kind(&self) -> &'static str;

    /// Outcome for a requested key that produced no rows.
    fn absent(&self) -> Self::Value;

    /// Fetch one chunk of keys in a single round trip. Returns the outcomes
    /// for keys that produced rows, and the number of rows read.
    async fn fetch(
        &self,
        tx: &mut dyn Transaction,
        keys: &[Self::Key],
    ) -> ResolveResult<(HashMap<Self::Key, Self::Value>, usize)>;
}

#[derive(Debug, Clone)]
enum Signal {
    Pending,
    Ready(ResolveResult<()>),
    Abandoned,
}

struct Window<K> {
    generation: u64,
    keys: BTreeSet<K>,
    signal: watch::Receiver<Signal>,
}

struct BatchState<K, V> {
    cache: HashMap<K, V>,
    window: Option<Window<K>>,
    in_flight: HashMap<K, (u64, watch::Receiver<Signal>)>,
    next_generation: u64,
}

impl<K, V> Default for BatchState<K, V> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            window: None,
            in_flight: HashMap::new(),
            next_generation: 0,
        }
    }
}

enum Step<V> {
    Cached(V),
    Wait(watch::Receiver<Signal>),
    Lead(u64, watch::Sender<Signal>),
}

/// Batching engine behind both loader kinds.
pub(crate) struct Batcher<F: Flush> {
    flusher: F,
    uow: Arc<UnitOfWork>,
    config: LoaderConfig,
    state: Mutex<BatchState<F::Key, F::Value>>,
    round_trips: AtomicUsize,
}

impl<F: Flush> Batcher<F> {
    pub(crate) fn new(flusher: F, uow: Arc<UnitOfWork>, config: LoaderConfig) -> Self {
        Self {
            flusher,
            uow,
            config,
            state: Mutex::new(BatchState::default()),
            round_trips: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState<F::Key, F::Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Storage round trips issued so far.
    pub(crate) fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Seed the cache without a fetch. An existing entry wins.
    pub(crate) fn prime(&self, key: F::Key, value: F::Value) -> F::Value {
        self.lock().cache.entry(key).or_insert(value).clone()
    }

    /// Cache `value`, or fold it into an existing entry with `merge`.
    pub(crate) fn merge(
        &self,
        key: F::Key,
        value: F::Value,
        merge: impl FnOnce(&mut F::Value, F::Value),
    ) -> F::Value {
        match self.lock().cache.entry(key) {
            Entry::Occupied(mut entry) => {
                merge(entry.get_mut(), value);
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(value).clone(),
        }
    }

    /// Rewrite an entry in place. Keys not resolved yet are left alone.
    pub(crate) fn amend(&self, key: &F::Key, amend: impl FnOnce(&mut F::Value)) -> bool {
        match self.lock().cache.get_mut(key) {
            Some(value) => {
                amend(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn cached(&self, key: &F::Key) -> Option<F::Value> {
        self.lock().cache.get(key).cloned()
    }

    pub(crate) async fn load(&self, key: F::Key) -> ResolveResult<F::Value> {
        loop {
            match self.register(key) {
                Step::Cached(value) => return Ok(value),
                Step::Wait(signal) => match wait(signal).await {
                    Some(Ok(())) => continue,
                    Some(Err(e)) => return Err(e),
                    None => {
                        trace!(kind = self.flusher.kind(), ?key, "batch leader abandoned, retrying");
                        continue;
                    }
                },
                Step::Lead(generation, signal) => {
                    let mut leader = Leader {
                        batcher: self,
                        generation,
                        signal,
                        finished: false,
                    };
                    leader.run().await?;
                }
            }
        }
    }

    /// Phase one: join the cache, an in-flight fetch, the open window, or
    /// open a new window.
    fn register(&self, key: F::Key) -> Step<F::Value> {
        let mut state = self.lock();
        if let Some(value) = state.cache.get(&key) {
            return Step::Cached(value.clone());
        }
        if let Some((_, signal)) = state.in_flight.get(&key) {
            return Step::Wait(signal.clone());
        }
        if let Some(window) = state.window.as_mut() {
            window.keys.insert(key);
            return Step::Wait(window.signal.clone());
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let (sender, receiver) = watch::channel(Signal::Pending);
        state.window = Some(Window {
            generation,
            keys: BTreeSet::from([key]),
            signal: receiver,
        });
        Step::Lead(generation, sender)
    }

    /// Phase two: close the window and move its keys in flight.
    fn close_window(&self, generation: u64) -> Vec<F::Key> {
        let mut state = self.lock();
        let window = match state.window.take() {
            Some(window) if window.generation == generation => window,
            other => {
                state.window = other;
                return Vec::new();
            }
        };
        for key in &window.keys {
            state
                .in_flight
                .insert(*key, (generation, window.signal.clone()));
        }
        window.keys.into_iter().collect()
    }

    async fn fetch_all(&self, keys: &[F::Key]) -> ResolveResult<()> {
        let kind = self.flusher.kind();
        for chunk in keys.chunks(self.config.max_batch_size.max(1)) {
            let (mut found, rows) = {
                let mut session = self.uow.session().await?;
                self.round_trips.fetch_add(1, Ordering::Relaxed);
                self.flusher.fetch(&mut *session, chunk).await?
            };
            debug!(
                kind,
                keys = chunk.len(),
                rows,
                found = found.len(),
                round_trips = self.round_trips(),
                "batch flushed"
            );

            let mut state = self.lock();
            for key in chunk {
                let value = found.remove(key).unwrap_or_else(|| self.flusher.absent());
                state.cache.entry(*key).or_insert(value);
                state.in_flight.remove(key);
            }
            if let Some(stray) = found.keys().next() {
                return Err(ResolveError::contract(
                    kind,
                    format!("fetch returned unrequested key {stray:?}"),
                ));
            }
        }
        Ok(())
    }
}

/// Owns the open window on behalf of the caller that opened it.
struct Leader<'a, F: Flush> {
    batcher: &'a Batcher<F>,
    generation: u64,
    signal: watch::Sender<Signal>,
    finished: bool,
}

impl<F: Flush> Leader<'_, F> {
    async fn run(&mut self) -> ResolveResult<()> {
        tokio::task::yield_now().await;

        let keys = self.batcher.close_window(self.generation);
        let outcome = self.batcher.fetch_all(&keys).await;
        if outcome.is_err() {
            self.release();
        }
        self.finished = true;
        self.signal.send_replace(Signal::Ready(outcome.clone()));
        outcome
    }

    /// Forget the window and any keys still marked in flight for it.
    fn release(&self) {
        let mut state = self.batcher.lock();
        if state
            .window
            .as_ref()
            .is_some_and(|w| w.generation == self.generation)
        {
            state.window = None;
        }
        state
            .in_flight
            .retain(|_, (generation, _)| *generation != self.generation);
    }
}

impl<F: Flush> Drop for Leader<'_, F> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.release();
        self.signal.send_replace(Signal::Abandoned);
    }
}

/// Wait for a window outcome. `None` means the leader went away.
async fn wait(mut signal: watch::Receiver<Signal>) -> Option<ResolveResult<()>> {
    let outcome = match signal
        .wait_for(|s| !matches!(s, Signal::Pending))
        .await
    {
        Ok(current) => (*current).clone(),
        Err(_) => return None,
    };
    match outcome {
        Signal::Ready(result) => Some(result),
        Signal::Pending | Signal::Abandoned => None,
    }
}
