//! Batched key loader: `key -> Option<Arc<Record>>`.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use diskuze_state::{StorageResult, Transaction};

use super::{Batcher, Flush, LoaderConfig};
use crate::error::{ResolveError, ResolveResult};
use crate::unit_of_work::UnitOfWork;

/// A storage collection addressable by primary key.
#[async_trait]
pub trait EntitySource: Send + Sync + 'static {
    const ENTITY_TYPE: &'static str;

    type Key: Copy + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static;
    type Record: Send + Sync + 'static;

    fn key_of(record: &Self::Record) -> Self::Key;

    /// `SELECT * FROM <entity> WHERE key IN (keys)`
    async fn load_many(
        tx: &mut dyn Transaction,
        keys: &[Self::Key],
    ) -> StorageResult<Vec<Self::Record>>;
}

struct EntityFlush<S>(PhantomData<fn() -> S>);

#[async_trait]
impl<S: EntitySource> Flush for EntityFlush<S> {
    type Key = S::Key;
    type Value = Option<Arc<S::Record>>;

    fn kind(&self) -> &'static str {
        S::ENTITY_TYPE
    }

    fn absent(&self) -> Self::Value {
        None
    }

    async fn fetch(
        &self,
        tx: &mut dyn Transaction,
        keys: &[S::Key],
    ) -> ResolveResult<(HashMap<S::Key, Self::Value>, usize)> {
        let rows = S::load_many(tx, keys).await?;
        let count = rows.len();

        let mut found = HashMap::with_capacity(count);
        for row in rows {
            let key = S::key_of(&row);
            if !keys.contains(&key) {
                return Err(ResolveError::contract(
                    S::ENTITY_TYPE,
                    format!("row {key} was not requested"),
                ));
            }
            if found.insert(key, Some(Arc::new(row))).is_some() {
                return Err(ResolveError::contract(
                    S::ENTITY_TYPE,
                    format!("row {key} returned more than once"),
                ));
            }
        }
        Ok((found, count))
    }
}

/// Request-scoped loader for one entity kind.
///
/// Concurrent `load` calls issued in the same scheduling tick share one
/// `IN (...)` round trip; a key is fetched at most once per loader.
pub struct BatchLoader<S: EntitySource> {
    batcher: Batcher<EntityFlush<S>>,
}

impl<S: EntitySource> BatchLoader<S> {
    pub fn new(uow: Arc<UnitOfWork>, config: LoaderConfig) -> Self {
        Self {
            batcher: Batcher::new(EntityFlush(PhantomData), uow, config),
        }
    }

    /// Resolve one key. `Ok(None)` means the key has no row.
    pub async fn load(&self, key: S::Key) -> ResolveResult<Option<Arc<S::Record>>> {
        self.batcher.load(key).await
    }

    /// Resolve many keys, preserving the caller's order.
    pub async fn load_many(&self, keys: &[S::Key]) -> ResolveResult<Vec<Option<Arc<S::Record>>>> {
        futures::future::try_join_all(keys.iter().map(|key| self.load(*key))).await
    }

    /// Cache a record obtained elsewhere in the request. When the key is
    /// already cached, the cached record is returned instead.
    pub fn prime(&self, record: Arc<S::Record>) -> Arc<S::Record> {
        let key = S::key_of(&record);
        match self.batcher.prime(key, Some(Arc::clone(&record))) {
            Some(cached) => cached,
            // A cached "not found" stays authoritative for this request
            None => record,
        }
    }

    /// Cache a record this request just wrote. Unlike [`prime`](Self::prime),
    /// a cached "not found" for the key is replaced.
    pub fn record_written(&self, record: Arc<S::Record>) -> Arc<S::Record> {
        let key = S::key_of(&record);
        let merged = self
            .batcher
            .merge(key, Some(Arc::clone(&record)), |slot, written| {
                if slot.is_none() {
                    *slot = written;
                }
            });
        merged.unwrap_or(record)
    }

    /// Whether `key` has already been resolved in this request.
    pub fn is_cached(&self, key: &S::Key) -> bool {
        self.batcher.cached(key).is_some()
    }

    /// Storage round trips issued by this loader.
    pub fn round_trips(&self) -> usize {
        self.batcher.round_trips()
    }
}
