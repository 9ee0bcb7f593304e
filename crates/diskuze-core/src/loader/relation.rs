//! Relation index loader: `parent -> Vec<Arc<Child>>`.

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

/// A one-to-many edge, read by parent key.
#[async_trait]
pub trait RelationSource: Send + Sync + 'static {
    const RELATION: &'static str;

    type ParentKey: Copy + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static;
    type Child: Send + Sync + 'static;

    /// Parent a child row belongs to; `None` if the row has no parent.
    fn parent_of(child: &Self::Child) -> Option<Self::ParentKey>;

    /// `SELECT * FROM <child> WHERE <parent column> IN (parents)`
    async fn load_children(
        tx: &mut dyn Transaction,
        parents: &[Self::ParentKey],
    ) -> StorageResult<Vec<Self::Child>>;
}

/// Children of one parent, shared across every caller that asked for it.
pub type Children<C> = Arc<Vec<Arc<C>>>;

struct RelationFlush<S>(PhantomData<fn() -> S>);

#[async_trait]
impl<S: RelationSource> Flush for RelationFlush<S> {
    type Key = S::ParentKey;
    type Value = Children<S::Child>;

    fn kind(&self) -> &'static str {
        S::RELATION
    }

    fn absent(&self) -> Self::Value {
        Arc::new(Vec::new())
    }

    async fn fetch(
        &self,
        tx: &mut dyn Transaction,
        parents: &[S::ParentKey],
    ) -> ResolveResult<(HashMap<S::ParentKey, Self::Value>, usize)> {
        let rows = S::load_children(tx, parents).await?;
        let count = rows.len();

        // Partition in storage order
        let mut index: HashMap<S::ParentKey, Vec<Arc<S::Child>>> = HashMap::new();
        for row in rows {
            let parent = S::parent_of(&row).ok_or_else(|| {
                ResolveError::contract(S::RELATION, "row without a parent key")
            })?;
            if !parents.contains(&parent) {
                return Err(ResolveError::contract(
                    S::RELATION,
                    format!("row for parent {parent} was not requested"),
                ));
            }
            index.entry(parent).or_default().push(Arc::new(row));
        }

        let found = index
            .into_iter()
            .map(|(parent, children)| (parent, Arc::new(children)))
            .collect();
        Ok((found, count))
    }
}

/// Request-scoped loader for one relation.
///
/// A parent with no children resolves to an empty list.
pub struct RelationLoader<S: RelationSource> {
    batcher: Batcher<RelationFlush<S>>,
}

impl<S: RelationSource> RelationLoader<S> {
    pub fn new(uow: Arc<UnitOfWork>, config: LoaderConfig) -> Self {
        Self {
            batcher: Batcher::new(RelationFlush(PhantomData), uow, config),
        }
    }

    /// Children of `parent`, in storage order.
    pub async fn load(&self, parent: S::ParentKey) -> ResolveResult<Children<S::Child>> {
        self.batcher.load(parent).await
    }

    /// Add a child written by this request to its parent's cached list.
    /// Returns `false` when the parent was not loaded yet; its next load
    /// reads the child through the transaction.
    pub fn append(&self, parent: S::ParentKey, child: Arc<S::Child>) -> bool {
        self.batcher.amend(&parent, |children| {
            let mut extended = Vec::with_capacity(children.len() + 1);
            extended.extend(children.iter().cloned());
            extended.push(child);
            *children = Arc::new(extended);
        })
    }

    /// Storage round trips issued by this loader.
    pub fn round_trips(&self) -> usize {
        self.batcher.round_trips()
    }
}
