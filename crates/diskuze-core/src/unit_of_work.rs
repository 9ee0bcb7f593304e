//! Unit-of-Work: one storage transaction bound to one request.
//!
//! States: `Open -> Committing -> Committed` or
//! `Open -> RollingBack -> RolledBack`. Both terminal states release the
//! underlying transaction exactly once. A failed commit is followed by a
//! rollback before release. Dropping an open Unit-of-Work rolls back.
//!
//! Every loader and the mutation coordinator in a request share one
//! `Arc<UnitOfWork>`, so all reads and writes of that request go through
//! the same transaction.

use std::sync::{Mutex as StdMutex, PoisonError};

use diskuze_state::{Storage, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use crate::error::{ResolveError, ResolveResult};

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    Open,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl UnitOfWorkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitOfWorkState::Committed | UnitOfWorkState::RolledBack)
    }
}

/// Exclusive access to the live transaction for one storage round trip.
pub type Session<'a> = MappedMutexGuard<'a, dyn Transaction>;

pub struct UnitOfWork {
    backend: &'static str,
    transaction: Mutex<Option<Box<dyn Transaction>>>,
    state: StdMutex<UnitOfWorkState>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("backend", &self.backend)
            .field("state", &self.state())
            .finish()
    }
}

impl UnitOfWork {
    /// Acquire a connection and open a transaction on it.
    #[instrument(skip(storage), fields(backend = storage.name()))]
    pub async fn begin(storage: &dyn Storage) -> ResolveResult<Self> {
        let transaction = storage.begin().await?;
        debug!("unit of work opened");
        Ok(Self {
            backend: storage.name(),
            transaction: Mutex::new(Some(transaction)),
            state: StdMutex::new(UnitOfWorkState::Open),
        })
    }

    pub fn state(&self) -> UnitOfWorkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: UnitOfWorkState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Move `Open -> next`, failing when the Unit-of-Work already left `Open`.
    fn transition_from_open(&self, next: UnitOfWorkState) -> ResolveResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != UnitOfWorkState::Open {
            return Err(ResolveError::TransactionClosed);
        }
        *state = next;
        Ok(())
    }

    /// Borrow the live transaction. Concurrent callers queue up behind
    /// each other; every one of them observes the same transaction.
    pub async fn session(&self) -> ResolveResult<Session<'_>> {
        if self.state() != UnitOfWorkState::Open {
            return Err(ResolveError::TransactionClosed);
        }
        let guard = self.transaction.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_deref_mut())
            .map_err(|_| ResolveError::TransactionClosed)
    }

    /// Commit. If the commit itself fails the transaction is rolled back
    /// before it is released and the commit error is returned.
    #[instrument(skip(self), fields(backend = self.backend))]
    pub async fn commit(&self) -> ResolveResult<()> {
        self.transition_from_open(UnitOfWorkState::Committing)?;
        let Some(mut transaction) = self.transaction.lock().await.take() else {
            self.set_state(UnitOfWorkState::RolledBack);
            return Err(ResolveError::TransactionClosed);
        };

        match transaction.commit().await {
            Ok(()) => {
                self.set_state(UnitOfWorkState::Committed);
                debug!("unit of work committed");
                Ok(())
            }
            Err(commit_err) => {
                warn!(error = %commit_err, "commit failed, rolling back");
                self.set_state(UnitOfWorkState::RollingBack);
                if let Err(rollback_err) = transaction.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed commit also failed");
                }
                self.set_state(UnitOfWorkState::RolledBack);
                Err(commit_err.into())
            }
        }
    }

    /// Discard every write made through this Unit-of-Work.
    #[instrument(skip(self), fields(backend = self.backend))]
    pub async fn rollback(&self) -> ResolveResult<()> {
        self.transition_from_open(UnitOfWorkState::RollingBack)?;
        let taken = self.transaction.lock().await.take();
        let result = match taken {
            Some(mut transaction) => transaction.rollback().await,
            None => Ok(()),
        };
        self.set_state(UnitOfWorkState::RolledBack);
        debug!("unit of work rolled back");
        result.map_err(ResolveError::from)
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return;
        }
        *state = UnitOfWorkState::RolledBack;

        let Some(mut transaction) = self.transaction.get_mut().take() else {
            return;
        };
        warn!(backend = self.backend, "unit of work dropped while open, rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transaction.rollback().await {
                        warn!(error = %e, "rollback of dropped unit of work failed");
                    }
                });
            }
            // Without a runtime the transaction's own drop discards its writes
            Err(_) => drop(transaction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskuze_state::{MemoryStore, NewComment, Page};

    async fn settle(store: &MemoryStore, released: usize) {
        for _ in 0..10 {
            if store.stats().released >= released {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_durable_and_releases() {
        let store = MemoryStore::new();
        let discussion = store.seed_discussion("d").unwrap();
        let user = store.seed_user("alice").unwrap();

        let uow = UnitOfWork::begin(&store).await.unwrap();
        uow.session()
            .await
            .unwrap()
            .insert_comment(NewComment::new("hi", discussion.key, user.key))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        assert_eq!(uow.state(), UnitOfWorkState::Committed);
        assert_eq!(store.comment_count(), 1);
        let stats = store.stats();
        assert_eq!((stats.committed, stats.released), (1, 1));
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_before_release() {
        let store = MemoryStore::new();
        let discussion = store.seed_discussion("d").unwrap();
        let user = store.seed_user("alice").unwrap();

        let uow = UnitOfWork::begin(&store).await.unwrap();
        uow.session()
            .await
            .unwrap()
            .insert_comment(NewComment::new("hi", discussion.key, user.key))
            .await
            .unwrap();
        store.fail_next_commit();

        let err = uow.commit().await.unwrap_err();
        assert!(matches!(err, ResolveError::Storage(_)));
        assert_eq!(uow.state(), UnitOfWorkState::RolledBack);
        assert_eq!(store.comment_count(), 0);
        let stats = store.stats();
        assert_eq!((stats.committed, stats.rolled_back, stats.released), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_closed_unit_of_work_refuses_sessions() {
        let store = MemoryStore::new();
        let uow = UnitOfWork::begin(&store).await.unwrap();
        uow.rollback().await.unwrap();

        assert!(matches!(
            uow.session().await,
            Err(ResolveError::TransactionClosed)
        ));
        assert_eq!(uow.commit().await, Err(ResolveError::TransactionClosed));
        assert_eq!(uow.rollback().await, Err(ResolveError::TransactionClosed));
    }

    #[tokio::test]
    async fn test_drop_while_open_rolls_back() {
        let store = MemoryStore::new();
        let discussion = store.seed_discussion("d").unwrap();
        let user = store.seed_user("alice").unwrap();

        {
            let uow = UnitOfWork::begin(&store).await.unwrap();
            let mut session = uow.session().await.unwrap();
            session
                .insert_comment(NewComment::new("lost", discussion.key, user.key))
                .await
                .unwrap();
            session.list_comments(Page::default()).await.unwrap();
        }
        settle(&store, 1).await;

        let stats = store.stats();
        assert_eq!((stats.rolled_back, stats.released), (1, 1));
        assert_eq!(store.comment_count(), 0);
    }

    #[test]
    fn test_drop_without_runtime_still_releases() {
        let store = MemoryStore::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let uow = runtime
            .block_on(UnitOfWork::begin(&store))
            .unwrap();
        drop(runtime);

        drop(uow);
        let stats = store.stats();
        assert_eq!((stats.rolled_back, stats.released), (0, 1));
    }
}
