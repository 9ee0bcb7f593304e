//! In-memory transactional store
//!
//! Provides `MemoryStore`, a `Storage` implementation that keeps committed
//! tables behind a mutex and gives every transaction a private write set.
//! It enforces the same unique and foreign-key constraints a relational
//! backend would, and records every query so tests can count round trips.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::{Storage, StorageResult, Transaction};

/// One read issued against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub table: &'static str,
    /// Filtered column (`key`, `reply_to_key`, `canonical`, ...); `*` for listings
    pub column: &'static str,
    /// Parameter set of an `IN` read, sorted; empty for other reads
    pub keys: Vec<i64>,
}

/// Transaction lifecycle counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub released: usize,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    discussions: BTreeMap<DiscussionKey, DiscussionRecord>,
    users: BTreeMap<UserKey, UserRecord>,
    comments: BTreeMap<CommentKey, CommentRecord>,
}

impl Tables {
    fn is_empty(&self) -> bool {
        self.discussions.is_empty() && self.users.is_empty() && self.comments.is_empty()
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    next_discussion: AtomicI64,
    next_user: AtomicI64,
    next_comment: AtomicI64,
    queries: Mutex<Vec<QueryRecord>>,
    stats: Mutex<LifecycleStats>,
    fail_next_commit: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn log(&self, table: &'static str, column: &'static str, keys: Vec<i64>) {
        let mut keys = keys;
        keys.sort_unstable();
        debug!(table, column, keys = keys.len(), "memory store query");
        lock(&self.queries).push(QueryRecord {
            table,
            column,
            keys,
        });
    }
}

/// In-memory `Storage` backend.
///
/// Cloning yields another handle to the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All reads issued so far, in order.
    pub fn queries(&self) -> Vec<QueryRecord> {
        lock(&self.shared.queries).clone()
    }

    /// Reads filtered by table and column.
    pub fn queries_on(&self, table: &str, column: &str) -> Vec<QueryRecord> {
        lock(&self.shared.queries)
            .iter()
            .filter(|q| q.table == table && q.column == column)
            .cloned()
            .collect()
    }

    pub fn clear_queries(&self) {
        lock(&self.shared.queries).clear();
    }

    pub fn stats(&self) -> LifecycleStats {
        *lock(&self.shared.stats)
    }

    /// Make the next `commit` fail with a connection error.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of committed comments.
    pub fn comment_count(&self) -> usize {
        lock(&self.shared.tables).comments.len()
    }

    /// Committed comment by key, bypassing transactions.
    pub fn committed_comment(&self, key: CommentKey) -> Option<CommentRecord> {
        lock(&self.shared.tables).comments.get(&key).cloned()
    }

    /// Insert and commit a discussion outside any transaction.
    pub fn seed_discussion(&self, canonical: &str) -> StorageResult<DiscussionRecord> {
        let mut tables = lock(&self.shared.tables);
        check_discussion(&tables, canonical)?;
        let key = DiscussionKey(next_key(&self.shared.next_discussion));
        let record = DiscussionRecord {
            key,
            canonical: canonical.to_string(),
        };
        tables.discussions.insert(key, record.clone());
        Ok(record)
    }

    /// Insert and commit a user outside any transaction.
    pub fn seed_user(&self, name: &str) -> StorageResult<UserRecord> {
        let mut tables = lock(&self.shared.tables);
        check_user(&tables, name)?;
        let key = UserKey(next_key(&self.shared.next_user));
        let record = UserRecord {
            key,
            name: name.to_string(),
        };
        tables.users.insert(key, record.clone());
        Ok(record)
    }

    /// Insert and commit a comment outside any transaction.
    pub fn seed_comment(&self, new: NewComment) -> StorageResult<CommentRecord> {
        let mut tables = lock(&self.shared.tables);
        check_comment(&tables, &Tables::default(), &new)?;
        let key = CommentKey(next_key(&self.shared.next_comment));
        let record = new.into_record(key);
        tables.comments.insert(key, record.clone());
        Ok(record)
    }

    /// Delete a committed discussion, as a concurrent writer would.
    ///
    /// Rejected while committed comments still reference it.
    pub fn delete_discussion(&self, key: DiscussionKey) -> StorageResult<bool> {
        let mut tables = lock(&self.shared.tables);
        if tables.comments.values().any(|c| c.discussion_key == key) {
            return Err(StorageError::constraint(
                "discussion",
                format!("discussion {key} is referenced by comments"),
            ));
        }
        Ok(tables.discussions.remove(&key).is_some())
    }
}

fn next_key(sequence: &AtomicI64) -> i64 {
    sequence.fetch_add(1, Ordering::SeqCst) + 1
}

fn check_discussion(visible: &Tables, canonical: &str) -> StorageResult<()> {
    if canonical.is_empty() || canonical.len() > MAX_CANONICAL_LEN {
        return Err(StorageError::constraint(
            "discussion",
            format!("canonical name must be 1..={MAX_CANONICAL_LEN} bytes"),
        ));
    }
    if visible.discussions.values().any(|d| d.canonical == canonical) {
        return Err(StorageError::constraint(
            "discussion",
            format!("canonical '{canonical}' already exists"),
        ));
    }
    Ok(())
}

fn check_user(visible: &Tables, name: &str) -> StorageResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(StorageError::constraint(
            "user",
            format!("name must be 1..={MAX_NAME_LEN} bytes"),
        ));
    }
    if visible.users.values().any(|u| u.name == name) {
        return Err(StorageError::constraint(
            "user",
            format!("name '{name}' already exists"),
        ));
    }
    Ok(())
}

/// Validate a comment against `committed` overlaid with `staged`.
fn check_comment(committed: &Tables, staged: &Tables, new: &NewComment) -> StorageResult<()> {
    if new.content.len() > MAX_CONTENT_LEN {
        return Err(StorageError::constraint(
            "comment",
            format!("content exceeds {MAX_CONTENT_LEN} bytes"),
        ));
    }
    let has_discussion = committed.discussions.contains_key(&new.discussion_key)
        || staged.discussions.contains_key(&new.discussion_key);
    if !has_discussion {
        return Err(StorageError::constraint(
            "comment",
            format!("discussion {} does not exist", new.discussion_key),
        ));
    }
    let has_user = committed.users.contains_key(&new.user_key)
        || staged.users.contains_key(&new.user_key);
    if !has_user {
        return Err(StorageError::constraint(
            "comment",
            format!("user {} does not exist", new.user_key),
        ));
    }
    if let Some(parent) = new.reply_to_key {
        let has_parent =
            committed.comments.contains_key(&parent) || staged.comments.contains_key(&parent);
        if !has_parent {
            return Err(StorageError::constraint(
                "comment",
                format!("reply target {parent} does not exist"),
            ));
        }
    }
    Ok(())
}

/// Rows of `committed` overlaid with `staged` that satisfy `keep`, in key order.
fn merged<K, V>(
    committed: &BTreeMap<K, V>,
    staged: &BTreeMap<K, V>,
    keep: impl Fn(&V) -> bool,
) -> Vec<V>
where
    K: Ord + Copy,
    V: Clone,
{
    let mut rows: BTreeMap<K, V> = committed
        .iter()
        .filter(|(_, v)| keep(v))
        .map(|(k, v)| (*k, v.clone()))
        .collect();
    rows.extend(
        staged
            .iter()
            .filter(|(_, v)| keep(v))
            .map(|(k, v)| (*k, v.clone())),
    );
    rows.into_values().collect()
}

#[async_trait]
impl Storage for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        lock(&self.shared.stats).begun += 1;
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            staged: Tables::default(),
            closed: false,
        }))
    }
}

/// A `MemoryStore` transaction with a private write set.
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    staged: Tables,
    closed: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::TransactionClosed);
        }
        Ok(())
    }

    /// Committed tables overlaid with this transaction's writes.
    fn visible(&self) -> Tables {
        let committed = lock(&self.shared.tables);
        let mut view = committed.clone();
        view.discussions.extend(self.staged.discussions.clone());
        view.users.extend(self.staged.users.clone());
        view.comments.extend(self.staged.comments.clone());
        view
    }

    fn select_comments(&self, keep: impl Fn(&CommentRecord) -> bool) -> Vec<CommentRecord> {
        let committed = lock(&self.shared.tables);
        merged(&committed.comments, &self.staged.comments, keep)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn discussions_by_keys(
        &mut self,
        keys: &[DiscussionKey],
    ) -> StorageResult<Vec<DiscussionRecord>> {
        self.ensure_open()?;
        self.shared
            .log("discussion", "key", keys.iter().map(|k| k.0).collect());
        let committed = lock(&self.shared.tables);
        Ok(merged(
            &committed.discussions,
            &self.staged.discussions,
            |d| keys.contains(&d.key),
        ))
    }

    async fn users_by_keys(&mut self, keys: &[UserKey]) -> StorageResult<Vec<UserRecord>> {
        self.ensure_open()?;
        self.shared
            .log("user", "key", keys.iter().map(|k| k.0).collect());
        let committed = lock(&self.shared.tables);
        Ok(merged(&committed.users, &self.staged.users, |u| {
            keys.contains(&u.key)
        }))
    }

    async fn comments_by_keys(
        &mut self,
        keys: &[CommentKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        self.shared
            .log("comment", "key", keys.iter().map(|k| k.0).collect());
        Ok(self.select_comments(|c| keys.contains(&c.key)))
    }

    async fn comments_by_reply_to(
        &mut self,
        parents: &[CommentKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        self.shared.log(
            "comment",
            "reply_to_key",
            parents.iter().map(|k| k.0).collect(),
        );
        Ok(self.select_comments(|c| c.reply_to_key.is_some_and(|p| parents.contains(&p))))
    }

    async fn comments_by_discussion(
        &mut self,
        parents: &[DiscussionKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        self.shared.log(
            "comment",
            "discussion_key",
            parents.iter().map(|k| k.0).collect(),
        );
        Ok(self.select_comments(|c| parents.contains(&c.discussion_key)))
    }

    async fn discussion_by_canonical(
        &mut self,
        canonical: &str,
    ) -> StorageResult<Option<DiscussionRecord>> {
        self.ensure_open()?;
        self.shared.log("discussion", "canonical", Vec::new());
        let committed = lock(&self.shared.tables);
        Ok(merged(
            &committed.discussions,
            &self.staged.discussions,
            |d| d.canonical == canonical,
        )
        .into_iter()
        .next())
    }

    async fn user_by_name(&mut self, name: &str) -> StorageResult<Option<UserRecord>> {
        self.ensure_open()?;
        self.shared.log("user", "name", Vec::new());
        let committed = lock(&self.shared.tables);
        Ok(merged(&committed.users, &self.staged.users, |u| u.name == name)
            .into_iter()
            .next())
    }

    async fn comment_exists(&mut self, key: CommentKey) -> StorageResult<bool> {
        self.ensure_open()?;
        self.shared.log("comment", "exists", vec![key.0]);
        let committed = lock(&self.shared.tables);
        Ok(committed.comments.contains_key(&key) || self.staged.comments.contains_key(&key))
    }

    async fn list_comments(&mut self, page: Page) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        self.shared.log("comment", "*", Vec::new());
        let rows = self.select_comments(|_| true);
        Ok(page.slice(&rows).to_vec())
    }

    async fn insert_discussion(&mut self, new: NewDiscussion) -> StorageResult<DiscussionRecord> {
        self.ensure_open()?;
        check_discussion(&self.visible(), &new.canonical)?;
        let key = DiscussionKey(next_key(&self.shared.next_discussion));
        let record = DiscussionRecord {
            key,
            canonical: new.canonical,
        };
        self.staged.discussions.insert(key, record.clone());
        Ok(record)
    }

    async fn insert_user(&mut self, new: NewUser) -> StorageResult<UserRecord> {
        self.ensure_open()?;
        check_user(&self.visible(), &new.name)?;
        let key = UserKey(next_key(&self.shared.next_user));
        let record = UserRecord {
            key,
            name: new.name,
        };
        self.staged.users.insert(key, record.clone());
        Ok(record)
    }

    async fn insert_comment(&mut self, new: NewComment) -> StorageResult<CommentRecord> {
        self.ensure_open()?;
        {
            let committed = lock(&self.shared.tables);
            check_comment(&committed, &self.staged, &new)?;
        }
        let key = CommentKey(next_key(&self.shared.next_comment));
        let record = new.into_record(key);
        self.staged.comments.insert(key, record.clone());
        Ok(record)
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Connection(
                "connection lost during commit".to_string(),
            ));
        }

        let staged = std::mem::take(&mut self.staged);
        let mut committed = lock(&self.shared.tables);

        // Validate the whole write set before applying any of it
        let mut view = committed.clone();
        for discussion in staged.discussions.values() {
            check_discussion(&view, &discussion.canonical)?;
            view.discussions.insert(discussion.key, discussion.clone());
        }
        for user in staged.users.values() {
            check_user(&view, &user.name)?;
            view.users.insert(user.key, user.clone());
        }
        for comment in staged.comments.values() {
            let new = NewComment {
                content: comment.content.clone(),
                discussion_key: comment.discussion_key,
                user_key: comment.user_key,
                reply_to_key: comment.reply_to_key,
            };
            check_comment(&view, &Tables::default(), &new)?;
            view.comments.insert(comment.key, comment.clone());
        }

        if !staged.is_empty() {
            *committed = view;
        }
        drop(committed);

        self.closed = true;
        lock(&self.shared.stats).committed += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.staged = Tables::default();
        self.closed = true;
        lock(&self.shared.stats).rolled_back += 1;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.closed && !self.staged.is_empty() {
            debug!("discarding uncommitted memory transaction writes");
        }
        lock(&self.shared.stats).released += 1;
    }
}
