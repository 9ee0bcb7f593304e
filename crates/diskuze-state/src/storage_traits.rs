//! Storage trait definitions for Diskuze
//!
//! These traits define the storage boundary the core coordinates against:
//! - `Storage`: acquires a connection and opens a transaction
//! - `Transaction`: one live transaction exposing batched `IN` reads,
//!   point lookups, listing and inserts
//!
//! All traits are async and backend-agnostic. An in-memory transactional
//! store is provided in the `fakes` module; `SurrealStore` is the
//! persistent backend.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{
    CommentKey, CommentRecord, DiscussionKey, DiscussionRecord, NewComment, NewDiscussion,
    NewUser, Page, UserKey, UserRecord,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Transactional storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Acquire a connection and open a transaction on it.
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>>;
}

/// One live storage transaction.
///
/// Guarantees:
/// - Reads observe committed data plus this transaction's own writes.
/// - Multi-row reads return rows in ascending key order.
/// - Inserts check foreign keys against the visible state; `commit`
///   re-validates them against committed state and applies all writes
///   atomically or none of them.
/// - Dropping the transaction without `commit` discards its writes, and
///   dropping always releases the connection.
#[async_trait]
pub trait Transaction: Send {
    /// `SELECT * FROM discussion WHERE key IN (keys)`
    async fn discussions_by_keys(
        &mut self,
        keys: &[DiscussionKey],
    ) -> StorageResult<Vec<DiscussionRecord>>;

    /// `SELECT * FROM user WHERE key IN (keys)`
    async fn users_by_keys(&mut self, keys: &[UserKey]) -> StorageResult<Vec<UserRecord>>;

    /// `SELECT * FROM comment WHERE key IN (keys)`
    async fn comments_by_keys(&mut self, keys: &[CommentKey])
        -> StorageResult<Vec<CommentRecord>>;

    /// `SELECT * FROM comment WHERE reply_to_key IN (parents)`
    async fn comments_by_reply_to(
        &mut self,
        parents: &[CommentKey],
    ) -> StorageResult<Vec<CommentRecord>>;

    /// `SELECT * FROM comment WHERE discussion_key IN (parents)`
    async fn comments_by_discussion(
        &mut self,
        parents: &[DiscussionKey],
    ) -> StorageResult<Vec<CommentRecord>>;

    /// `SELECT * FROM discussion WHERE canonical = ?`
    async fn discussion_by_canonical(
        &mut self,
        canonical: &str,
    ) -> StorageResult<Option<DiscussionRecord>>;

    /// `SELECT * FROM user WHERE name = ?`
    async fn user_by_name(&mut self, name: &str) -> StorageResult<Option<UserRecord>>;

    /// `SELECT EXISTS(SELECT * FROM comment WHERE key = ?)`
    async fn comment_exists(&mut self, key: CommentKey) -> StorageResult<bool>;

    /// `SELECT * FROM comment ORDER BY key LIMIT first OFFSET offset`
    async fn list_comments(&mut self, page: Page) -> StorageResult<Vec<CommentRecord>>;

    async fn insert_discussion(&mut self, new: NewDiscussion) -> StorageResult<DiscussionRecord>;

    async fn insert_user(&mut self, new: NewUser) -> StorageResult<UserRecord>;

    /// Insert a comment. Fails with `StorageError::Constraint` when the
    /// discussion, author or reply target is not visible.
    async fn insert_comment(&mut self, new: NewComment) -> StorageResult<CommentRecord>;

    /// Make all writes durable and visible to other transactions.
    async fn commit(&mut self) -> StorageResult<()>;

    /// Discard all writes.
    async fn rollback(&mut self) -> StorageResult<()>;
}
