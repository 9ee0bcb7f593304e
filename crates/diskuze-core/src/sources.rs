//! Storage bindings for every loader a request uses.

use async_trait::async_trait;
use diskuze_state::{
    CommentKey, CommentRecord, DiscussionKey, DiscussionRecord, StorageResult, Transaction,
    UserKey, UserRecord,
};

use crate::loader::{EntitySource, RelationSource};

pub struct DiscussionSource;

#[async_trait]
impl EntitySource for DiscussionSource {
    const ENTITY_TYPE: &'static str = "discussion";

    type Key = DiscussionKey;
    type Record = DiscussionRecord;

    fn key_of(record: &DiscussionRecord) -> DiscussionKey {
        record.key
    }

    async fn load_many(
        tx: &mut dyn Transaction,
        keys: &[DiscussionKey],
    ) -> StorageResult<Vec<DiscussionRecord>> {
        tx.discussions_by_keys(keys).await
    }
}

pub struct UserSource;

#[async_trait]
impl EntitySource for UserSource {
    const ENTITY_TYPE: &'static str = "user";

    type Key = UserKey;
    type Record = UserRecord;

    fn key_of(record: &UserRecord) -> UserKey {
        record.key
    }

    async fn load_many(tx: &mut dyn Transaction, keys: &[UserKey]) -> StorageResult<Vec<UserRecord>> {
        tx.users_by_keys(keys).await
    }
}

pub struct CommentSource;

#[async_trait]
impl EntitySource for CommentSource {
    const ENTITY_TYPE: &'static str = "comment";

    type Key = CommentKey;
    type Record = CommentRecord;

    fn key_of(record: &CommentRecord) -> CommentKey {
        record.key
    }

    async fn load_many(
        tx: &mut dyn Transaction,
        keys: &[CommentKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        tx.comments_by_keys(keys).await
    }
}

/// Replies of a comment: `comment.reply_to_key`.
pub struct RepliesSource;

#[async_trait]
impl RelationSource for RepliesSource {
    const RELATION: &'static str = "comment.replies";

    type ParentKey = CommentKey;
    type Child = CommentRecord;

    fn parent_of(child: &CommentRecord) -> Option<CommentKey> {
        child.reply_to_key
    }

    async fn load_children(
        tx: &mut dyn Transaction,
        parents: &[CommentKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        tx.comments_by_reply_to(parents).await
    }
}

/// Comments of a discussion: `comment.discussion_key`.
pub struct DiscussionCommentsSource;

#[async_trait]
impl RelationSource for DiscussionCommentsSource {
    const RELATION: &'static str = "discussion.comments";

    type ParentKey = DiscussionKey;
    type Child = CommentRecord;

    fn parent_of(child: &CommentRecord) -> Option<DiscussionKey> {
        Some(child.discussion_key)
    }

    async fn load_children(
        tx: &mut dyn Transaction,
        parents: &[DiscussionKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        tx.comments_by_discussion(parents).await
    }
}
