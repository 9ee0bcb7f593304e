//! Graph query surface.
//!
//! Nodes hold a shared record and reference every related entity by key;
//! related entities are resolved on demand through the request's loaders.
//! Sibling fields resolved together (e.g. the authors of every comment in
//! a list) coalesce into one round trip per loader.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diskuze_state::{
    CommentKey, CommentRecord, DiscussionKey, DiscussionRecord, Page, UserKey, UserRecord,
};
use futures::future::try_join_all;
use serde::{Serialize, Serializer};

use crate::context::ResolutionContext;
use crate::error::{ResolveError, ResolveResult};
use crate::mutation::{CommentInput, CreateCommentOutcome, MutationCoordinator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentNode {
    record: Arc<CommentRecord>,
}

impl CommentNode {
    pub fn new(record: Arc<CommentRecord>) -> Self {
        Self { record }
    }

    pub fn key(&self) -> CommentKey {
        self.record.key
    }

    pub fn content(&self) -> &str {
        &self.record.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn record(&self) -> &Arc<CommentRecord> {
        &self.record
    }

    /// The comment this one replies to.
    pub async fn reply_to(&self, ctx: &ResolutionContext) -> ResolveResult<Option<CommentNode>> {
        let Some(parent) = self.record.reply_to_key else {
            return Ok(None);
        };
        Ok(ctx.comment(parent).await?.map(CommentNode::new))
    }

    pub async fn replies(&self, ctx: &ResolutionContext) -> ResolveResult<Vec<CommentNode>> {
        let replies = ctx.replies(self.record.key).await?;
        Ok(replies.into_iter().map(CommentNode::new).collect())
    }

    pub async fn discussion(&self, ctx: &ResolutionContext) -> ResolveResult<DiscussionNode> {
        let key = self.record.discussion_key;
        ctx.discussion(key)
            .await?
            .map(DiscussionNode::new)
            .ok_or_else(|| dangling("discussion", self.record.key, key))
    }

    pub async fn user(&self, ctx: &ResolutionContext) -> ResolveResult<UserNode> {
        let key = self.record.user_key;
        ctx.user(key)
            .await?
            .map(UserNode::new)
            .ok_or_else(|| dangling("user", self.record.key, key))
    }
}

impl Serialize for CommentNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.as_ref().serialize(serializer)
    }
}

fn dangling(kind: &'static str, comment: CommentKey, key: impl std::fmt::Display) -> ResolveError {
    ResolveError::contract(kind, format!("comment {comment} references missing {kind} {key}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscussionNode {
    record: Arc<DiscussionRecord>,
}

impl DiscussionNode {
    pub fn new(record: Arc<DiscussionRecord>) -> Self {
        Self { record }
    }

    pub fn key(&self) -> DiscussionKey {
        self.record.key
    }

    pub fn canonical(&self) -> &str {
        &self.record.canonical
    }

    /// A page of the discussion's comments, in key order.
    pub async fn comments(
        &self,
        ctx: &ResolutionContext,
        page: Page,
    ) -> ResolveResult<Vec<CommentNode>> {
        let comments = ctx.discussion_comments(self.record.key).await?;
        Ok(page
            .slice(&comments)
            .iter()
            .cloned()
            .map(CommentNode::new)
            .collect())
    }
}

impl Serialize for DiscussionNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.as_ref().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNode {
    record: Arc<UserRecord>,
}

impl UserNode {
    pub fn new(record: Arc<UserRecord>) -> Self {
        Self { record }
    }

    pub fn key(&self) -> UserKey {
        self.record.key
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }
}

impl Serialize for UserNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.as_ref().serialize(serializer)
    }
}

/// A comment with its author and replies, resolved down to a depth limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentThread {
    pub key: CommentKey,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<CommentKey>,
    pub replies: Vec<CommentThread>,
}

impl CommentThread {
    /// Resolve `root` and `max_depth` levels of replies below it. Each
    /// level costs one batched replies read, and all authors share one
    /// batched user read.
    pub async fn resolve(
        ctx: &ResolutionContext,
        root: CommentNode,
        max_depth: usize,
    ) -> ResolveResult<CommentThread> {
        let mut levels = vec![vec![root]];
        while levels.len() <= max_depth {
            let Some(current) = levels.last() else { break };
            let replies = try_join_all(current.iter().map(|node| node.replies(ctx))).await?;
            let next: Vec<CommentNode> = replies.into_iter().flatten().collect();
            if next.is_empty() {
                break;
            }
            levels.push(next);
        }

        let nodes: Vec<&CommentNode> = levels.iter().flatten().collect();
        let authors = try_join_all(nodes.iter().map(|node| node.user(ctx))).await?;
        let names: HashMap<CommentKey, String> = nodes
            .iter()
            .zip(authors)
            .map(|(node, author)| (node.key(), author.name().to_string()))
            .collect();

        // Assemble bottom-up, grouping each level under its parents
        let mut below: HashMap<CommentKey, Vec<CommentThread>> = HashMap::new();
        let mut top = Vec::new();
        for (depth, level) in levels.iter().enumerate().rev() {
            let mut grouped: HashMap<CommentKey, Vec<CommentThread>> = HashMap::new();
            for node in level {
                let thread = CommentThread {
                    key: node.key(),
                    content: node.content().to_string(),
                    author: names.get(&node.key()).cloned().unwrap_or_default(),
                    created_at: node.created_at(),
                    reply_to: node.record().reply_to_key,
                    replies: below.remove(&node.key()).unwrap_or_default(),
                };
                match (depth, thread.reply_to) {
                    (0, _) => top.push(thread),
                    (_, Some(parent)) => grouped.entry(parent).or_default().push(thread),
                    (_, None) => {}
                }
            }
            below = grouped;
        }

        top.pop()
            .ok_or_else(|| ResolveError::contract("comment.replies", "thread root vanished"))
    }

    /// Number of comments in the thread, root included.
    pub fn size(&self) -> usize {
        1 + self.replies.iter().map(CommentThread::size).sum::<usize>()
    }
}

/// Read-only root fields.
pub struct Query<'a> {
    ctx: &'a ResolutionContext,
}

impl<'a> Query<'a> {
    pub fn new(ctx: &'a ResolutionContext) -> Self {
        Self { ctx }
    }

    pub fn hello(&self) -> &'static str {
        "Hello World!"
    }

    /// All comments, paged, read directly through the Unit-of-Work.
    pub async fn comments(&self, page: Page) -> ResolveResult<Vec<CommentNode>> {
        let rows = self.ctx.session().await?.list_comments(page).await?;
        let comments = &self.ctx.loaders().comments;
        Ok(rows
            .into_iter()
            .map(|row| CommentNode::new(comments.prime(Arc::new(row))))
            .collect())
    }

    pub async fn comment(&self, key: CommentKey) -> ResolveResult<Option<CommentNode>> {
        Ok(self.ctx.comment(key).await?.map(CommentNode::new))
    }

    /// Discussion by canonical name.
    pub async fn discussion(&self, canonical: &str) -> ResolveResult<Option<DiscussionNode>> {
        let found = self
            .ctx
            .session()
            .await?
            .discussion_by_canonical(canonical)
            .await?;
        let discussions = &self.ctx.loaders().discussions;
        Ok(found.map(|record| DiscussionNode::new(discussions.prime(Arc::new(record)))))
    }

    /// A comment thread, or `None` when the root comment does not exist.
    pub async fn thread(
        &self,
        key: CommentKey,
        max_depth: usize,
    ) -> ResolveResult<Option<CommentThread>> {
        match self.comment(key).await? {
            Some(root) => Ok(Some(CommentThread::resolve(self.ctx, root, max_depth).await?)),
            None => Ok(None),
        }
    }
}

/// Write root fields.
pub struct Mutation<'a> {
    ctx: &'a ResolutionContext,
}

impl<'a> Mutation<'a> {
    pub fn new(ctx: &'a ResolutionContext) -> Self {
        Self { ctx }
    }

    pub async fn create_comment(&self, input: CommentInput) -> ResolveResult<CreateCommentOutcome> {
        MutationCoordinator::new(self.ctx).create_comment(input).await
    }
}
