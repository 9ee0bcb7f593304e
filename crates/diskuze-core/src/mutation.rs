//! Write path: comment creation inside the request's Unit-of-Work.
//!
//! Preconditions are checked in order and stop at the first failure:
//!
//! 1. the caller is authenticated
//! 2. the content is non-empty
//! 3. the content fits the column
//! 4. the discussion exists (fresh read, not the loader cache)
//! 5. the reply target, when given, exists
//!
//! A failed precondition is a [`Rejection`] value and performs no write.
//! Storage faults, including a referential-integrity violation raised by a
//! concurrent delete, are hard errors that roll the whole request back.

use std::fmt;
use std::sync::Arc;

use diskuze_state::{CommentKey, CommentRecord, NewComment, MAX_CONTENT_LEN};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::context::ResolutionContext;
use crate::error::ResolveResult;

/// Input of `create_comment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentInput {
    pub content: String,
    /// Canonical name of the discussion
    pub discussion: String,
    #[serde(default)]
    pub reply_to: Option<CommentKey>,
}

impl CommentInput {
    pub fn new(discussion: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            discussion: discussion.into(),
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, key: CommentKey) -> Self {
        self.reply_to = Some(key);
        self
    }
}

/// Why a comment was not created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    Unauthenticated,
    EmptyContent,
    ContentTooLong,
    DiscussionNotFound,
    ReplyTargetNotFound,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::Unauthenticated => "caller is not authenticated",
            Rejection::EmptyContent => "content is empty",
            Rejection::ContentTooLong => "content is too long",
            Rejection::DiscussionNotFound => "discussion does not exist",
            Rejection::ReplyTargetNotFound => "reply target does not exist",
        };
        f.write_str(reason)
    }
}

/// Result of `create_comment`; never a partial success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateCommentOutcome {
    Created(Arc<CommentRecord>),
    Rejected(Rejection),
}

impl CreateCommentOutcome {
    /// The created comment, or `None` for any rejection.
    pub fn comment(&self) -> Option<&Arc<CommentRecord>> {
        match self {
            CreateCommentOutcome::Created(comment) => Some(comment),
            CreateCommentOutcome::Rejected(_) => None,
        }
    }

    pub fn into_comment(self) -> Option<Arc<CommentRecord>> {
        match self {
            CreateCommentOutcome::Created(comment) => Some(comment),
            CreateCommentOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            CreateCommentOutcome::Created(_) => None,
            CreateCommentOutcome::Rejected(rejection) => Some(*rejection),
        }
    }
}

pub struct MutationCoordinator<'a> {
    ctx: &'a ResolutionContext,
}

impl<'a> MutationCoordinator<'a> {
    pub fn new(ctx: &'a ResolutionContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, input), fields(discussion = %input.discussion, reply_to = ?input.reply_to))]
    pub async fn create_comment(&self, input: CommentInput) -> ResolveResult<CreateCommentOutcome> {
        let Some(user_key) = self.ctx.identity().user_key() else {
            return Ok(reject(Rejection::Unauthenticated));
        };
        if input.content.is_empty() {
            return Ok(reject(Rejection::EmptyContent));
        }
        if input.content.len() > MAX_CONTENT_LEN {
            return Ok(reject(Rejection::ContentTooLong));
        }

        let mut session = self.ctx.session().await?;
        let Some(discussion) = session.discussion_by_canonical(&input.discussion).await? else {
            return Ok(reject(Rejection::DiscussionNotFound));
        };
        if let Some(reply_to) = input.reply_to {
            if !session.comment_exists(reply_to).await? {
                return Ok(reject(Rejection::ReplyTargetNotFound));
            }
        }

        let mut new = NewComment::new(input.content, discussion.key, user_key);
        if let Some(reply_to) = input.reply_to {
            new = new.replying_to(reply_to);
        }
        let record = session.insert_comment(new).await?;
        drop(session);

        info!(key = %record.key, "comment created");
        let loaders = self.ctx.loaders();
        let comment = loaders.comments.record_written(Arc::new(record));
        loaders
            .discussion_comments
            .append(comment.discussion_key, Arc::clone(&comment));
        if let Some(parent) = comment.reply_to_key {
            loaders.replies.append(parent, Arc::clone(&comment));
        }
        Ok(CreateCommentOutcome::Created(comment))
    }
}

fn reject(rejection: Rejection) -> CreateCommentOutcome {
    debug!(%rejection, "create_comment rejected");
    CreateCommentOutcome::Rejected(rejection)
}
