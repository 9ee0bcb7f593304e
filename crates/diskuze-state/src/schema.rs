//! Record definitions for the Diskuze tables
//!
//! Tables:
//! - discussion: a commentable page, addressed by its canonical name
//! - user: comment authors
//! - comment: a comment on a discussion, optionally replying to another comment
//!
//! Relationships are stored as keys, never as embedded records: a comment
//! references its discussion, author and reply target by key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a discussion canonical name
pub const MAX_CANONICAL_LEN: usize = 256;
/// Maximum length of a user name
pub const MAX_NAME_LEN: usize = 64;
/// Maximum length of comment content
pub const MAX_CONTENT_LEN: usize = 2048;

macro_rules! record_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                $name(value)
            }
        }
    };
}

record_key!(
    /// Primary key of a discussion
    DiscussionKey
);
record_key!(
    /// Primary key of a user
    UserKey
);
record_key!(
    /// Primary key of a comment
    CommentKey
);

/// Discussion record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionRecord {
    pub key: DiscussionKey,
    /// Unique canonical name (e.g. the URL of the commented page)
    pub canonical: String,
}

/// User record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub key: UserKey,
    /// Unique display name
    pub name: String,
}

/// Comment record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub key: CommentKey,
    pub content: String,
    pub discussion_key: DiscussionKey,
    pub user_key: UserKey,
    /// Comment this one replies to, if any
    pub reply_to_key: Option<CommentKey>,
    pub created_at: DateTime<Utc>,
}

/// Input for a discussion insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDiscussion {
    pub canonical: String,
}

impl NewDiscussion {
    pub fn new(canonical: impl Into<String>) -> Self {
        Self {
            canonical: canonical.into(),
        }
    }
}

/// Input for a user insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub name: String,
}

impl NewUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Input for a comment insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComment {
    pub content: String,
    pub discussion_key: DiscussionKey,
    pub user_key: UserKey,
    pub reply_to_key: Option<CommentKey>,
}

impl NewComment {
    pub fn new(content: impl Into<String>, discussion_key: DiscussionKey, user_key: UserKey) -> Self {
        Self {
            content: content.into(),
            discussion_key,
            user_key,
            reply_to_key: None,
        }
    }

    /// Mark the comment as a reply
    pub fn replying_to(mut self, reply_to_key: CommentKey) -> Self {
        self.reply_to_key = Some(reply_to_key);
        self
    }

    /// Build the stored record once a key has been allocated.
    pub fn into_record(self, key: CommentKey) -> CommentRecord {
        CommentRecord {
            key,
            content: self.content,
            discussion_key: self.discussion_key,
            user_key: self.user_key,
            reply_to_key: self.reply_to_key,
            created_at: Utc::now(),
        }
    }
}

/// Listing window: `first` rows after skipping `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub first: usize,
    pub offset: usize,
}

impl Page {
    pub const fn new(first: usize, offset: usize) -> Self {
        Self { first, offset }
    }

    /// Apply the window to an already ordered slice.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = self.offset.min(items.len());
        let end = start.saturating_add(self.first).min(items.len());
        &items[start..end]
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(10, 0)
    }
}
