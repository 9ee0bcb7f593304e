//! Diskuze-State: storage layer for the Diskuze comment service
//!
//! Holds the record definitions and the transactional storage boundary the
//! request core coordinates against.
//!
//! ## Key Components
//!
//! - `Storage` / `Transaction`: backend-agnostic transaction API with
//!   batched `IN` reads
//! - `MemoryStore`: in-memory transactional store with query logging, used
//!   by tests and the demo CLI
//! - `SurrealStore`: SurrealDB backend (in-memory, embedded or remote)

mod config;
mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod storage_traits;

pub use config::StoreConfig;
pub use error::StorageError;
pub use fakes::{LifecycleStats, MemoryStore, QueryRecord};
pub use handle::{SurrealStore, SurrealTransaction};
pub use schema::{
    CommentKey, CommentRecord, DiscussionKey, DiscussionRecord, NewComment, NewDiscussion,
    NewUser, Page, UserKey, UserRecord, MAX_CANONICAL_LEN, MAX_CONTENT_LEN, MAX_NAME_LEN,
};
pub use storage_traits::{Storage, StorageResult, Transaction};
