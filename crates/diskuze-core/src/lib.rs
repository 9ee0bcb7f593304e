//! Diskuze Core
//!
//! Request-scoped coordination between graph resolvers and storage:
//!
//! - `UnitOfWork`: one transaction per request, commit or rollback
//! - `BatchLoader` / `RelationLoader`: coalesce concurrent lookups into
//!   batched `IN (...)` reads with a per-request cache
//! - `ResolutionContext`: the per-request aggregate resolvers depend on
//! - `MutationCoordinator`: validated writes inside the request's
//!   transaction
//! - `graph`: the query and mutation surface built on top

pub mod context;
pub mod error;
pub mod graph;
pub mod loader;
pub mod mutation;
pub mod sources;
pub mod telemetry;
pub mod unit_of_work;

pub use context::{Identity, LoaderRegistry, ResolutionContext, Service};
pub use error::{ResolveError, ResolveResult};
pub use graph::{CommentNode, CommentThread, DiscussionNode, Mutation, Query, UserNode};
pub use loader::{
    BatchLoader, Children, EntitySource, LoaderConfig, RelationLoader, RelationSource,
    DEFAULT_MAX_BATCH_SIZE,
};
pub use mutation::{
    CommentInput, CreateCommentOutcome, MutationCoordinator, Rejection,
};
pub use unit_of_work::{Session, UnitOfWork, UnitOfWorkState};

pub use diskuze_state::{
    CommentKey, CommentRecord, DiscussionKey, DiscussionRecord, MemoryStore, Page, Storage,
    StoreConfig, SurrealStore, UserKey, UserRecord,
};
