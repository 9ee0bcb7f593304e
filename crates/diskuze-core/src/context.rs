//! Per-request resolution scope.
//!
//! A [`ResolutionContext`] owns one Unit-of-Work, the caller's identity
//! and one instance of every loader. It is built fresh for each request
//! by [`Service::execute`] and never shared across requests, so cached
//! rows and cached "not found" outcomes cannot leak between callers.

use std::future::Future;
use std::sync::Arc;

use diskuze_state::{
    CommentKey, CommentRecord, DiscussionKey, DiscussionRecord, Storage, UserKey, UserRecord,
};
use tracing::{debug, instrument, warn};

use crate::error::ResolveResult;
use crate::loader::{BatchLoader, LoaderConfig, RelationLoader};
use crate::sources::{
    CommentSource, DiscussionCommentsSource, DiscussionSource, RepliesSource, UserSource,
};
use crate::unit_of_work::{Session, UnitOfWork};

/// Who is making the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Identity {
    Authenticated(UserKey),
    #[default]
    Anonymous,
}

impl Identity {
    pub fn user_key(&self) -> Option<UserKey> {
        match self {
            Identity::Authenticated(key) => Some(*key),
            Identity::Anonymous => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_key().is_some()
    }
}

/// One loader per kind, all bound to the same Unit-of-Work.
pub struct LoaderRegistry {
    pub discussions: BatchLoader<DiscussionSource>,
    pub users: BatchLoader<UserSource>,
    pub comments: BatchLoader<CommentSource>,
    pub replies: RelationLoader<RepliesSource>,
    pub discussion_comments: RelationLoader<DiscussionCommentsSource>,
}

impl LoaderRegistry {
    fn new(uow: &Arc<UnitOfWork>, config: LoaderConfig) -> Self {
        Self {
            discussions: BatchLoader::new(Arc::clone(uow), config),
            users: BatchLoader::new(Arc::clone(uow), config),
            comments: BatchLoader::new(Arc::clone(uow), config),
            replies: RelationLoader::new(Arc::clone(uow), config),
            discussion_comments: RelationLoader::new(Arc::clone(uow), config),
        }
    }

    /// Round trips issued by all loaders together.
    pub fn round_trips(&self) -> usize {
        self.discussions.round_trips()
            + self.users.round_trips()
            + self.comments.round_trips()
            + self.replies.round_trips()
            + self.discussion_comments.round_trips()
    }
}

pub struct ResolutionContext {
    uow: Arc<UnitOfWork>,
    identity: Identity,
    loaders: LoaderRegistry,
}

impl ResolutionContext {
    pub fn new(uow: Arc<UnitOfWork>, config: LoaderConfig) -> Self {
        let loaders = LoaderRegistry::new(&uow, config);
        Self {
            uow,
            identity: Identity::Anonymous,
            loaders,
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Resolve a user name to an identity with a fresh read. Missing or
    /// unknown names are anonymous.
    pub async fn authenticate(&mut self, user_name: Option<&str>) -> ResolveResult<Identity> {
        let identity = match user_name.filter(|name| !name.is_empty()) {
            Some(name) => match self.session().await?.user_by_name(name).await? {
                Some(user) => Identity::Authenticated(user.key),
                None => {
                    debug!(name, "unknown user, treating as anonymous");
                    Identity::Anonymous
                }
            },
            None => Identity::Anonymous,
        };
        self.identity = identity;
        Ok(identity)
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        &self.uow
    }

    /// The raw transaction, for reads that don't fit the loaders.
    pub async fn session(&self) -> ResolveResult<Session<'_>> {
        self.uow.session().await
    }

    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    pub async fn discussion(&self, key: DiscussionKey) -> ResolveResult<Option<Arc<DiscussionRecord>>> {
        self.loaders.discussions.load(key).await
    }

    pub async fn user(&self, key: UserKey) -> ResolveResult<Option<Arc<UserRecord>>> {
        self.loaders.users.load(key).await
    }

    pub async fn comment(&self, key: CommentKey) -> ResolveResult<Option<Arc<CommentRecord>>> {
        self.loaders.comments.load(key).await
    }

    /// Replies of a comment. Every reply is also cached in the comment
    /// loader, so a later lookup by key returns the same record.
    pub async fn replies(&self, key: CommentKey) -> ResolveResult<Vec<Arc<CommentRecord>>> {
        let children = self.loaders.replies.load(key).await?;
        Ok(self.prime_comments(&children))
    }

    /// Comments of a discussion, cached in the comment loader like replies.
    pub async fn discussion_comments(
        &self,
        key: DiscussionKey,
    ) -> ResolveResult<Vec<Arc<CommentRecord>>> {
        let children = self.loaders.discussion_comments.load(key).await?;
        Ok(self.prime_comments(&children))
    }

    fn prime_comments(&self, children: &[Arc<CommentRecord>]) -> Vec<Arc<CommentRecord>> {
        children
            .iter()
            .map(|child| self.loaders.comments.prime(Arc::clone(child)))
            .collect()
    }
}

/// Entry point that runs one request inside its own resolution scope.
#[derive(Clone)]
pub struct Service {
    storage: Arc<dyn Storage>,
    loader_config: LoaderConfig,
}

impl Service {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            loader_config: LoaderConfig::default(),
        }
    }

    pub fn with_loader_config(mut self, loader_config: LoaderConfig) -> Self {
        self.loader_config = loader_config;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Run `request` against a fresh [`ResolutionContext`].
    ///
    /// The Unit-of-Work commits when `request` returns `Ok` and rolls back
    /// when it returns `Err`. A failed commit fails the request. If this
    /// future is dropped, the Unit-of-Work rolls back on drop.
    #[instrument(skip(self, request), fields(backend = self.storage.name()))]
    pub async fn execute<T, F, Fut>(&self, user_name: Option<&str>, request: F) -> ResolveResult<T>
    where
        F: FnOnce(Arc<ResolutionContext>) -> Fut,
        Fut: Future<Output = ResolveResult<T>>,
    {
        let uow = Arc::new(UnitOfWork::begin(self.storage.as_ref()).await?);
        let mut ctx = ResolutionContext::new(Arc::clone(&uow), self.loader_config);

        let result = match ctx.authenticate(user_name).await {
            Ok(_) => request(Arc::new(ctx)).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                uow.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed request also failed");
                }
                Err(e)
            }
        }
    }
}
