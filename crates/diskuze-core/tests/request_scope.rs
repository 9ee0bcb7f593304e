//! Request boundaries: commit/rollback at the end of `Service::execute`,
//! and isolation between resolution contexts.

use std::sync::Arc;

use diskuze_core::{
    CommentInput, CreateCommentOutcome, DiscussionNode, Identity, LoaderConfig, Mutation, Query,
    Rejection, ResolutionContext, ResolveError, Service, UnitOfWork,
};
use diskuze_state::{CommentKey, MemoryStore, NewComment, Page, StorageError};
use futures::poll;

const POST: &str = "https://example.com/post";
const EMPTY: &str = "https://example.com/empty";

fn fixture() -> MemoryStore {
    let store = MemoryStore::new();
    let discussion = store.seed_discussion(POST).unwrap();
    store.seed_discussion(EMPTY).unwrap();
    let alice = store.seed_user("alice").unwrap();
    store
        .seed_comment(NewComment::new("first", discussion.key, alice.key))
        .unwrap();
    store
}

fn service(store: &MemoryStore) -> Service {
    Service::new(Arc::new(store.clone()))
}

async fn settle(store: &MemoryStore, released: usize) {
    for _ in 0..20 {
        if store.stats().released >= released {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn created_comment_is_visible_later_in_the_same_request() {
    let store = fixture();

    let listed = service(&store)
        .execute(Some("alice"), |ctx| async move {
            let created = Mutation::new(&ctx)
                .create_comment(CommentInput::new(POST, "second"))
                .await?
                .into_comment()
                .expect("created");

            let discussion = Query::new(&ctx)
                .discussion(POST)
                .await?
                .expect("discussion exists");
            let comments = discussion.comments(&ctx, Page::default()).await?;
            assert!(comments.iter().any(|c| c.key() == created.key));

            let page = Query::new(&ctx).comments(Page::default()).await?;
            Ok(page.len())
        })
        .await
        .unwrap();

    assert_eq!(listed, 2);
    assert_eq!(store.comment_count(), 2);
    assert_eq!(store.stats().committed, 1);
}

#[tokio::test]
async fn rejected_mutation_commits_without_changes() {
    let store = fixture();

    let outcome = service(&store)
        .execute(Some("alice"), |ctx| async move {
            Mutation::new(&ctx)
                .create_comment(CommentInput::new("https://example.com/nope", "hello"))
                .await
        })
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CreateCommentOutcome::Rejected(Rejection::DiscussionNotFound)
    );
    assert!(outcome.comment().is_none());
    assert_eq!(store.comment_count(), 1);
    let stats = store.stats();
    assert_eq!((stats.committed, stats.rolled_back), (1, 0));
}

#[tokio::test]
async fn failing_request_rolls_back_its_writes() {
    let store = fixture();

    let result: Result<(), ResolveError> = service(&store)
        .execute(Some("alice"), |ctx| async move {
            Mutation::new(&ctx)
                .create_comment(CommentInput::new(POST, "doomed"))
                .await?;
            Err(ResolveError::TransactionClosed)
        })
        .await;

    assert!(result.is_err());
    assert_eq!(store.comment_count(), 1);
    let stats = store.stats();
    assert_eq!((stats.committed, stats.rolled_back, stats.released), (0, 1, 1));
}

#[tokio::test]
async fn concurrent_delete_is_caught_at_commit() {
    let store = fixture();
    let writer = store.clone();

    let result = service(&store)
        .execute(Some("alice"), |ctx| async move {
            let outcome = Mutation::new(&ctx)
                .create_comment(CommentInput::new(EMPTY, "racing a delete"))
                .await?;
            assert!(outcome.comment().is_some());

            // Another writer removes the discussion before this request ends
            let empty = Query::new(&ctx).discussion(EMPTY).await?.map(|d| d.key());
            assert!(writer.delete_discussion(empty.expect("exists")).unwrap());
            Ok(outcome)
        })
        .await;

    assert!(matches!(
        result,
        Err(ResolveError::Storage(StorageError::Constraint { .. }))
    ));
    assert_eq!(store.comment_count(), 1);
    assert_eq!(store.stats().rolled_back, 1);
}

#[tokio::test]
async fn commit_failure_fails_the_request() {
    let store = fixture();
    store.fail_next_commit();

    let result = service(&store)
        .execute(Some("alice"), |ctx| async move {
            Mutation::new(&ctx)
                .create_comment(CommentInput::new(POST, "lost"))
                .await
        })
        .await;

    assert!(matches!(
        result,
        Err(ResolveError::Storage(StorageError::Connection(_)))
    ));
    assert_eq!(store.comment_count(), 1);
    let stats = store.stats();
    assert_eq!((stats.committed, stats.rolled_back, stats.released), (0, 1, 1));
}

#[tokio::test]
async fn dropped_request_rolls_back_and_releases() {
    let store = fixture();
    let svc = service(&store);

    let mut request = Box::pin(svc.execute(Some("alice"), |ctx| async move {
        Mutation::new(&ctx)
            .create_comment(CommentInput::new(POST, "abandoned"))
            .await?;
        std::future::pending::<()>().await;
        Ok(())
    }));
    assert!(poll!(request.as_mut()).is_pending());
    drop(request);

    settle(&store, 1).await;
    assert_eq!(store.comment_count(), 1);
    let stats = store.stats();
    assert_eq!((stats.rolled_back, stats.released), (1, 1));
}

#[tokio::test]
async fn contexts_never_share_cached_outcomes() {
    let store = fixture();
    let discussion = store.seed_discussion("https://example.com/later").unwrap();
    let alice_key = {
        let uow = Arc::new(UnitOfWork::begin(&store).await.unwrap());
        let mut ctx = ResolutionContext::new(Arc::clone(&uow), LoaderConfig::default());
        let identity = ctx.authenticate(Some("alice")).await.unwrap();
        uow.commit().await.unwrap();
        identity.user_key().unwrap()
    };
    let next = CommentKey(2);

    // B caches "not found" for the next comment key
    let uow_b = Arc::new(UnitOfWork::begin(&store).await.unwrap());
    let ctx_b = ResolutionContext::new(Arc::clone(&uow_b), LoaderConfig::default());
    assert!(ctx_b.comment(next).await.unwrap().is_none());

    // A creates it and commits
    let uow_a = Arc::new(UnitOfWork::begin(&store).await.unwrap());
    let ctx_a = ResolutionContext::new(Arc::clone(&uow_a), LoaderConfig::default())
        .with_identity(Identity::Authenticated(alice_key));
    let created = Mutation::new(&ctx_a)
        .create_comment(CommentInput::new("https://example.com/later", "new"))
        .await
        .unwrap()
        .into_comment()
        .unwrap();
    assert_eq!(created.key, next);
    assert_eq!(created.discussion_key, discussion.key);
    uow_a.commit().await.unwrap();

    // B keeps its resolved value for its whole lifetime
    assert!(ctx_b.comment(next).await.unwrap().is_none());
    uow_b.commit().await.unwrap();

    // A fresh context observes the write
    let uow_c = Arc::new(UnitOfWork::begin(&store).await.unwrap());
    let ctx_c = ResolutionContext::new(uow_c, LoaderConfig::default());
    let seen = ctx_c.comment(next).await.unwrap().unwrap();
    assert_eq!(seen.content, "new");
}

#[tokio::test]
async fn unknown_or_missing_names_are_anonymous() {
    let store = fixture();
    let svc = service(&store);

    for name in [None, Some(""), Some("mallory")] {
        let identity = svc
            .execute(name, |ctx| async move { Ok(ctx.identity()) })
            .await
            .unwrap();
        assert_eq!(identity, Identity::Anonymous);
    }

    let identity = svc
        .execute(Some("alice"), |ctx| async move { Ok(ctx.identity()) })
        .await
        .unwrap();
    assert!(identity.is_authenticated());
}

#[tokio::test]
async fn discussion_lookup_primes_the_loader() {
    let store = fixture();

    service(&store)
        .execute(None, |ctx| async move {
            let found: DiscussionNode = Query::new(&ctx).discussion(POST).await?.expect("exists");
            let comments = found.comments(&ctx, Page::default()).await?;
            let via_comment = comments[0].discussion(&ctx).await?;
            assert_eq!(via_comment, found);
            Ok(())
        })
        .await
        .unwrap();

    assert!(store.queries_on("discussion", "key").is_empty());
}
