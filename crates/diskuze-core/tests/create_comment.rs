//! Precondition order and outcomes of comment creation.

use std::sync::Arc;

use diskuze_core::{
    CommentInput, CreateCommentOutcome, Identity, LoaderConfig, MutationCoordinator, Rejection,
    ResolutionContext, UnitOfWork,
};
use diskuze_state::{
    CommentKey, DiscussionRecord, MemoryStore, NewComment, UserRecord, MAX_CONTENT_LEN,
};

const POST: &str = "https://example.com/post";

struct Fixture {
    store: MemoryStore,
    discussion: DiscussionRecord,
    alice: UserRecord,
}

fn fixture() -> Fixture {
    let store = MemoryStore::new();
    let discussion = store.seed_discussion(POST).unwrap();
    let alice = store.seed_user("alice").unwrap();
    store
        .seed_comment(NewComment::new("root", discussion.key, alice.key))
        .unwrap();
    Fixture {
        store,
        discussion,
        alice,
    }
}

async fn create(
    fixture: &Fixture,
    identity: Identity,
    input: CommentInput,
) -> CreateCommentOutcome {
    let uow = Arc::new(UnitOfWork::begin(&fixture.store).await.unwrap());
    let ctx = ResolutionContext::new(Arc::clone(&uow), LoaderConfig::default())
        .with_identity(identity);
    let outcome = MutationCoordinator::new(&ctx)
        .create_comment(input)
        .await
        .unwrap();
    uow.commit().await.unwrap();
    outcome
}

#[tokio::test]
async fn anonymous_caller_is_rejected_first() {
    let fx = fixture();

    // Also empty and aimed at a missing discussion: authentication wins
    let outcome = create(
        &fx,
        Identity::Anonymous,
        CommentInput::new("https://example.com/missing", ""),
    )
    .await;

    assert_eq!(outcome.rejection(), Some(Rejection::Unauthenticated));
    assert_eq!(fx.store.comment_count(), 1);
}

#[tokio::test]
async fn content_is_checked_before_the_discussion() {
    let fx = fixture();
    let me = Identity::Authenticated(fx.alice.key);

    let empty = create(&fx, me, CommentInput::new("https://example.com/missing", "")).await;
    assert_eq!(empty.rejection(), Some(Rejection::EmptyContent));

    let long = "x".repeat(MAX_CONTENT_LEN + 1);
    let too_long = create(&fx, me, CommentInput::new(POST, long)).await;
    assert_eq!(too_long.rejection(), Some(Rejection::ContentTooLong));

    // No storage read happened for either rejection
    assert!(fx.store.queries_on("discussion", "canonical").is_empty());
}

#[tokio::test]
async fn missing_reply_target_is_rejected() {
    let fx = fixture();
    let me = Identity::Authenticated(fx.alice.key);

    let outcome = create(
        &fx,
        me,
        CommentInput::new(POST, "hello").replying_to(CommentKey(404)),
    )
    .await;

    assert_eq!(outcome.rejection(), Some(Rejection::ReplyTargetNotFound));
    assert_eq!(fx.store.comment_count(), 1);
}

#[tokio::test]
async fn valid_reply_is_stored_with_its_target() {
    let fx = fixture();
    let me = Identity::Authenticated(fx.alice.key);

    let outcome = create(
        &fx,
        me,
        CommentInput::new(POST, "a reply").replying_to(CommentKey(1)),
    )
    .await;

    let created = outcome.into_comment().expect("created");
    assert_eq!(created.reply_to_key, Some(CommentKey(1)));
    assert_eq!(created.discussion_key, fx.discussion.key);
    assert_eq!(created.user_key, fx.alice.key);

    let stored = fx.store.committed_comment(created.key).expect("committed");
    assert_eq!(stored.content, "a reply");
}

#[tokio::test]
async fn discussion_check_reads_through_the_transaction() {
    let fx = fixture();
    let me = Identity::Authenticated(fx.alice.key);

    create(&fx, me, CommentInput::new(POST, "hello")).await;

    let lookups = fx.store.queries_on("discussion", "canonical");
    assert_eq!(lookups.len(), 1);
    // The entity loader was never involved
    assert!(fx.store.queries_on("discussion", "key").is_empty());
}

#[tokio::test]
async fn created_comment_is_cached_for_the_request() {
    let fx = fixture();
    let uow = Arc::new(UnitOfWork::begin(&fx.store).await.unwrap());
    let ctx = ResolutionContext::new(Arc::clone(&uow), LoaderConfig::default())
        .with_identity(Identity::Authenticated(fx.alice.key));

    let created = MutationCoordinator::new(&ctx)
        .create_comment(CommentInput::new(POST, "cached"))
        .await
        .unwrap()
        .into_comment()
        .unwrap();

    let loaded = ctx.comment(created.key).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&created, &loaded));
    assert!(fx.store.queries_on("comment", "key").is_empty());
    uow.rollback().await.unwrap();
}

#[tokio::test]
async fn loaded_discussion_listing_includes_the_new_comment() {
    let fx = fixture();
    let uow = Arc::new(UnitOfWork::begin(&fx.store).await.unwrap());
    let ctx = ResolutionContext::new(Arc::clone(&uow), LoaderConfig::default())
        .with_identity(Identity::Authenticated(fx.alice.key));

    let before = ctx.discussion_comments(fx.discussion.key).await.unwrap();
    assert_eq!(before.len(), 1);

    let created = MutationCoordinator::new(&ctx)
        .create_comment(CommentInput::new(POST, "second"))
        .await
        .unwrap()
        .into_comment()
        .unwrap();

    let after = ctx.discussion_comments(fx.discussion.key).await.unwrap();
    let keys: Vec<CommentKey> = after.iter().map(|c| c.key).collect();
    assert_eq!(keys, vec![CommentKey(1), created.key]);
    assert!(Arc::ptr_eq(&after[1], &created));
    // The append reused the cached list instead of reading again
    assert_eq!(fx.store.queries_on("comment", "discussion_key").len(), 1);
    uow.rollback().await.unwrap();
}

#[tokio::test]
async fn loaded_replies_include_the_new_reply() {
    let fx = fixture();
    let uow = Arc::new(UnitOfWork::begin(&fx.store).await.unwrap());
    let ctx = ResolutionContext::new(Arc::clone(&uow), LoaderConfig::default())
        .with_identity(Identity::Authenticated(fx.alice.key));

    assert!(ctx.replies(CommentKey(1)).await.unwrap().is_empty());

    let reply = MutationCoordinator::new(&ctx)
        .create_comment(CommentInput::new(POST, "a reply").replying_to(CommentKey(1)))
        .await
        .unwrap()
        .into_comment()
        .unwrap();

    let replies = ctx.replies(CommentKey(1)).await.unwrap();
    assert_eq!(replies.len(), 1);
    assert!(Arc::ptr_eq(&replies[0], &reply));
    // Lists not loaded before the write are left to the next read
    assert!(!ctx.loaders().replies.append(reply.key, Arc::clone(&reply)));
    uow.rollback().await.unwrap();
}

#[tokio::test]
async fn created_comment_replaces_a_cached_miss() {
    let fx = fixture();
    let uow = Arc::new(UnitOfWork::begin(&fx.store).await.unwrap());
    let ctx = ResolutionContext::new(Arc::clone(&uow), LoaderConfig::default())
        .with_identity(Identity::Authenticated(fx.alice.key));

    assert!(ctx.comment(CommentKey(2)).await.unwrap().is_none());

    let created = MutationCoordinator::new(&ctx)
        .create_comment(CommentInput::new(POST, "late"))
        .await
        .unwrap()
        .into_comment()
        .unwrap();
    assert_eq!(created.key, CommentKey(2));

    let loaded = ctx.comment(CommentKey(2)).await.unwrap().expect("visible to its writer");
    assert!(Arc::ptr_eq(&created, &loaded));
    assert_eq!(fx.store.queries_on("comment", "key").len(), 1);
    uow.rollback().await.unwrap();
}

#[test]
fn rejections_serialize_as_snake_case() {
    let json = serde_json::to_string(&Rejection::ReplyTargetNotFound).unwrap();
    assert_eq!(json, "\"reply_target_not_found\"");
    assert_eq!(
        Rejection::DiscussionNotFound.to_string(),
        "discussion does not exist"
    );
}
