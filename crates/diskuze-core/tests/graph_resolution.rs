//! Nested resolution through the graph nodes.

use std::sync::Arc;

use diskuze_core::{CommentThread, LoaderConfig, Query, ResolutionContext, UnitOfWork};
use diskuze_state::{CommentKey, MemoryStore, NewComment, Page};
use futures::future::try_join_all;

/// ```text
/// 1 (alice)
/// ├── 2 (bob)
/// │   └── 4 (alice)
/// └── 3 (carol)
/// 5 (bob)
/// ```
fn fixture() -> MemoryStore {
    let store = MemoryStore::new();
    let d = store.seed_discussion("https://example.com/thread").unwrap();
    let alice = store.seed_user("alice").unwrap();
    let bob = store.seed_user("bob").unwrap();
    let carol = store.seed_user("carol").unwrap();

    let c1 = store.seed_comment(NewComment::new("root", d.key, alice.key)).unwrap();
    let c2 = store
        .seed_comment(NewComment::new("first reply", d.key, bob.key).replying_to(c1.key))
        .unwrap();
    store
        .seed_comment(NewComment::new("second reply", d.key, carol.key).replying_to(c1.key))
        .unwrap();
    store
        .seed_comment(NewComment::new("nested", d.key, alice.key).replying_to(c2.key))
        .unwrap();
    store
        .seed_comment(NewComment::new("standalone", d.key, bob.key))
        .unwrap();
    store
}

async fn context(store: &MemoryStore) -> ResolutionContext {
    let uow = Arc::new(UnitOfWork::begin(store).await.unwrap());
    ResolutionContext::new(uow, LoaderConfig::default())
}

#[tokio::test]
async fn thread_costs_one_round_trip_per_level() {
    let store = fixture();
    let ctx = context(&store).await;

    let thread = Query::new(&ctx)
        .thread(CommentKey(1), 5)
        .await
        .unwrap()
        .expect("root exists");

    assert_eq!(thread.size(), 4);
    assert_eq!(thread.author, "alice");
    let replies: Vec<(&str, &str)> = thread
        .replies
        .iter()
        .map(|r| (r.content.as_str(), r.author.as_str()))
        .collect();
    assert_eq!(replies, vec![("first reply", "bob"), ("second reply", "carol")]);
    assert_eq!(thread.replies[0].replies[0].content, "nested");
    assert!(thread.replies[1].replies.is_empty());

    // Levels {1}, {2,3}, {4}; the last one finds no replies
    let reply_reads: Vec<Vec<i64>> = store
        .queries_on("comment", "reply_to_key")
        .into_iter()
        .map(|q| q.keys)
        .collect();
    assert_eq!(reply_reads, vec![vec![1], vec![2, 3], vec![4]]);

    let user_reads = store.queries_on("user", "key");
    assert_eq!(user_reads.len(), 1);
    assert_eq!(user_reads[0].keys, vec![1, 2, 3]);
}

#[tokio::test]
async fn thread_depth_limit_truncates_replies() {
    let store = fixture();
    let ctx = context(&store).await;

    let shallow = Query::new(&ctx)
        .thread(CommentKey(1), 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shallow.size(), 3);
    assert!(shallow.replies.iter().all(|r| r.replies.is_empty()));

    let root_only = Query::new(&ctx)
        .thread(CommentKey(1), 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root_only.size(), 1);
}

#[tokio::test]
async fn thread_of_missing_comment_is_none() {
    let store = fixture();
    let ctx = context(&store).await;

    assert!(Query::new(&ctx)
        .thread(CommentKey(99), 3)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn sibling_fields_share_one_batch() {
    let store = fixture();
    let ctx = context(&store).await;

    let comments = Query::new(&ctx).comments(Page::new(10, 0)).await.unwrap();
    assert_eq!(comments.len(), 5);

    let authors = try_join_all(comments.iter().map(|c| c.user(&ctx))).await.unwrap();
    let names: Vec<&str> = authors.iter().map(|u| u.name()).collect();
    assert_eq!(names, vec!["alice", "bob", "carol", "alice", "bob"]);

    let parents = try_join_all(comments.iter().map(|c| c.reply_to(&ctx))).await.unwrap();
    let parent_keys: Vec<Option<CommentKey>> =
        parents.iter().map(|p| p.as_ref().map(|c| c.key())).collect();
    assert_eq!(
        parent_keys,
        vec![None, Some(CommentKey(1)), Some(CommentKey(1)), Some(CommentKey(2)), None]
    );

    assert_eq!(store.queries_on("user", "key").len(), 1);
    // The listing primed every comment, so reply targets needed no read
    assert!(store.queries_on("comment", "key").is_empty());
    assert_eq!(ctx.loaders().round_trips(), 1);
}

#[tokio::test]
async fn listing_pages_apply_first_and_offset() {
    let store = fixture();
    let ctx = context(&store).await;

    let page = Query::new(&ctx).comments(Page::new(2, 3)).await.unwrap();
    let keys: Vec<CommentKey> = page.iter().map(|c| c.key()).collect();
    assert_eq!(keys, vec![CommentKey(4), CommentKey(5)]);

    let discussion = page[0].discussion(&ctx).await.unwrap();
    let second_page = discussion.comments(&ctx, Page::new(2, 2)).await.unwrap();
    let keys: Vec<CommentKey> = second_page.iter().map(|c| c.key()).collect();
    assert_eq!(keys, vec![CommentKey(3), CommentKey(4)]);
}

#[tokio::test]
async fn thread_serializes_without_empty_reply_target() {
    let store = fixture();
    let ctx = context(&store).await;

    let thread = CommentThread::resolve(
        &ctx,
        Query::new(&ctx).comment(CommentKey(5)).await.unwrap().unwrap(),
        2,
    )
    .await
    .unwrap();

    let json = serde_json::to_value(&thread).unwrap();
    assert_eq!(json["content"], "standalone");
    assert_eq!(json["author"], "bob");
    assert!(json.get("reply_to").is_none());
    assert_eq!(json["replies"], serde_json::json!([]));
}

#[test]
fn hello_field_answers() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let store = MemoryStore::new();
    let ctx = runtime.block_on(context(&store));
    assert_eq!(Query::new(&ctx).hello(), "Hello World!");
}
