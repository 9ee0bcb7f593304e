//! Diskuze - comment/discussion service CLI
//!
//! The `diskuze` command runs requests against a Diskuze store, one
//! resolution context per command.
//!
//! ## Commands
//!
//! - `seed`: Load sample discussions, users and comments
//! - `comments`: List comments (first/offset paging)
//! - `discussion`: Show a discussion and a page of its comments
//! - `thread`: Show a comment with its replies down to a depth
//! - `create-comment`: Create a comment as a user

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use diskuze_core::telemetry::{init_tracing, level_for};
use diskuze_core::{
    CommentInput, CreateCommentOutcome, LoaderConfig, Mutation, Query, Service,
    DEFAULT_MAX_BATCH_SIZE,
};
use diskuze_state::{
    CommentKey, NewComment, NewDiscussion, NewUser, Page, Storage, StoreConfig, SurrealStore,
};

#[derive(Parser)]
#[command(name = "diskuze")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Diskuze comment service", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Store endpoint (mem://, surrealkv://<path>, ws://host:port)
    #[arg(long, global = true, env = "DISKUZE_DB_URL")]
    db_url: Option<String>,

    /// Largest key set sent in one batched read
    #[arg(long, global = true, env = "DISKUZE_MAX_BATCH_SIZE", default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    max_batch_size: usize,

    /// Load the sample data before running the command
    #[arg(long, global = true)]
    seed: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load sample discussions, users and comments
    Seed,

    /// List comments in key order
    Comments {
        #[arg(long, default_value = "10")]
        first: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show a discussion and a page of its comments
    Discussion {
        /// Canonical name of the discussion
        canonical: String,

        #[arg(long, default_value = "10")]
        first: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show a comment with its replies
    Thread {
        /// Root comment key
        comment: i64,

        /// Reply levels to resolve below the root
        #[arg(short, long, default_value = "3")]
        depth: usize,
    },

    /// Create a comment
    CreateComment {
        /// Name of the commenting user
        #[arg(short, long)]
        user: Option<String>,

        /// Canonical name of the discussion
        #[arg(short, long)]
        discussion: String,

        /// Comment text
        #[arg(short, long)]
        content: String,

        /// Key of the comment being replied to
        #[arg(short, long)]
        reply_to: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    init_tracing(cli.json, level_for(cli.verbose));

    let mut config = StoreConfig::from_env();
    if let Some(url) = cli.db_url {
        config.endpoint = url;
    }
    let store = SurrealStore::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to Diskuze store at {}", config.endpoint))?;

    if cli.seed || matches!(cli.command, Commands::Seed) {
        let summary = cmd_seed(&store).await?;
        if matches!(cli.command, Commands::Seed) {
            return print_json(&summary);
        }
    }

    let service = Service::new(Arc::new(store))
        .with_loader_config(LoaderConfig::default().with_max_batch_size(cli.max_batch_size));

    match cli.command {
        Commands::Seed => Ok(()),
        Commands::Comments { first, offset } => cmd_comments(&service, Page::new(first, offset)).await,
        Commands::Discussion {
            canonical,
            first,
            offset,
        } => cmd_discussion(&service, &canonical, Page::new(first, offset)).await,
        Commands::Thread { comment, depth } => cmd_thread(&service, CommentKey(comment), depth).await,
        Commands::CreateComment {
            user,
            discussion,
            content,
            reply_to,
        } => {
            let mut input = CommentInput::new(discussion, content);
            if let Some(key) = reply_to {
                input = input.replying_to(CommentKey(key));
            }
            cmd_create_comment(&service, user.as_deref(), input).await
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct SeedSummary {
    discussions: usize,
    users: usize,
    comments: usize,
    skipped: bool,
}

/// Insert the sample data in one transaction, unless it is already there
async fn cmd_seed(store: &SurrealStore) -> Result<SeedSummary> {
    const WELCOME: &str = "https://diskuze.dev/welcome";
    const BATCHING: &str = "https://diskuze.dev/batching";

    let mut tx = store.begin().await?;
    if tx.discussion_by_canonical(WELCOME).await?.is_some() {
        tx.rollback().await?;
        return Ok(SeedSummary {
            skipped: true,
            ..SeedSummary::default()
        });
    }

    let welcome = tx.insert_discussion(NewDiscussion::new(WELCOME)).await?;
    let batching = tx.insert_discussion(NewDiscussion::new(BATCHING)).await?;
    let alice = tx.insert_user(NewUser::new("alice")).await?;
    let bob = tx.insert_user(NewUser::new("bob")).await?;
    let carol = tx.insert_user(NewUser::new("carol")).await?;

    let hello = tx
        .insert_comment(NewComment::new("Welcome to the discussion!", welcome.key, alice.key))
        .await?;
    let reply = tx
        .insert_comment(
            NewComment::new("Glad to be here.", welcome.key, bob.key).replying_to(hello.key),
        )
        .await?;
    tx.insert_comment(
        NewComment::new("Same here, thanks for the invite.", welcome.key, carol.key)
            .replying_to(reply.key),
    )
    .await?;
    tx.insert_comment(NewComment::new(
        "How many round trips does a thread cost?",
        batching.key,
        carol.key,
    ))
    .await?;

    tx.commit().await.context("Failed to commit sample data")?;
    info!("Sample data loaded");

    Ok(SeedSummary {
        discussions: 2,
        users: 3,
        comments: 4,
        skipped: false,
    })
}

/// List comments through the raw Unit-of-Work
async fn cmd_comments(service: &Service, page: Page) -> Result<()> {
    let comments = service
        .execute(None, |ctx| async move { Query::new(&ctx).comments(page).await })
        .await
        .context("Failed to list comments")?;
    print_json(&comments)
}

/// Show a discussion with one page of its comments
async fn cmd_discussion(service: &Service, canonical: &str, page: Page) -> Result<()> {
    let name = canonical.to_string();
    let view = service
        .execute(None, |ctx| async move {
            let Some(discussion) = Query::new(&ctx).discussion(&name).await? else {
                return Ok(None);
            };
            let comments = discussion.comments(&ctx, page).await?;
            Ok(Some(json!({
                "discussion": discussion,
                "comments": comments,
            })))
        })
        .await
        .context("Failed to load discussion")?;

    match view {
        Some(view) => print_json(&view),
        None => anyhow::bail!("Discussion '{}' not found", canonical),
    }
}

/// Show a comment thread
async fn cmd_thread(service: &Service, key: CommentKey, depth: usize) -> Result<()> {
    let thread = service
        .execute(None, |ctx| async move { Query::new(&ctx).thread(key, depth).await })
        .await
        .context("Failed to load thread")?;

    match thread {
        Some(thread) => print_json(&thread),
        None => anyhow::bail!("Comment {} not found", key),
    }
}

/// Create a comment as `user`
async fn cmd_create_comment(
    service: &Service,
    user: Option<&str>,
    input: CommentInput,
) -> Result<()> {
    let outcome = service
        .execute(user, |ctx| async move {
            Mutation::new(&ctx).create_comment(input).await
        })
        .await
        .context("Failed to create comment")?;

    match outcome {
        CreateCommentOutcome::Created(comment) => print_json(&json!({ "created": comment.as_ref() })),
        CreateCommentOutcome::Rejected(rejection) => print_json(&json!({
            "rejected": rejection,
            "reason": rejection.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_defaults_to_depth_three() {
        let cli = Cli::try_parse_from(["diskuze", "thread", "7"]).unwrap();
        match cli.command {
            Commands::Thread { comment, depth } => {
                assert_eq!(comment, 7);
                assert_eq!(depth, 3);
            }
            _ => panic!("expected thread"),
        }
        assert!(!cli.seed);
    }

    #[test]
    fn test_create_comment_with_reply_and_global_flags() {
        let cli = Cli::try_parse_from([
            "diskuze",
            "create-comment",
            "--user",
            "alice",
            "--discussion",
            "https://diskuze.dev/welcome",
            "--content",
            "hi",
            "--reply-to",
            "1",
            "--max-batch-size",
            "50",
            "--seed",
        ])
        .unwrap();
        assert_eq!(cli.max_batch_size, 50);
        assert!(cli.seed);
        match cli.command {
            Commands::CreateComment {
                user,
                discussion,
                content,
                reply_to,
            } => {
                assert_eq!(user.as_deref(), Some("alice"));
                assert_eq!(discussion, "https://diskuze.dev/welcome");
                assert_eq!(content, "hi");
                assert_eq!(reply_to, Some(1));
            }
            _ => panic!("expected create-comment"),
        }
    }

    #[test]
    fn test_create_comment_requires_content() {
        let parsed = Cli::try_parse_from([
            "diskuze",
            "create-comment",
            "--discussion",
            "https://diskuze.dev/welcome",
        ]);
        assert!(parsed.is_err());
    }
}
