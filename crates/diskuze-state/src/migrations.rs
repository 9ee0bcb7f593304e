//! SurrealDB schema initialization
//!
//! Defines the Diskuze tables with unique key indexes and the parent
//! indexes the relation loaders read through. Safe to call on every
//! connect (all definitions are `IF NOT EXISTS`).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Table holding discussions
pub const DISCUSSIONS: &str = "discussions";
/// Table holding users
pub const USERS: &str = "users";
/// Table holding comments
pub const COMMENTS: &str = "comments";

/// Initialize all Diskuze tables.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Diskuze SurrealDB schema");

    init_discussions_table(db).await?;
    init_users_table(db).await?;
    init_comments_table(db).await?;

    info!("Diskuze schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, sql: &str) -> StorageResult<()> {
    db.query(sql)
        .await
        .and_then(|response| response.check())
        .map_err(|e| StorageError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `discussions` table
///
/// Schema:
/// ```text
/// TABLE discussions {
///   key:        INT (unique)
///   canonical:  STRING (unique, <= 256)
/// }
/// ```
async fn init_discussions_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing discussions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS discussions SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_discussion_key ON TABLE discussions COLUMNS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_discussion_canonical ON TABLE discussions COLUMNS canonical UNIQUE;
    "#;

    run(db, sql).await
}

/// Initialize `users` table
///
/// Schema:
/// ```text
/// TABLE users {
///   key:   INT (unique)
///   name:  STRING (unique, <= 64)
/// }
/// ```
async fn init_users_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing users table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS users SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_user_key ON TABLE users COLUMNS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_user_name ON TABLE users COLUMNS name UNIQUE;
    "#;

    run(db, sql).await
}

/// Initialize `comments` table
///
/// Schema:
/// ```text
/// TABLE comments {
///   key:             INT (unique)
///   content:         STRING (<= 2048)
///   discussion_key:  INT (references discussions.key, indexed)
///   user_key:        INT (references users.key)
///   reply_to_key:    INT? (references comments.key, indexed)
///   created_at:      DATETIME
/// }
/// ```
///
/// References are checked inside the commit transaction, see `handle.rs`.
async fn init_comments_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing comments table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS comments SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_comment_key ON TABLE comments COLUMNS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_comment_discussion ON TABLE comments COLUMNS discussion_key;
        DEFINE INDEX IF NOT EXISTS idx_comment_reply_to ON TABLE comments COLUMNS reply_to_key;
    "#;

    run(db, sql).await
}
