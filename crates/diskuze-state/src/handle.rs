//! SurrealDB store - connection and transactions
//!
//! A `SurrealTransaction` buffers its writes and overlays them on every
//! read, so a request observes its own inserts before they are durable.
//! `commit` sends the whole write set as a single
//! `BEGIN TRANSACTION ... COMMIT TRANSACTION` query that re-checks every
//! reference and lets the unique key indexes reject conflicting writers.
//!
//! Supports in-memory (`mem://`), embedded (`surrealkv://`) and remote
//! (`ws://`, `wss://`) engines.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::migrations::{self, COMMENTS, DISCUSSIONS, USERS};
use crate::schema::*;
use crate::storage_traits::{Storage, StorageResult, Transaction};

/// Serialize chrono DateTime as a SurrealDB datetime
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbComment {
    key: i64,
    content: String,
    discussion_key: i64,
    user_key: i64,
    #[serde(default)]
    reply_to_key: Option<i64>,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
}

impl From<&CommentRecord> for DbComment {
    fn from(record: &CommentRecord) -> Self {
        DbComment {
            key: record.key.0,
            content: record.content.clone(),
            discussion_key: record.discussion_key.0,
            user_key: record.user_key.0,
            reply_to_key: record.reply_to_key.map(|k| k.0),
            created_at: record.created_at,
        }
    }
}

impl DbComment {
    fn into_record(self) -> CommentRecord {
        CommentRecord {
            key: CommentKey(self.key),
            content: self.content,
            discussion_key: DiscussionKey(self.discussion_key),
            user_key: UserKey(self.user_key),
            reply_to_key: self.reply_to_key.map(CommentKey),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    key: i64,
}

/// SurrealDB-backed `Storage`
#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Connect to an in-memory engine and set up the schema
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect(&StoreConfig::default()).await
    }

    /// Connect, sign in when credentials are configured, select the
    /// namespace/database and initialize the schema.
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn connect(config: &StoreConfig) -> StorageResult<Self> {
        info!("Connecting to SurrealDB");

        let db = surrealdb::engine::any::connect(config.endpoint.as_str())
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if let Some((username, password)) = config.credentials() {
            if config.is_root {
                db.signin(Root { username, password })
                    .await
                    .map_err(|e| {
                        StorageError::Connection(format!("Root authentication failed: {e}"))
                    })?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username,
                    password,
                })
                .await
                .map_err(|e| {
                    StorageError::Connection(format!("Database authentication failed: {e}"))
                })?;
            }
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to select namespace/database: {e}"))
            })?;

        migrations::init_schema(&db).await?;

        info!("SurrealDB connected and schema initialized");
        Ok(Self { db })
    }
}

#[async_trait]
impl Storage for SurrealStore {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(SurrealTransaction {
            db: self.db.clone(),
            staged: Staged::default(),
            closed: false,
        }))
    }
}

#[derive(Debug, Default)]
struct Staged {
    discussions: BTreeMap<DiscussionKey, DiscussionRecord>,
    users: BTreeMap<UserKey, UserRecord>,
    comments: BTreeMap<CommentKey, CommentRecord>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.discussions.is_empty() && self.users.is_empty() && self.comments.is_empty()
    }
}

/// A buffered SurrealDB transaction
pub struct SurrealTransaction {
    db: Surreal<Any>,
    staged: Staged,
    closed: bool,
}

/// Overlay staged rows on committed rows, keyed and ordered by key.
fn overlay<K, V>(
    committed: impl IntoIterator<Item = V>,
    staged: &BTreeMap<K, V>,
    key_of: impl Fn(&V) -> K,
    keep: impl Fn(&V) -> bool,
) -> Vec<V>
where
    K: Ord + Copy,
    V: Clone,
{
    let mut rows: BTreeMap<K, V> = committed.into_iter().map(|v| (key_of(&v), v)).collect();
    rows.extend(
        staged
            .iter()
            .filter(|(_, v)| keep(v))
            .map(|(k, v)| (*k, v.clone())),
    );
    rows.into_values().collect()
}

/// Pick the most specific storage error out of a failed multi-statement response.
fn classify(errors: HashMap<usize, surrealdb::Error>) -> StorageError {
    let mut errors: Vec<(usize, StorageError)> = errors
        .into_iter()
        .map(|(index, err)| (index, StorageError::from(err)))
        .collect();
    errors.sort_by_key(|(index, _)| *index);

    errors
        .iter()
        .find(|(_, e)| matches!(e, StorageError::Constraint { .. }))
        .or_else(|| {
            errors
                .iter()
                .find(|(_, e)| matches!(e, StorageError::Conflict(_)))
        })
        .or_else(|| errors.first())
        .map(|(_, e)| e.clone())
        .unwrap_or_else(|| StorageError::Query("transaction failed".to_string()))
}

impl SurrealTransaction {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::TransactionClosed);
        }
        Ok(())
    }

    async fn select_in<T: DeserializeOwned>(
        &self,
        sql: String,
        keys: Vec<i64>,
    ) -> StorageResult<Vec<T>> {
        let mut result = self.db.query(sql).bind(("keys", keys)).await?;
        let rows: Vec<T> = result.take(0)?;
        Ok(rows)
    }

    async fn select_eq<T: DeserializeOwned>(
        &self,
        sql: String,
        value: String,
    ) -> StorageResult<Vec<T>> {
        let mut result = self.db.query(sql).bind(("value", value)).await?;
        let rows: Vec<T> = result.take(0)?;
        Ok(rows)
    }

    /// Next free key: one past the largest committed or staged key.
    async fn next_key(&self, table: &str, staged_max: Option<i64>) -> StorageResult<i64> {
        let mut result = self
            .db
            .query(format!("SELECT key FROM {table} ORDER BY key DESC LIMIT 1"))
            .await?;
        let rows: Vec<KeyRow> = result.take(0)?;
        let committed_max = rows.first().map(|row| row.key);
        Ok(committed_max.max(staged_max).unwrap_or(0) + 1)
    }

    async fn committed_has_key(&self, table: &str, key: i64) -> StorageResult<bool> {
        let rows: Vec<KeyRow> = self
            .select_in(
                format!("SELECT key FROM {table} WHERE key IN $keys"),
                vec![key],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn comments_where(
        &self,
        column: &str,
        keys: Vec<i64>,
        keep: impl Fn(&CommentRecord) -> bool,
    ) -> StorageResult<Vec<CommentRecord>> {
        let rows: Vec<DbComment> = self
            .select_in(
                format!("SELECT * FROM {COMMENTS} WHERE {column} IN $keys ORDER BY key"),
                keys,
            )
            .await?;
        Ok(overlay(
            rows.into_iter().map(DbComment::into_record),
            &self.staged.comments,
            |c| c.key,
            keep,
        ))
    }

    /// Build the single commit query for the staged write set.
    fn commit_statements(&self) -> String {
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        for (i, _) in self.staged.discussions.values().enumerate() {
            sql.push_str(&format!("CREATE {DISCUSSIONS} CONTENT $d{i};\n"));
        }
        for (i, _) in self.staged.users.values().enumerate() {
            sql.push_str(&format!("CREATE {USERS} CONTENT $u{i};\n"));
        }
        for (i, comment) in self.staged.comments.values().enumerate() {
            sql.push_str(&format!(
                "IF array::len((SELECT key FROM {DISCUSSIONS} WHERE key = {d})) = 0 \
                 {{ THROW \"referential integrity: discussion {d} does not exist\" }};\n",
                d = comment.discussion_key.0
            ));
            sql.push_str(&format!(
                "IF array::len((SELECT key FROM {USERS} WHERE key = {u})) = 0 \
                 {{ THROW \"referential integrity: user {u} does not exist\" }};\n",
                u = comment.user_key.0
            ));
            if let Some(parent) = comment.reply_to_key {
                sql.push_str(&format!(
                    "IF array::len((SELECT key FROM {COMMENTS} WHERE key = {p})) = 0 \
                     {{ THROW \"referential integrity: reply target {p} does not exist\" }};\n",
                    p = parent.0
                ));
            }
            sql.push_str(&format!("CREATE {COMMENTS} CONTENT $c{i};\n"));
        }
        sql.push_str("COMMIT TRANSACTION;");
        sql
    }
}

#[async_trait]
impl Transaction for SurrealTransaction {
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn discussions_by_keys(
        &mut self,
        keys: &[DiscussionKey],
    ) -> StorageResult<Vec<DiscussionRecord>> {
        self.ensure_open()?;
        let rows: Vec<DiscussionRecord> = self
            .select_in(
                format!("SELECT * FROM {DISCUSSIONS} WHERE key IN $keys ORDER BY key"),
                keys.iter().map(|k| k.0).collect(),
            )
            .await?;
        Ok(overlay(rows, &self.staged.discussions, |d| d.key, |d| {
            keys.contains(&d.key)
        }))
    }

    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn users_by_keys(&mut self, keys: &[UserKey]) -> StorageResult<Vec<UserRecord>> {
        self.ensure_open()?;
        let rows: Vec<UserRecord> = self
            .select_in(
                format!("SELECT * FROM {USERS} WHERE key IN $keys ORDER BY key"),
                keys.iter().map(|k| k.0).collect(),
            )
            .await?;
        Ok(overlay(rows, &self.staged.users, |u| u.key, |u| {
            keys.contains(&u.key)
        }))
    }

    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn comments_by_keys(
        &mut self,
        keys: &[CommentKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        self.comments_where("key", keys.iter().map(|k| k.0).collect(), |c| {
            keys.contains(&c.key)
        })
        .await
    }

    #[instrument(skip(self, parents), fields(parents = parents.len()))]
    async fn comments_by_reply_to(
        &mut self,
        parents: &[CommentKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        self.comments_where(
            "reply_to_key",
            parents.iter().map(|k| k.0).collect(),
            |c| c.reply_to_key.is_some_and(|p| parents.contains(&p)),
        )
        .await
    }

    #[instrument(skip(self, parents), fields(parents = parents.len()))]
    async fn comments_by_discussion(
        &mut self,
        parents: &[DiscussionKey],
    ) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        self.comments_where(
            "discussion_key",
            parents.iter().map(|k| k.0).collect(),
            |c| parents.contains(&c.discussion_key),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn discussion_by_canonical(
        &mut self,
        canonical: &str,
    ) -> StorageResult<Option<DiscussionRecord>> {
        self.ensure_open()?;
        if let Some(staged) = self
            .staged
            .discussions
            .values()
            .find(|d| d.canonical == canonical)
        {
            return Ok(Some(staged.clone()));
        }
        let rows: Vec<DiscussionRecord> = self
            .select_eq(
                format!("SELECT * FROM {DISCUSSIONS} WHERE canonical = $value"),
                canonical.to_string(),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn user_by_name(&mut self, name: &str) -> StorageResult<Option<UserRecord>> {
        self.ensure_open()?;
        if let Some(staged) = self.staged.users.values().find(|u| u.name == name) {
            return Ok(Some(staged.clone()));
        }
        let rows: Vec<UserRecord> = self
            .select_eq(
                format!("SELECT * FROM {USERS} WHERE name = $value"),
                name.to_string(),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn comment_exists(&mut self, key: CommentKey) -> StorageResult<bool> {
        self.ensure_open()?;
        if self.staged.comments.contains_key(&key) {
            return Ok(true);
        }
        self.committed_has_key(COMMENTS, key.0).await
    }

    #[instrument(skip(self))]
    async fn list_comments(&mut self, page: Page) -> StorageResult<Vec<CommentRecord>> {
        self.ensure_open()?;
        // Staged rows can land anywhere in the window, so read up to its end
        let end = page.offset.saturating_add(page.first);
        let mut result = self
            .db
            .query(format!("SELECT * FROM {COMMENTS} ORDER BY key LIMIT $end"))
            .bind(("end", i64::try_from(end).unwrap_or(i64::MAX)))
            .await?;
        let rows: Vec<DbComment> = result.take(0)?;
        let merged = overlay(
            rows.into_iter().map(DbComment::into_record),
            &self.staged.comments,
            |c| c.key,
            |_| true,
        );
        Ok(page.slice(&merged).to_vec())
    }

    #[instrument(skip(self, new), fields(canonical = %new.canonical))]
    async fn insert_discussion(&mut self, new: NewDiscussion) -> StorageResult<DiscussionRecord> {
        self.ensure_open()?;
        if new.canonical.is_empty() || new.canonical.len() > MAX_CANONICAL_LEN {
            return Err(StorageError::constraint(
                DISCUSSIONS,
                format!("canonical name must be 1..={MAX_CANONICAL_LEN} bytes"),
            ));
        }
        if self.discussion_by_canonical(&new.canonical).await?.is_some() {
            return Err(StorageError::constraint(
                DISCUSSIONS,
                format!("canonical '{}' already exists", new.canonical),
            ));
        }
        let staged_max = self.staged.discussions.keys().next_back().map(|k| k.0);
        let key = DiscussionKey(self.next_key(DISCUSSIONS, staged_max).await?);
        let record = DiscussionRecord {
            key,
            canonical: new.canonical,
        };
        self.staged.discussions.insert(key, record.clone());
        debug!(key = %key, "discussion staged");
        Ok(record)
    }

    #[instrument(skip(self, new), fields(name = %new.name))]
    async fn insert_user(&mut self, new: NewUser) -> StorageResult<UserRecord> {
        self.ensure_open()?;
        if new.name.is_empty() || new.name.len() > MAX_NAME_LEN {
            return Err(StorageError::constraint(
                USERS,
                format!("name must be 1..={MAX_NAME_LEN} bytes"),
            ));
        }
        if self.user_by_name(&new.name).await?.is_some() {
            return Err(StorageError::constraint(
                USERS,
                format!("name '{}' already exists", new.name),
            ));
        }
        let staged_max = self.staged.users.keys().next_back().map(|k| k.0);
        let key = UserKey(self.next_key(USERS, staged_max).await?);
        let record = UserRecord {
            key,
            name: new.name,
        };
        self.staged.users.insert(key, record.clone());
        debug!(key = %key, "user staged");
        Ok(record)
    }

    #[instrument(skip(self, new), fields(discussion = %new.discussion_key, user = %new.user_key))]
    async fn insert_comment(&mut self, new: NewComment) -> StorageResult<CommentRecord> {
        self.ensure_open()?;
        if new.content.len() > MAX_CONTENT_LEN {
            return Err(StorageError::constraint(
                COMMENTS,
                format!("content exceeds {MAX_CONTENT_LEN} bytes"),
            ));
        }
        let has_discussion = self.staged.discussions.contains_key(&new.discussion_key)
            || self
                .committed_has_key(DISCUSSIONS, new.discussion_key.0)
                .await?;
        if !has_discussion {
            return Err(StorageError::constraint(
                COMMENTS,
                format!("discussion {} does not exist", new.discussion_key),
            ));
        }
        let has_user = self.staged.users.contains_key(&new.user_key)
            || self.committed_has_key(USERS, new.user_key.0).await?;
        if !has_user {
            return Err(StorageError::constraint(
                COMMENTS,
                format!("user {} does not exist", new.user_key),
            ));
        }
        if let Some(parent) = new.reply_to_key {
            if !self.comment_exists(parent).await? {
                return Err(StorageError::constraint(
                    COMMENTS,
                    format!("reply target {parent} does not exist"),
                ));
            }
        }
        let staged_max = self.staged.comments.keys().next_back().map(|k| k.0);
        let key = CommentKey(self.next_key(COMMENTS, staged_max).await?);
        let record = new.into_record(key);
        self.staged.comments.insert(key, record.clone());
        debug!(key = %key, "comment staged");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn commit(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        if self.staged.is_empty() {
            self.closed = true;
            return Ok(());
        }

        let sql = self.commit_statements();
        let mut query = self.db.query(sql);
        for (i, discussion) in self.staged.discussions.values().enumerate() {
            query = query.bind((format!("d{i}"), discussion.clone()));
        }
        for (i, user) in self.staged.users.values().enumerate() {
            query = query.bind((format!("u{i}"), user.clone()));
        }
        for (i, comment) in self.staged.comments.values().enumerate() {
            query = query.bind((format!("c{i}"), DbComment::from(comment)));
        }

        let mut response = query.await?;
        let errors = response.take_errors();
        if !errors.is_empty() {
            return Err(classify(errors));
        }

        info!(
            discussions = self.staged.discussions.len(),
            users = self.staged.users.len(),
            comments = self.staged.comments.len(),
            "transaction committed"
        );
        self.staged = Staged::default();
        self.closed = true;
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.staged = Staged::default();
        self.closed = true;
        Ok(())
    }
}
