use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::model::{CreateOutcome, NewResource, Resource, Tag, User};

/// Owner-scoped access to users, tags and resources. Every read excludes soft-deleted rows.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn migrate(&self) -> Result<()>;

    /// Creates a user and returns it with its freshly minted bearer token.
    async fn create_user(&self, username: &str) -> Result<(User, String)>;

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>>;

    /// All live tags of `owner_id`, ordered by name.
    async fn list_tags(&self, owner_id: i64) -> Result<Vec<Tag>>;

    /// One page (1-based) of resources carrying `tag_name`, newest first, with the total count.
    async fn list_resources_by_tag(
        &self,
        owner_id: i64,
        tag_name: &str,
        page: u32,
        size: u32,
    ) -> Result<(Vec<Resource>, i64)>;

    async fn get_resource(&self, owner_id: i64, resource_id: i64) -> Result<Option<Resource>>;

    async fn tags_for_resource(&self, owner_id: i64, resource_id: i64) -> Result<Vec<String>>;

    async fn create_resource(&self, owner_id: i64, resource: NewResource) -> Result<CreateOutcome>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        token_hash TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        is_deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL,
        title TEXT NOT NULL,
        digest TEXT NOT NULL DEFAULT '',
        user_id INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        is_deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_resources_user_id ON resources (user_id)",
    "CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        is_deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS unique_user_tag ON tags (user_id, name) WHERE is_deleted = 0",
    "CREATE TABLE IF NOT EXISTS resource_tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        is_deleted INTEGER NOT NULL DEFAULT 0,
        UNIQUE (resource_id, tag_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_resource_tags_user_tag ON resource_tags (user_id, tag_id)",
];

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.trim().as_bytes()))
}

pub struct SqliteBookmarkStore {
    pool: Pool<Sqlite>,
}

impl SqliteBookmarkStore {
    pub async fn open(db_url: &str) -> Result<Self> {
        ensure_parent_dir_for_sqlite_url(db_url)?;
        let in_memory = db_url.contains(":memory:");

        let opts = SqliteConnectOptions::from_str(db_url)
            .context("invalid sqlite database url")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives and dies with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(opts)
            .await
            .context("failed to open sqlite database")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl BookmarkStore for SqliteBookmarkStore {
    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to run database migration")?;
        }
        Ok(())
    }

    async fn create_user(&self, username: &str) -> Result<(User, String)> {
        let username = username.trim();
        if username.is_empty() {
            return Err(anyhow::anyhow!("username cannot be empty"));
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let id = sqlx::query("INSERT INTO users (username, token_hash) VALUES (?, ?)")
            .bind(username)
            .bind(hash_token(&token))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create user '{username}' in database"))?
            .last_insert_rowid();

        Ok((
            User {
                id,
                username: username.to_string(),
            },
            token,
        ))
    }

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, username FROM users WHERE token_hash = ? AND is_deleted = 0",
        )
        .bind(hash_token(token))
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up user by token in database")
    }

    async fn list_tags(&self, owner_id: i64) -> Result<Vec<Tag>> {
        sqlx::query_as::<_, Tag>(
            "SELECT id, name, user_id FROM tags WHERE user_id = ? AND is_deleted = 0 ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list tags for user {owner_id} from database"))
    }

    async fn list_resources_by_tag(
        &self,
        owner_id: i64,
        tag_name: &str,
        page: u32,
        size: u32,
    ) -> Result<(Vec<Resource>, i64)> {
        let tag_id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM tags WHERE user_id = ? AND name = ? AND is_deleted = 0",
        )
        .bind(owner_id)
        .bind(tag_name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to look up tag '{tag_name}' in database"))?;

        let Some(tag_id) = tag_id else {
            return Ok((Vec::new(), 0));
        };

        let size = size.max(1);
        let offset = i64::from(page.max(1) - 1) * i64::from(size);

        let resources = sqlx::query_as::<_, Resource>(
            "SELECT r.id, r.url, r.title, r.digest, r.user_id, r.created_at
             FROM resources r
             JOIN resource_tags rt ON rt.resource_id = r.id
             WHERE rt.tag_id = ? AND rt.user_id = ? AND rt.is_deleted = 0
               AND r.user_id = ? AND r.is_deleted = 0
             ORDER BY r.created_at DESC, r.id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(tag_id)
        .bind(owner_id)
        .bind(owner_id)
        .bind(i64::from(size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list resources under tag '{tag_name}' from database"))?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)
             FROM resources r
             JOIN resource_tags rt ON rt.resource_id = r.id
             WHERE rt.tag_id = ? AND rt.user_id = ? AND rt.is_deleted = 0
               AND r.user_id = ? AND r.is_deleted = 0",
        )
        .bind(tag_id)
        .bind(owner_id)
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to count resources under tag '{tag_name}' in database"))?;

        Ok((resources, total))
    }

    async fn get_resource(&self, owner_id: i64, resource_id: i64) -> Result<Option<Resource>> {
        sqlx::query_as::<_, Resource>(
            "SELECT id, url, title, digest, user_id, created_at
             FROM resources WHERE id = ? AND user_id = ? AND is_deleted = 0",
        )
        .bind(resource_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load resource {resource_id} from database"))
    }

    async fn tags_for_resource(&self, owner_id: i64, resource_id: i64) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT t.name
             FROM tags t
             JOIN resource_tags rt ON rt.tag_id = t.id
             WHERE rt.resource_id = ? AND rt.user_id = ? AND rt.is_deleted = 0 AND t.is_deleted = 0
             ORDER BY t.name",
        )
        .bind(resource_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load tags of resource {resource_id} from database"))
    }

    async fn create_resource(&self, owner_id: i64, resource: NewResource) -> Result<CreateOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin database transaction")?;

        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM resources WHERE user_id = ? AND url = ? AND is_deleted = 0",
        )
        .bind(owner_id)
        .bind(&resource.url)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to check for an existing bookmark in database")?;
        if existing.is_some() {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let resource_id =
            sqlx::query("INSERT INTO resources (url, title, digest, user_id) VALUES (?, ?, ?, ?)")
                .bind(&resource.url)
                .bind(&resource.title)
                .bind(&resource.digest)
                .bind(owner_id)
                .execute(&mut *tx)
                .await
                .context("failed to insert resource into database")?
                .last_insert_rowid();

        let mut seen = std::collections::BTreeSet::new();
        for name in resource.tags.iter().map(|name| name.trim()) {
            if name.is_empty() || !seen.insert(name.to_string()) {
                continue;
            }

            let tag_id = match sqlx::query_scalar::<_, i64>(
                "SELECT id FROM tags WHERE user_id = ? AND name = ? AND is_deleted = 0",
            )
            .bind(owner_id)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("failed to look up tag '{name}' in database"))?
            {
                Some(id) => id,
                None => sqlx::query("INSERT INTO tags (name, user_id) VALUES (?, ?)")
                    .bind(name)
                    .bind(owner_id)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("failed to create tag '{name}' in database"))?
                    .last_insert_rowid(),
            };

            sqlx::query(
                "INSERT INTO resource_tags (resource_id, tag_id, user_id) VALUES (?, ?, ?)
                 ON CONFLICT (resource_id, tag_id) DO UPDATE SET is_deleted = 0",
            )
            .bind(resource_id)
            .bind(tag_id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .context("failed to link resource to tag in database")?;
        }

        let created = sqlx::query_as::<_, Resource>(
            "SELECT id, url, title, digest, user_id, created_at FROM resources WHERE id = ?",
        )
        .bind(resource_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to reload created resource from database")?;

        tx.commit()
            .await
            .context("failed to commit database transaction")?;

        tracing::info!(
            resource_id,
            owner_id,
            tags = seen.len(),
            "resource created"
        );
        Ok(CreateOutcome::Created(created))
    }
}

pub fn ensure_parent_dir_for_sqlite_url(db_url: &str) -> Result<()> {
    let Some(db_path) = sqlite_path_from_url(db_url) else {
        return Ok(());
    };

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create directory for sqlite database: {}",
                parent.display()
            )
        })?;
    }

    Ok(())
}

pub fn sqlite_path_from_url(db_url: &str) -> Option<PathBuf> {
    let path_with_params = db_url
        .strip_prefix("sqlite://")
        .or_else(|| db_url.strip_prefix("sqlite:"))?;
    let path_without_params = path_with_params
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(path_with_params);

    if path_without_params.is_empty() || path_without_params == ":memory:" {
        return None;
    }

    Some(Path::new(path_without_params).to_path_buf())
}
