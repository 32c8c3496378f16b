use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use super::error::{RepositoryError, RepositoryResult};
use super::message_store::{
    BoxFuture, ConversationMetaPatch, ConversationRecord, ConversationSummary, MessageRecord,
    MessageStore,
};
use crate::models::Role;

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and its SQL.
/// Never edit or remove existing entries; existing databases depend on them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS conversations (
        id         TEXT    PRIMARY KEY,
        title      TEXT    NOT NULL,
        pinned     INTEGER NOT NULL DEFAULT 0,
        folder     TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS messages (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT    NOT NULL UNIQUE,
        conversation_id TEXT    NOT NULL,
        role            TEXT    NOT NULL,
        content         TEXT    NOT NULL,
        created_at      INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
        ON conversations (updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, seq)",
)];

/// SQLite-backed message store.
///
/// Uses WAL journal mode for concurrent reads during background saves.
/// `SqlitePool` is internally reference-counted and cheap to clone.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (or create) the database at the platform-specific config path.
    pub async fn open_default() -> RepositoryResult<Self> {
        Self::open(&Self::default_path()?).await
    }

    pub async fn open(db_path: &Path) -> RepositoryResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite message store");

        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every new connection would see an empty database.
    pub async fn in_memory() -> RepositoryResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn default_path() -> RepositoryResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("localchat").join("conversations.db"))
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Seed version 0 if the table is empty (fresh database).
        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query call,
                // so split on ';' and execute each statement individually.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }
}

fn conversation_from_row(row: &SqliteRow) -> ConversationRecord {
    ConversationRecord {
        id: row.get("id"),
        title: row.get("title"),
        pinned: row.get("pinned"),
        folder: row.get("folder"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn message_from_row(row: &SqliteRow) -> RepositoryResult<MessageRecord> {
    let role: String = row.get("role");
    let role = role
        .parse::<Role>()
        .map_err(|message| RepositoryError::InvalidData { message })?;

    Ok(MessageRecord {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role,
        content: row.get("content"),
        created_at: row.get("created_at"),
    })
}

impl MessageStore for SqliteMessageStore {
    fn get_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<ConversationRecord>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, title, pinned, folder, created_at, updated_at
                 FROM conversations
                 WHERE id = ?",
            )
            .bind(&id)
            .fetch_optional(&pool)
            .await?;

            Ok(row.as_ref().map(conversation_from_row))
        })
    }

    fn list_conversations(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationRecord>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, title, pinned, folder, created_at, updated_at
                 FROM conversations
                 ORDER BY updated_at DESC",
            )
            .fetch_all(&pool)
            .await?;

            Ok(rows.iter().map(conversation_from_row).collect())
        })
    }

    fn create_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, title, pinned, folder, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&record.id)
            .bind(&record.title)
            .bind(record.pinned)
            .bind(&record.folder)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    fn update_conversation_meta(
        &self,
        id: &str,
        patch: ConversationMetaPatch,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query(
                "UPDATE conversations SET
                    title      = COALESCE(?1, title),
                    pinned     = COALESCE(?2, pinned),
                    folder     = COALESCE(?3, folder),
                    updated_at = ?4
                 WHERE id = ?5",
            )
            .bind(&patch.title)
            .bind(patch.pinned)
            .bind(&patch.folder)
            .bind(patch.updated_at)
            .bind(&id)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn delete_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&conversation_id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn insert_message(&self, record: MessageRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&record.id)
            .bind(&record.conversation_id)
            .bind(record.role.as_str())
            .bind(&record.content)
            .bind(record.created_at)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    fn update_message_content(&self, message_id: &str, content: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let message_id = message_id.to_string();
        let content = content.to_string();
        Box::pin(async move {
            sqlx::query("UPDATE messages SET content = ? WHERE id = ?")
                .bind(&content)
                .bind(&message_id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<MessageRecord>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, conversation_id, role, content, created_at
                 FROM messages
                 WHERE conversation_id = ?
                 ORDER BY seq ASC",
            )
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(message_from_row).collect()
        })
    }

    fn list_conversation_summaries(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationSummary>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT c.id AS conversation_id,
                        (SELECT m.content FROM messages m
                          WHERE m.conversation_id = c.id
                          ORDER BY m.seq DESC LIMIT 1) AS last_message_content,
                        (SELECT m.created_at FROM messages m
                          WHERE m.conversation_id = c.id
                          ORDER BY m.seq DESC LIMIT 1) AS last_message_time,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id) AS message_count
                 FROM conversations c
                 ORDER BY c.updated_at DESC",
            )
            .fetch_all(&pool)
            .await?;

            Ok(rows
                .iter()
                .map(|row| ConversationSummary {
                    conversation_id: row.get("conversation_id"),
                    last_message_content: row.get("last_message_content"),
                    last_message_time: row.get("last_message_time"),
                    message_count: row.get("message_count"),
                })
                .collect())
        })
    }
}
