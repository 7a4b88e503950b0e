//! SQLite chat store.
//!
//! Uses a single SQLite database file with three tables:
//! - `chats`: conversations
//! - `messages`: turns, with citations stored as JSON text
//! - `usage`: append-only usage records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colloquy_core::chat::{Chat, ChatId, ChatUpdate, NewChat};
use colloquy_core::error::PersistenceError;
use colloquy_core::message::{CitedChunk, Message, MessageId, MessageQuery, MessageUpdate, NewMessage};
use colloquy_core::store::ChatStore;
use colloquy_core::usage::{UsageRecord, UsageSink};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A chat store backed by SQLite.
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// Open (or create) a database.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database.
    pub async fn new(path: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| PersistenceError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // An in-memory database lives per connection, so it must not be pooled
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| PersistenceError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite chat store initialized at {path}");
        Ok(store)
    }

    /// Open a database file by path, creating parent directories.
    pub async fn open(path: &std::path::Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistenceError::Storage(format!("{}: {e}", parent.display())))?;
        }
        Self::new(&format!("sqlite://{}", path.display())).await
    }

    async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                id          TEXT PRIMARY KEY NOT NULL,
                summary     TEXT NOT NULL,
                folder_id   TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::MigrationFailed(format!("chats table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                iid           INTEGER PRIMARY KEY AUTOINCREMENT,
                id            TEXT UNIQUE NOT NULL,
                chat_id       TEXT NOT NULL,
                prompt        TEXT NOT NULL,
                reply         TEXT NOT NULL DEFAULT '',
                reasoning     TEXT,
                input_tokens  INTEGER,
                output_tokens INTEGER,
                is_active     INTEGER NOT NULL DEFAULT 0,
                cited_files   TEXT NOT NULL DEFAULT '[]',
                cited_chunks  TEXT NOT NULL DEFAULT '[]',
                model         TEXT NOT NULL,
                temperature   REAL NOT NULL,
                max_tokens    INTEGER,
                created_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id, iid)")
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::MigrationFailed(format!("chat_id index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage (
                iid           INTEGER PRIMARY KEY AUTOINCREMENT,
                provider      TEXT NOT NULL,
                model         TEXT NOT NULL,
                input_tokens  INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                recorded_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::MigrationFailed(format!("usage table: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// All chats, most recently updated first.
    pub async fn list_chats(&self) -> Result<Vec<Chat>, PersistenceError> {
        let rows = sqlx::query("SELECT * FROM chats ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::QueryFailed(format!("list chats: {e}")))?;
        rows.iter().map(row_to_chat).collect()
    }

    /// All usage records, oldest first.
    pub async fn list_usage(&self) -> Result<Vec<UsageRecord>, PersistenceError> {
        let rows = sqlx::query("SELECT * FROM usage ORDER BY iid ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PersistenceError::QueryFailed(format!("list usage: {e}")))?;
        rows.iter()
            .map(|row| {
                Ok(UsageRecord {
                    provider: column(row, "provider")?,
                    model: column(row, "model")?,
                    input_tokens: column::<i64>(row, "input_tokens")? as u32,
                    output_tokens: column::<i64>(row, "output_tokens")? as u32,
                    recorded_at: parse_time(&column::<String>(row, "recorded_at")?),
                })
            })
            .collect()
    }

    async fn load_message(&self, id: &MessageId) -> Result<Message, PersistenceError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::QueryFailed(format!("load message: {e}")))?
            .ok_or_else(|| PersistenceError::MessageNotFound(id.to_string()))?;
        row_to_message(&row)
    }
}

fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, PersistenceError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| PersistenceError::QueryFailed(format!("{name} column: {e}")))
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_chat(row: &sqlx::sqlite::SqliteRow) -> Result<Chat, PersistenceError> {
    Ok(Chat {
        id: ChatId(column(row, "id")?),
        summary: column(row, "summary")?,
        folder_id: column(row, "folder_id")?,
        created_at: parse_time(&column::<String>(row, "created_at")?),
        updated_at: parse_time(&column::<String>(row, "updated_at")?),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, PersistenceError> {
    let cited_files: String = column(row, "cited_files")?;
    let cited_chunks: String = column(row, "cited_chunks")?;
    let cited_files: Vec<String> = serde_json::from_str(&cited_files).unwrap_or_default();
    let cited_chunks: Vec<CitedChunk> = serde_json::from_str(&cited_chunks).unwrap_or_default();

    Ok(Message {
        id: MessageId(column(row, "id")?),
        chat_id: ChatId(column(row, "chat_id")?),
        prompt: column(row, "prompt")?,
        reply: column(row, "reply")?,
        reasoning: column(row, "reasoning")?,
        input_tokens: column::<Option<i64>>(row, "input_tokens")?.map(|t| t as u32),
        output_tokens: column::<Option<i64>>(row, "output_tokens")?.map(|t| t as u32),
        is_active: column::<i64>(row, "is_active")? != 0,
        cited_files,
        cited_chunks,
        model: column(row, "model")?,
        temperature: column::<f64>(row, "temperature")? as f32,
        max_tokens: column::<Option<i64>>(row, "max_tokens")?.map(|t| t as u32),
        created_at: parse_time(&column::<String>(row, "created_at")?),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|e| PersistenceError::Storage(e.to_string()))
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_chat(&self, fields: NewChat) -> Result<Chat, PersistenceError> {
        let now = Utc::now();
        let chat = Chat {
            id: ChatId::new(),
            summary: fields.summary,
            folder_id: fields.folder_id,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO chats (id, summary, folder_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chat.id.as_str())
        .bind(&chat.summary)
        .bind(&chat.folder_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Storage(format!("insert chat: {e}")))?;
        debug!(chat_id = %chat.id, "Chat created");
        Ok(chat)
    }

    async fn update_chat(&self, update: ChatUpdate) -> Result<(), PersistenceError> {
        let existing = self
            .get_chat(&update.id)
            .await?
            .ok_or_else(|| PersistenceError::ChatNotFound(update.id.to_string()))?;
        let summary = update.summary.unwrap_or(existing.summary);
        let folder_id = update.folder_id.unwrap_or(existing.folder_id);

        sqlx::query("UPDATE chats SET summary = ?, folder_id = ?, updated_at = ? WHERE id = ?")
            .bind(&summary)
            .bind(&folder_id)
            .bind(Utc::now().to_rfc3339())
            .bind(update.id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::Storage(format!("update chat: {e}")))?;
        Ok(())
    }

    async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM chats WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::QueryFailed(format!("get chat: {e}")))?;
        row.as_ref().map(row_to_chat).transpose()
    }

    async fn create_message(&self, fields: NewMessage) -> Result<Message, PersistenceError> {
        let message = Message::from_new(MessageId::new(), fields);
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, chat_id, prompt, reply, is_active, model, temperature, max_tokens, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id.0)
        .bind(message.chat_id.as_str())
        .bind(&message.prompt)
        .bind(&message.reply)
        .bind(i64::from(message.is_active))
        .bind(&message.model)
        .bind(f64::from(message.temperature))
        .bind(message.max_tokens.map(i64::from))
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Storage(format!("insert message: {e}")))?;
        Ok(message)
    }

    async fn update_message(&self, update: MessageUpdate) -> Result<(), PersistenceError> {
        let id = update
            .id
            .clone()
            .ok_or_else(|| PersistenceError::QueryFailed("message update without id".into()))?;
        let mut message = self.load_message(&id).await?;
        update.apply_to(&mut message);

        sqlx::query(
            r#"
            UPDATE messages SET
                reply = ?, reasoning = ?, input_tokens = ?, output_tokens = ?,
                is_active = ?, cited_files = ?, cited_chunks = ?
            WHERE id = ?
            "#,
        )
        .bind(&message.reply)
        .bind(&message.reasoning)
        .bind(message.input_tokens.map(i64::from))
        .bind(message.output_tokens.map(i64::from))
        .bind(i64::from(message.is_active))
        .bind(to_json(&message.cited_files)?)
        .bind(to_json(&message.cited_chunks)?)
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Storage(format!("update message: {e}")))?;
        Ok(())
    }

    async fn fetch_messages(&self, query: MessageQuery) -> Result<Vec<Message>, PersistenceError> {
        let keyword = query.keyword.trim().to_lowercase();
        let pattern = format!("%{keyword}%");
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE chat_id = ?
              AND (? = '' OR lower(prompt) LIKE ? OR lower(reply) LIKE ?)
            ORDER BY iid ASC
            "#,
        )
        .bind(query.chat_id.as_str())
        .bind(&keyword)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistenceError::QueryFailed(format!("fetch messages: {e}")))?;
        rows.iter().map(row_to_message).collect()
    }
}

#[async_trait]
impl UsageSink for SqliteChatStore {
    async fn create(&self, record: UsageRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO usage (provider, model, input_tokens, output_tokens, recorded_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.provider)
        .bind(&record.model)
        .bind(i64::from(record.input_tokens))
        .bind(i64::from(record.output_tokens))
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Storage(format!("insert usage: {e}")))?;
        Ok(())
    }
}
