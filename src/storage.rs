use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{
    BackendKind, Conversation, ConversationUpdate, MediaRef, Message, MessageStatus,
    PerformanceMetrics, Role,
};
use crate::prompts::PromptProfile;

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Conversations Table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    last_updated_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    profile TEXT NOT NULL -- prompt profile wire name
);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT, -- append order
    id TEXT NOT NULL UNIQUE, -- UUID
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL, -- 'user' or 'assistant'
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    status TEXT NOT NULL,
    backend TEXT NOT NULL, -- 'local' or 'remote'
    media TEXT, -- Optional JSON array of media references
    metadata TEXT, -- Optional JSON performance metrics
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);

-- Application Settings Table (Key-Value)
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Persistence collaborator for conversations and their messages.
///
/// Listing returns messages in append order; appending also refreshes the
/// owning conversation's `last_updated_at`.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn create_conversation(&self, title: &str, profile: PromptProfile) -> Result<Conversation>;
    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;
    async fn append_message(&self, conversation_id: Uuid, message: &Message) -> Result<Uuid>;
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>>;
    async fn update_conversation_metadata(&self, conversation_id: Uuid, update: ConversationUpdate) -> Result<()>;
    async fn delete_conversation(&self, conversation_id: Uuid) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.context("Failed to create database directory")?;
        }
        log::info!("Connecting to database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, used by tests and throwaway sessions.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);
        // A single connection, since every :memory: connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read setting")?;
        row.map(|r| r.try_get::<String, _>("value").context("Failed to decode setting value"))
            .transpose()
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        log::debug!("Saving setting '{}'", key);
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to save setting")?;
        Ok(())
    }
}

fn timestamp(ms: i64, label: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("Invalid {} timestamp", label))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let id: String = row.try_get("id")?;
    let profile: String = row.try_get("profile")?;
    Ok(Conversation {
        id: Uuid::parse_str(&id).context("Failed to parse conversation ID")?,
        title: row.try_get("title")?,
        created_at: timestamp(row.try_get("created_at")?, "created_at")?,
        last_updated_at: timestamp(row.try_get("last_updated_at")?, "last_updated_at")?,
        profile: profile.parse()?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let id: String = row.try_get("id")?;
    let conversation_id: String = row.try_get("conversation_id")?;
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let backend: String = row.try_get("backend")?;
    let media: Option<String> = row.try_get("media")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(Message {
        id: Uuid::parse_str(&id).context("Failed to parse message ID")?,
        conversation_id: Uuid::parse_str(&conversation_id)
            .context("Failed to parse conversation ID for message")?,
        role: Role::parse(&role).with_context(|| format!("Unknown message role '{}'", role))?,
        content: row.try_get("content")?,
        timestamp: timestamp(row.try_get("timestamp")?, "message")?,
        status: MessageStatus::parse(&status).with_context(|| format!("Unknown message status '{}'", status))?,
        backend: BackendKind::parse(&backend).with_context(|| format!("Unknown backend '{}'", backend))?,
        media: match media {
            Some(json) => serde_json::from_str::<Vec<MediaRef>>(&json).context("Failed to parse message media")?,
            None => Vec::new(),
        },
        metadata: metadata
            .map(|json| serde_json::from_str::<PerformanceMetrics>(&json))
            .transpose()
            .context("Failed to parse message metadata")?,
    })
}

#[async_trait]
impl ConversationStore for StorageManager {
    /// Fetches all conversations, ordered by last updated descending.
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        log::debug!("Fetching all conversations from database");
        let rows = sqlx::query(
            "SELECT id, title, created_at, last_updated_at, profile
             FROM conversations
             ORDER BY last_updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch conversations from database")?;

        let conversations = rows.iter().map(conversation_from_row).collect::<Result<Vec<_>>>()?;
        log::info!("Fetched {} conversations", conversations.len());
        Ok(conversations)
    }

    async fn create_conversation(&self, title: &str, profile: PromptProfile) -> Result<Conversation> {
        log::info!("Creating new conversation");
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: now,
            last_updated_at: now,
            profile,
        };

        sqlx::query(
            "INSERT INTO conversations (id, title, created_at, last_updated_at, profile)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(conversation.id.to_string())
        .bind(&conversation.title)
        .bind(conversation.created_at.timestamp_millis())
        .bind(conversation.last_updated_at.timestamp_millis())
        .bind(profile.wire_name())
        .execute(&self.pool)
        .await
        .context("Failed to insert new conversation into database")?;

        log::info!("Successfully created conversation with ID: {}", conversation.id);
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        log::debug!("Fetching conversation with ID: {}", conversation_id);
        let row = sqlx::query(
            "SELECT id, title, created_at, last_updated_at, profile
             FROM conversations
             WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch conversation from database")?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Saves a single message and touches the conversation's timestamp.
    async fn append_message(&self, conversation_id: Uuid, message: &Message) -> Result<Uuid> {
        log::debug!("Saving message ID: {} to conversation: {}", message.id, conversation_id);

        let media = if message.media.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.media).context("Failed to encode message media")?)
        };
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode message metadata")?;

        let mut tx = self.pool.begin().await.context("Failed to start transaction")?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, timestamp, status, backend, media, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(conversation_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .bind(message.status.as_str())
        .bind(message.backend.as_str())
        .bind(media)
        .bind(metadata)
        .execute(&mut *tx)
        .await
        .context("Failed to insert message into database")?;

        let result = sqlx::query("UPDATE conversations SET last_updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to update conversation last_updated_at timestamp")?;
        if result.rows_affected() == 0 {
            anyhow::bail!("Conversation {} not found for message {}", conversation_id, message.id);
        }
        tx.commit().await.context("Failed to commit message")?;

        log::info!("Successfully saved message ID: {}", message.id);
        Ok(message.id)
    }

    /// Fetches all messages for a conversation in the order they were appended.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        log::debug!("Fetching messages for conversation ID: {}", conversation_id);
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, timestamp, status, backend, media, metadata
             FROM messages
             WHERE conversation_id = ?
             ORDER BY seq ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages from database")?;

        let messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
        log::info!("Fetched {} messages for conversation {}", messages.len(), conversation_id);
        Ok(messages)
    }

    async fn update_conversation_metadata(&self, conversation_id: Uuid, update: ConversationUpdate) -> Result<()> {
        log::info!("Updating conversation {}", conversation_id);
        if let Some(title) = update.title.as_deref() {
            if title.trim().is_empty() {
                anyhow::bail!("New title cannot be empty.");
            }
        }

        let result = sqlx::query(
            "UPDATE conversations
             SET title = COALESCE(?, title), profile = COALESCE(?, profile), last_updated_at = ?
             WHERE id = ?",
        )
        .bind(update.title.as_deref().map(str::trim))
        .bind(update.profile.map(|p| p.wire_name()))
        .bind(Utc::now().timestamp_millis())
        .bind(conversation_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update conversation in database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to update non-existent conversation: {}", conversation_id);
            return Err(anyhow::anyhow!("Conversation not found for updating."));
        }
        Ok(())
    }

    /// Deletes a conversation; its messages go with it through the foreign key.
    async fn delete_conversation(&self, conversation_id: Uuid) -> Result<()> {
        log::warn!("Deleting conversation with ID: {}", conversation_id);
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete conversation from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent conversation: {}", conversation_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_come_back_in_append_order() {
        let store = StorageManager::in_memory().await.unwrap();
        let conv = store.create_conversation("New Chat", PromptProfile::LabProtocolGuide).await.unwrap();

        let first = Message::user(conv.id, "first", BackendKind::Remote, Vec::new());
        let mut second = Message::placeholder(conv.id, BackendKind::Remote);
        second.content = "second".into();
        second.status = MessageStatus::Complete;
        second.metadata = Some(PerformanceMetrics {
            latency_ms: Some(120),
            tokens_per_second: Some(8.5),
            model_info: Some("gemma-3n".into()),
        });
        // Same timestamp on purpose: ordering must not depend on it.
        second.timestamp = first.timestamp;
        let third = Message::user(
            conv.id,
            "third",
            BackendKind::Remote,
            vec![MediaRef { kind: crate::models::MediaKind::Image, reference: "content://img/1".into() }],
        );

        for m in [&first, &second, &third] {
            assert_eq!(store.append_message(conv.id, m).await.unwrap(), m.id);
        }

        let loaded = store.list_messages(conv.id).await.unwrap();
        let contents: Vec<&str> = loaded.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
        assert_eq!(loaded[1].metadata, second.metadata);
        assert_eq!(loaded[2].media, third.media);
        assert_eq!(loaded[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_fails() {
        let store = StorageManager::in_memory().await.unwrap();
        let orphan = Message::user(Uuid::new_v4(), "hello", BackendKind::Local, Vec::new());
        assert!(store.append_message(orphan.conversation_id, &orphan).await.is_err());
    }

    #[tokio::test]
    async fn metadata_update_and_delete() {
        let store = StorageManager::in_memory().await.unwrap();
        let conv = store.create_conversation("New Chat", PromptProfile::Default).await.unwrap();
        store
            .append_message(conv.id, &Message::user(conv.id, "hi", BackendKind::Local, Vec::new()))
            .await
            .unwrap();

        store
            .update_conversation_metadata(
                conv.id,
                ConversationUpdate { title: Some("  Centrifuge help ".into()), profile: None },
            )
            .await
            .unwrap();
        let updated = store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(updated.title, "Centrifuge help");
        assert_eq!(updated.profile, PromptProfile::Default);

        assert!(store
            .update_conversation_metadata(conv.id, ConversationUpdate { title: Some(" ".into()), profile: None })
            .await
            .is_err());

        store.delete_conversation(conv.id).await.unwrap();
        assert!(store.get_conversation(conv.id).await.unwrap().is_none());
        assert!(store.list_messages(conv.id).await.unwrap().is_empty());
        assert!(store.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_are_upserted() {
        let store = StorageManager::in_memory().await.unwrap();
        assert_eq!(store.get_setting("last_server_url").await.unwrap(), None);
        store.set_setting("last_server_url", "http://10.42.0.1:8000").await.unwrap();
        store.set_setting("last_server_url", "http://10.42.0.2:8000").await.unwrap();
        assert_eq!(
            store.get_setting("last_server_url").await.unwrap().as_deref(),
            Some("http://10.42.0.2:8000")
        );
    }
}
