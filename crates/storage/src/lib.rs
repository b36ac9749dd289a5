use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{AttachmentId, ContentType, Message, MessageId, RoomId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// The persisted session: who is signed in and the current token pair.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub user_id: UserId,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts or replaces a message by id. Replays of the same message (the
    /// realtime channel and a sync pull can both deliver it) land on the same
    /// row, so duplicates never accumulate.
    pub async fn upsert_message(&self, message: &Message) -> Result<()> {
        upsert_message_query(message).execute(&self.pool).await?;
        Ok(())
    }

    /// Upserts a pulled batch inside one transaction so a partially applied
    /// sync never advances the cache watermark past rows it did not keep.
    pub async fn bulk_upsert_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for message in messages {
            upsert_message_query(message).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Highest sequence_id cached for the room, 0 when the room is empty.
    pub async fn last_sequence_id(&self, room_id: &RoomId) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM messages WHERE room_id = ?",
        )
        .bind(room_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    /// All cached messages for a room in sequence order.
    pub async fn messages_in_room(&self, room_id: &RoomId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, room_id, sequence_id, sender_id, content_type, content_text,
                    attachment_id, payload_json, created_at
             FROM messages
             WHERE room_id = ?
             ORDER BY sequence_id ASC",
        )
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    /// Lowest cached sequence_id for the room, if anything is cached.
    pub async fn first_sequence_id(&self, room_id: &RoomId) -> Result<Option<i64>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT MIN(sequence_id) FROM messages WHERE room_id = ?")
                .bind(room_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn message_count(&self, room_id: &RoomId) -> Result<i64> {
        let value: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE room_id = ?")
            .bind(room_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn save_credentials(&self, creds: &StoredCredentials) -> Result<()> {
        sqlx::query(
            "INSERT INTO credentials (slot, user_id, username, access_token, refresh_token, updated_at)
             VALUES (1, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(slot) DO UPDATE SET
                user_id = excluded.user_id,
                username = excluded.username,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(creds.user_id.as_str())
        .bind(&creds.username)
        .bind(&creds.access_token)
        .bind(&creds.refresh_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_credentials(&self) -> Result<Option<StoredCredentials>> {
        let row = sqlx::query(
            "SELECT user_id, username, access_token, refresh_token FROM credentials WHERE slot = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredCredentials {
            user_id: UserId::new(r.get::<String, _>(0)),
            username: r.get::<String, _>(1),
            access_token: r.get::<String, _>(2),
            refresh_token: r.get::<String, _>(3),
        }))
    }

    pub async fn clear_credentials(&self) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE slot = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn upsert_message_query(
    message: &Message,
) -> sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO messages (id, room_id, sequence_id, sender_id, content_type, content_text,
                               attachment_id, payload_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            room_id = excluded.room_id,
            sequence_id = excluded.sequence_id,
            sender_id = excluded.sender_id,
            content_type = excluded.content_type,
            content_text = excluded.content_text,
            attachment_id = excluded.attachment_id,
            payload_json = excluded.payload_json,
            created_at = excluded.created_at",
    )
    .bind(message.id.as_str())
    .bind(message.room_id.as_str())
    .bind(message.sequence_id)
    .bind(message.sender_id.as_ref().map(|s| s.as_str()))
    .bind(message.content_type.as_str())
    .bind(message.content_text.as_deref())
    .bind(message.attachment_id.as_ref().map(|a| a.as_str()))
    .bind(
        message
            .payload_json
            .as_ref()
            .map(|v| v.to_string()),
    )
    .bind(message.created_at)
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Message> {
    let content_type_raw = row.get::<String, _>(4);
    let content_type = ContentType::parse(&content_type_raw)
        .with_context(|| format!("unknown content_type '{content_type_raw}' in message cache"))?;
    let payload_json = row
        .get::<Option<String>, _>(7)
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("malformed payload_json in message cache")?;

    Ok(Message {
        id: MessageId::new(row.get::<String, _>(0)),
        room_id: RoomId::new(row.get::<String, _>(1)),
        sequence_id: row.get::<i64, _>(2),
        sender_id: row.get::<Option<String>, _>(3).map(UserId::new),
        content_type,
        content_text: row.get::<Option<String>, _>(5),
        attachment_id: row.get::<Option<String>, _>(6).map(AttachmentId::new),
        payload_json,
        created_at: row.get::<DateTime<Utc>, _>(8),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
