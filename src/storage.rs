//! Storage collaborator: the local conversation cache plus the remote
//! history/upload boundary.
//!
//! The core depends only on the traits here.  [`SqliteCache`] is the
//! shipped cache implementation; [`HttpHistory`] and [`HttpUploader`] talk
//! to whatever backend owns durable history and attachment blobs.  Their
//! concrete endpoints are deliberately simple — the backend itself is out
//! of scope, the client engine only needs the failure modes to be honest
//! (a history fetch may fail and degrades to cache-only, an upload failure
//! fails exactly one message).

use rusqlite::{params, Connection};

use crate::protocol::{Attachment, ConversationKey, Message, MessageStatus};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
            StorageError::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

#[derive(Debug)]
pub enum HistoryError {
    Http(String),
    Decode(String),
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::Http(e) => write!(f, "history fetch failed: {e}"),
            HistoryError::Decode(e) => write!(f, "history decode failed: {e}"),
        }
    }
}

impl std::error::Error for HistoryError {}

#[derive(Debug)]
pub enum UploadError {
    Http(String),
    Decode(String),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Http(e) => write!(f, "upload failed: {e}"),
            UploadError::Decode(e) => write!(f, "upload response decode failed: {e}"),
        }
    }
}

impl std::error::Error for UploadError {}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Local message cache, keyed by conversation.
///
/// Writes are read-modify-write per key: callers load the latest value,
/// merge against it, and save the result back.  Implementations must make
/// `save_conversation` replace the key's content atomically so two
/// in-flight operations never interleave partial lists.
pub trait ConversationStore {
    fn load_conversation(&self, key: &ConversationKey) -> Result<Vec<Message>, StorageError>;
    fn save_conversation(
        &mut self,
        key: &ConversationKey,
        messages: &[Message],
    ) -> Result<(), StorageError>;
}

/// Server-backed history for one conversation.  A failing fetch is
/// recoverable — callers degrade to cache-only.
pub trait RemoteHistory {
    fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<Message>, HistoryError>;
}

/// A file queued for upload alongside a message.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Attachment blob sink.  Upload happens before the send completes; an
/// error here fails that one message.
pub trait AttachmentUploader {
    fn upload(&self, upload: &AttachmentUpload) -> Result<Attachment, UploadError>;
}

// ---------------------------------------------------------------------------
// SQLite cache
// ---------------------------------------------------------------------------

/// SQLite-backed conversation cache.
///
/// One row per message per conversation key; attachments travel as a JSON
/// column.  Saves replace the whole key inside a transaction.
pub struct SqliteCache {
    conn: Connection,
}

impl SqliteCache {
    /// Open (or create) a cache database at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open a fresh in-memory cache.  Used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                conversation_key TEXT    NOT NULL,
                message_id       TEXT    NOT NULL,
                sender_id        TEXT    NOT NULL,
                recipient_id     TEXT,
                group_id         TEXT,
                body             TEXT    NOT NULL,
                attachments      TEXT    NOT NULL,
                timestamp        INTEGER NOT NULL,
                status           TEXT    NOT NULL,
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                deleted_at       INTEGER,
                PRIMARY KEY (conversation_key, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_key, timestamp);
            "#,
        )?;
        Ok(())
    }

    fn status_to_str(status: MessageStatus) -> &'static str {
        match status {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    fn status_from_str(s: &str) -> Result<MessageStatus, StorageError> {
        match s {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(StorageError::Corrupt(format!("unknown status: {other}"))),
        }
    }
}

impl ConversationStore for SqliteCache {
    fn load_conversation(&self, key: &ConversationKey) -> Result<Vec<Message>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, sender_id, recipient_id, group_id, body, attachments,
                    timestamp, status, is_deleted, deleted_at
             FROM messages
             WHERE conversation_key = ?1
             ORDER BY timestamp ASC, message_id ASC",
        )?;
        let rows = stmt.query_map(params![key.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i32>(8)?,
                row.get::<_, Option<i64>>(9)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, from, to, group_id, body, attachments, timestamp, status, is_deleted, deleted_at) =
                row?;
            let attachments: Vec<Attachment> = serde_json::from_str(&attachments)?;
            messages.push(Message {
                id,
                from,
                to,
                group_id,
                text: body,
                attachments,
                timestamp: timestamp as u64,
                status: Self::status_from_str(&status)?,
                is_deleted: is_deleted != 0,
                deleted_at: deleted_at.map(|t| t as u64),
            });
        }
        Ok(messages)
    }

    fn save_conversation(
        &mut self,
        key: &ConversationKey,
        messages: &[Message],
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_key = ?1",
            params![key.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages
                     (conversation_key, message_id, sender_id, recipient_id, group_id,
                      body, attachments, timestamp, status, is_deleted, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for message in messages {
                let attachments = serde_json::to_string(&message.attachments)?;
                stmt.execute(params![
                    key.as_str(),
                    message.id,
                    message.from,
                    message.to,
                    message.group_id,
                    message.text,
                    attachments,
                    message.timestamp as i64,
                    Self::status_to_str(message.status),
                    message.is_deleted as i32,
                    message.deleted_at.map(|t| t as i64),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP collaborators
// ---------------------------------------------------------------------------

/// History fetcher over HTTP: `GET {base}/history/{key}` returning a JSON
/// array of messages.
pub struct HttpHistory {
    base_url: String,
}

impl HttpHistory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl RemoteHistory for HttpHistory {
    fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<Message>, HistoryError> {
        let url = format!(
            "{}/history/{}",
            self.base_url.trim_end_matches('/'),
            key.as_str()
        );
        let response = ureq::get(&url)
            .call()
            .map_err(|e| HistoryError::Http(e.to_string()))?;
        response
            .into_json()
            .map_err(|e| HistoryError::Decode(e.to_string()))
    }
}

/// Attachment uploader over HTTP: `POST {base}/upload` with the raw bytes,
/// file name and type in query/header, returning the stored [`Attachment`].
pub struct HttpUploader {
    base_url: String,
}

impl HttpUploader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl AttachmentUploader for HttpUploader {
    fn upload(&self, upload: &AttachmentUpload) -> Result<Attachment, UploadError> {
        let url = format!(
            "{}/upload?name={}",
            self.base_url.trim_end_matches('/'),
            upload.name
        );
        let response = ureq::post(&url)
            .set("Content-Type", &upload.content_type)
            .send_bytes(&upload.data)
            .map_err(|e| UploadError::Http(e.to_string()))?;
        response
            .into_json()
            .map_err(|e| UploadError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(id: &str, timestamp: u64) -> Message {
        Message {
            id: id.to_string(),
            from: "u1".to_string(),
            to: Some("u2".to_string()),
            group_id: None,
            text: format!("body-{id}"),
            attachments: vec![Attachment {
                name: "pic.png".to_string(),
                url: "https://files/pic.png".to_string(),
                content_type: "image/png".to_string(),
                size: 2048,
            }],
            timestamp,
            status: MessageStatus::Delivered,
            is_deleted: false,
            deleted_at: None,
        }
    }

    #[test]
    fn save_and_load_round_trips_all_fields() {
        let mut cache = SqliteCache::open_in_memory().expect("in-memory cache");
        let key = ConversationKey::direct("u1", "u2");

        let mut deleted = sample_message("m2", 200);
        deleted.soft_delete(250);
        let messages = vec![sample_message("m1", 100), deleted];

        cache.save_conversation(&key, &messages).expect("save");
        let loaded = cache.load_conversation(&key).expect("load");

        assert_eq!(loaded, messages);
        assert!(loaded[1].is_deleted);
        assert_eq!(loaded[1].deleted_at, Some(250));
    }

    #[test]
    fn load_of_unknown_key_is_empty() {
        let cache = SqliteCache::open_in_memory().expect("in-memory cache");
        let loaded = cache
            .load_conversation(&ConversationKey::direct("a", "b"))
            .expect("load");
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_replaces_the_whole_conversation() {
        let mut cache = SqliteCache::open_in_memory().expect("in-memory cache");
        let key = ConversationKey::direct("u1", "u2");

        cache
            .save_conversation(&key, &[sample_message("m1", 100), sample_message("m2", 200)])
            .expect("first save");
        cache
            .save_conversation(&key, &[sample_message("m3", 300)])
            .expect("second save");

        let loaded = cache.load_conversation(&key).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "m3");
    }

    #[test]
    fn conversations_are_isolated_by_key() {
        let mut cache = SqliteCache::open_in_memory().expect("in-memory cache");
        let direct = ConversationKey::direct("u1", "u2");
        let group = ConversationKey::group("grp1");

        let mut group_msg = sample_message("g1", 50);
        group_msg.to = None;
        group_msg.group_id = Some("grp1".to_string());

        cache
            .save_conversation(&direct, &[sample_message("m1", 100)])
            .expect("save direct");
        cache.save_conversation(&group, &[group_msg]).expect("save group");

        assert_eq!(cache.load_conversation(&direct).expect("load").len(), 1);
        let loaded_group = cache.load_conversation(&group).expect("load");
        assert_eq!(loaded_group.len(), 1);
        assert_eq!(loaded_group[0].group_id.as_deref(), Some("grp1"));
    }

    #[test]
    fn load_returns_timestamp_order() {
        let mut cache = SqliteCache::open_in_memory().expect("in-memory cache");
        let key = ConversationKey::direct("u1", "u2");
        cache
            .save_conversation(
                &key,
                &[
                    sample_message("late", 300),
                    sample_message("early", 100),
                    sample_message("mid", 200),
                ],
            )
            .expect("save");

        let loaded = cache.load_conversation(&key).expect("load");
        let ids: Vec<&str> = loaded.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }
}
