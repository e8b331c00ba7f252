//! Index database
//!
//! An SQLite store with two tables: one row per message id mirroring the
//! latest spool metadata, and an idempotent event log keyed by
//! `<type>:<message_id>`. Writers (indexer, bus consumer) only ever upsert,
//! so reprocessing the same spool or replaying the bus is harmless.

use mailsink_common::{Error, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// One row per message identifier.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub trace_id: String,
    pub received_at: String,
    pub remote_ip: String,
    pub domain: String,
    pub mailbox: String,
    pub mail_from: String,
    pub rcpt_to_json: String,
    pub bytes: i64,
    pub sha256: String,
    pub eml_path: String,
    pub meta_path: String,
    pub object_key: String,
}

/// One row per `(event type, message id)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub key: String,
    pub trace_id: String,
    pub message_id: String,
    pub event_type: String,
    pub occurred_at: String,
    pub payload_json: String,
}

/// Index database handle
#[derive(Clone)]
pub struct IndexDb {
    pool: SqlitePool,
}

const MIGRATION: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL DEFAULT '',
  received_at TEXT NOT NULL,
  remote_ip TEXT NOT NULL,
  domain TEXT NOT NULL,
  mailbox TEXT NOT NULL,
  mail_from TEXT NOT NULL,
  rcpt_to_json TEXT NOT NULL,
  bytes INTEGER NOT NULL,
  sha256 TEXT NOT NULL,
  eml_path TEXT NOT NULL,
  meta_path TEXT NOT NULL,
  object_key TEXT NOT NULL DEFAULT ''
)",
    "CREATE INDEX IF NOT EXISTS idx_messages_domain_mailbox_time
  ON messages(domain, mailbox, received_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_trace_id ON messages(trace_id)",
    "CREATE TABLE IF NOT EXISTS events (
  key TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL,
  message_id TEXT NOT NULL,
  type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  payload_json TEXT NOT NULL
)",
    "CREATE INDEX IF NOT EXISTS idx_events_trace_id_time ON events(trace_id, occurred_at, key)",
];

impl IndexDb {
    /// Open (creating if missing) and migrate the index database.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("open {}: {}", path.display(), e)))?;

        migrate(&pool).await?;

        info!(path = %path.display(), "index database open");

        Ok(Self { pool })
    }

    /// Insert or overwrite the row for `row.id`.
    pub async fn upsert_message(&self, row: &MessageRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, trace_id, received_at, remote_ip, domain, mailbox, mail_from, rcpt_to_json, bytes, sha256, eml_path, meta_path, object_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              trace_id=excluded.trace_id,
              received_at=excluded.received_at,
              remote_ip=excluded.remote_ip,
              domain=excluded.domain,
              mailbox=excluded.mailbox,
              mail_from=excluded.mail_from,
              rcpt_to_json=excluded.rcpt_to_json,
              bytes=excluded.bytes,
              sha256=excluded.sha256,
              eml_path=excluded.eml_path,
              meta_path=excluded.meta_path,
              object_key=excluded.object_key
            "#,
        )
        .bind(&row.id)
        .bind(&row.trace_id)
        .bind(&row.received_at)
        .bind(&row.remote_ip)
        .bind(&row.domain)
        .bind(&row.mailbox)
        .bind(&row.mail_from)
        .bind(&row.rcpt_to_json)
        .bind(row.bytes)
        .bind(&row.sha256)
        .bind(&row.eml_path)
        .bind(&row.meta_path)
        .bind(&row.object_key)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("upsert message {}: {}", row.id, e)))?;

        Ok(())
    }

    /// Insert or overwrite the event row for `row.key`.
    pub async fn upsert_event(&self, row: &EventRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (key, trace_id, message_id, type, occurred_at, payload_json)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              trace_id=excluded.trace_id,
              message_id=excluded.message_id,
              type=excluded.type,
              occurred_at=excluded.occurred_at,
              payload_json=excluded.payload_json
            "#,
        )
        .bind(&row.key)
        .bind(&row.trace_id)
        .bind(&row.message_id)
        .bind(&row.event_type)
        .bind(&row.occurred_at)
        .bind(&row.payload_json)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("upsert event {}: {}", row.key, e)))?;

        Ok(())
    }

    /// List messages for a mailbox, ordered by `(received_at, id)`.
    ///
    /// `after` is the opaque cursor `received_at:id` returned by a previous
    /// page. `limit` is clamped to 1..=200 with a default of 50.
    pub async fn list_messages(
        &self,
        domain: &str,
        mailbox: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        let limit = if limit == 0 || limit > 200 { 50 } else { limit };

        let query = match after.filter(|a| !a.is_empty()) {
            Some(after) => sqlx::query_as::<_, MessageRow>(
                r#"
                SELECT id, trace_id, received_at, remote_ip, domain, mailbox, mail_from, rcpt_to_json, bytes, sha256, eml_path, meta_path, object_key
                FROM messages
                WHERE domain = ? AND mailbox = ? AND (received_at || ':' || id) > ?
                ORDER BY received_at, id
                LIMIT ?
                "#,
            )
            .bind(domain)
            .bind(mailbox)
            .bind(after)
            .bind(limit as i64),
            None => sqlx::query_as::<_, MessageRow>(
                r#"
                SELECT id, trace_id, received_at, remote_ip, domain, mailbox, mail_from, rcpt_to_json, bytes, sha256, eml_path, meta_path, object_key
                FROM messages
                WHERE domain = ? AND mailbox = ?
                ORDER BY received_at, id
                LIMIT ?
                "#,
            )
            .bind(domain)
            .bind(mailbox)
            .bind(limit as i64),
        };

        query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("list messages: {}", e)))
    }

    /// Fetch one message row by id.
    pub async fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("get message {}: {}", id, e)))
    }

    /// Row counts, used by tests and the health endpoint.
    pub async fn counts(&self) -> Result<(i64, i64)> {
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok((messages, events))
    }
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in MIGRATION {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {}", e)))?;
    }
    // For databases created before these columns existed.
    ensure_column(pool, "messages", "object_key", "TEXT NOT NULL DEFAULT ''").await?;
    ensure_column(pool, "messages", "trace_id", "TEXT NOT NULL DEFAULT ''").await?;
    Ok(())
}

async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, ddl: &str) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(format!("table_info {}: {}", table, e)))?;

    for row in &rows {
        let name: String = row
            .try_get("name")
            .map_err(|e| Error::Database(e.to_string()))?;
        if name == column {
            return Ok(());
        }
    }

    sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, ddl))
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("add column {}.{}: {}", table, column, e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_row(id: &str) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            trace_id: id.to_string(),
            received_at: "2026-02-14T00:00:00.000000000Z".to_string(),
            remote_ip: "1.2.3.4".to_string(),
            domain: "example.com".to_string(),
            mailbox: "inbound".to_string(),
            mail_from: "from@example.net".to_string(),
            rcpt_to_json: r#"["inbound@example.com"]"#.to_string(),
            bytes: 19,
            sha256: "ab".repeat(32),
            eml_path: format!("/spool/incoming/2026/02/14/{}.eml", id),
            meta_path: format!("/spool/incoming/2026/02/14/{}.json", id),
            object_key: String::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_message_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = IndexDb::open(&dir.path().join("index.db")).await.unwrap();

        let mut row = sample_row("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        db.upsert_message(&row).await.unwrap();
        row.object_key = "example.com/inbound/x.eml".to_string();
        db.upsert_message(&row).await.unwrap();

        let (messages, _) = db.counts().await.unwrap();
        assert_eq!(messages, 1);

        let got = db.get_message(&row.id).await.unwrap().unwrap();
        assert_eq!(got.object_key, "example.com/inbound/x.eml");
    }

    #[tokio::test]
    async fn test_upsert_event_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = IndexDb::open(&dir.path().join("index.db")).await.unwrap();

        let event = EventRow {
            key: "ingest.received:01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            trace_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            message_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            event_type: "ingest.received".to_string(),
            occurred_at: "2026-02-14T00:00:00.000000000Z".to_string(),
            payload_json: "{}".to_string(),
        };
        db.upsert_event(&event).await.unwrap();
        db.upsert_event(&event).await.unwrap();

        let (_, events) = db.counts().await.unwrap();
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn test_list_messages_cursor() {
        let dir = TempDir::new().unwrap();
        let db = IndexDb::open(&dir.path().join("index.db")).await.unwrap();

        let mut a = sample_row("01ARZ3NDEKTSV4RRFFQ69G5FAA");
        a.received_at = "2026-02-14T00:00:01.000000000Z".to_string();
        let mut b = sample_row("01ARZ3NDEKTSV4RRFFQ69G5FAB");
        b.received_at = "2026-02-14T00:00:02.000000000Z".to_string();
        db.upsert_message(&a).await.unwrap();
        db.upsert_message(&b).await.unwrap();

        let first = db
            .list_messages("example.com", "inbound", None, 1)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, a.id);

        let cursor = format!("{}:{}", first[0].received_at, first[0].id);
        let rest = db
            .list_messages("example.com", "inbound", Some(&cursor), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, b.id);
    }

    #[tokio::test]
    async fn test_migration_reruns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.db");
        drop(IndexDb::open(&path).await.unwrap());
        // Second open replays the migration over an existing schema.
        let db = IndexDb::open(&path).await.unwrap();
        assert!(db.get_message("missing").await.unwrap().is_none());
    }
}
