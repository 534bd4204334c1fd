//! HTTP fetch utilities and the SQLite persistence gateway for tracmine.
//!
//! The fetcher is deliberately polite: a single shared gate enforces a fixed
//! minimum delay before every outbound request, and every request carries a
//! descriptive identity string plus an explicit timeout. Retry policy belongs
//! to callers; nothing in here retries.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;
use tracmine_core::{
    Attachment, ChangesetRef, Comment, Ticket, TicketPriority, TicketSeverity, TicketStatus,
    TicketType,
};

pub const CRATE_NAME: &str = "tracmine-storage";

pub const DEFAULT_USER_AGENT: &str = "tracmine-bot/0.1 (ticket aggregation crawler)";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} {status_text} for {url}")]
    HttpStatus {
        status: u16,
        status_text: String,
        url: String,
    },
    #[error("network failure for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Seam between the pipeline and the transport so runs can be exercised with
/// canned markup in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Minimum delay enforced before each request, regardless of the outcome
    /// of the previous one.
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            min_request_interval: Duration::from_millis(1000),
        }
    }
}

/// Serializes outbound requests and spaces them by a fixed interval.
#[derive(Debug)]
pub struct FetchGate {
    interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl FetchGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: Mutex::new(None),
        }
    }

    /// Waits until at least `interval` has passed since the previous request.
    /// The lock is held across the sleep so concurrent callers queue up
    /// instead of stampeding.
    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    gate: FetchGate,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            gate: FetchGate::new(config.min_request_interval),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        self.gate.wait().await;

        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Network {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
                url: url.to_string(),
            });
        }

        response.text().await.map_err(|source| FetchError::Network {
            url: url.to_string(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding stored ticket: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Idempotent upsert-by-id gateway over SQLite. The stored row shape is the
/// read contract for the external query API: scalar columns for everything
/// the API filters on, JSON columns for the owned sub-collections, and an
/// FTS5 table spanning title, description and comment text.
#[derive(Debug, Clone)]
pub struct TicketStore {
    pool: SqlitePool,
}

impl TicketStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        if let Some(path) = database_url.strip_prefix("sqlite:") {
            if path != ":memory:" {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|err| {
                            StoreError::Database(sqlx::Error::Io(err))
                        })?;
                    }
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the schema, the external-query indexes, and the full-text
    /// table. Safe to call on every startup.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tickets (
                ticket_id INTEGER PRIMARY KEY,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                severity TEXT,
                component TEXT NOT NULL,
                version TEXT,
                milestone TEXT,
                owner TEXT,
                reporter TEXT NOT NULL,
                resolution TEXT,
                resolution_date TEXT,
                keywords_json TEXT NOT NULL DEFAULT '[]',
                focuses_json TEXT NOT NULL DEFAULT '[]',
                cc_json TEXT NOT NULL DEFAULT '[]',
                blocked_by_json TEXT NOT NULL DEFAULT '[]',
                blocking_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                comments_json TEXT NOT NULL DEFAULT '[]',
                attachments_json TEXT NOT NULL DEFAULT '[]',
                changesets_json TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_tickets_kind ON tickets(kind)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_priority ON tickets(priority)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_component ON tickets(component)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_milestone ON tickets(milestone)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_created_at ON tickets(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_updated_at ON tickets(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_status_priority ON tickets(status, priority)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_component_status ON tickets(component, status)",
            "CREATE INDEX IF NOT EXISTS idx_tickets_milestone_status ON tickets(milestone, status)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        // FTS5 CREATE is not idempotent natively, so check first.
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='tickets_fts'",
        )
        .fetch_one(&self.pool)
        .await?;

        if !fts_exists {
            sqlx::query(
                r#"
                CREATE VIRTUAL TABLE tickets_fts USING fts5(
                    ticket_id UNINDEXED,
                    title,
                    description,
                    comments
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Full-document replace keyed by `ticket_id`. Creates the row if absent,
    /// otherwise overwrites every field; the full-text row is rebuilt in the
    /// same transaction.
    pub async fn upsert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let keywords_json = serde_json::to_string(&ticket.keywords)?;
        let focuses_json = serde_json::to_string(&ticket.focuses)?;
        let cc_json = serde_json::to_string(&ticket.cc_list)?;
        let blocked_by_json = serde_json::to_string(&ticket.blocked_by)?;
        let blocking_json = serde_json::to_string(&ticket.blocking)?;
        let comments_json = serde_json::to_string(&ticket.comments)?;
        let attachments_json = serde_json::to_string(&ticket.attachments)?;
        let changesets_json = serde_json::to_string(&ticket.changesets)?;
        let comment_text = ticket
            .comments
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tickets (
                ticket_id, url, title, description, kind, status, priority,
                severity, component, version, milestone, owner, reporter,
                resolution, resolution_date, keywords_json, focuses_json,
                cc_json, blocked_by_json, blocking_json, created_at,
                updated_at, comments_json, attachments_json, changesets_json
            ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            )
            ON CONFLICT(ticket_id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                description = excluded.description,
                kind = excluded.kind,
                status = excluded.status,
                priority = excluded.priority,
                severity = excluded.severity,
                component = excluded.component,
                version = excluded.version,
                milestone = excluded.milestone,
                owner = excluded.owner,
                reporter = excluded.reporter,
                resolution = excluded.resolution,
                resolution_date = excluded.resolution_date,
                keywords_json = excluded.keywords_json,
                focuses_json = excluded.focuses_json,
                cc_json = excluded.cc_json,
                blocked_by_json = excluded.blocked_by_json,
                blocking_json = excluded.blocking_json,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                comments_json = excluded.comments_json,
                attachments_json = excluded.attachments_json,
                changesets_json = excluded.changesets_json
            "#,
        )
        .bind(ticket.ticket_id as i64)
        .bind(&ticket.url)
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(ticket.kind.as_str())
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(ticket.severity.map(|s| s.as_str()))
        .bind(&ticket.component)
        .bind(&ticket.version)
        .bind(&ticket.milestone)
        .bind(&ticket.owner)
        .bind(&ticket.reporter)
        .bind(&ticket.resolution)
        .bind(ticket.resolution_date.map(|d| d.to_rfc3339()))
        .bind(&keywords_json)
        .bind(&focuses_json)
        .bind(&cc_json)
        .bind(&blocked_by_json)
        .bind(&blocking_json)
        .bind(ticket.created_at.to_rfc3339())
        .bind(ticket.updated_at.to_rfc3339())
        .bind(&comments_json)
        .bind(&attachments_json)
        .bind(&changesets_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tickets_fts WHERE ticket_id = ?")
            .bind(ticket.ticket_id as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO tickets_fts (ticket_id, title, description, comments) VALUES (?, ?, ?, ?)",
        )
        .bind(ticket.ticket_id as i64)
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(&comment_text)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_ticket(&self, ticket_id: u32) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query("SELECT * FROM tickets WHERE ticket_id = ?")
            .bind(ticket_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let priority: String = row.try_get("priority")?;
        let severity: Option<String> = row.try_get("severity")?;
        let resolution_date: Option<String> = row.try_get("resolution_date")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let keywords_json: String = row.try_get("keywords_json")?;
        let focuses_json: String = row.try_get("focuses_json")?;
        let cc_json: String = row.try_get("cc_json")?;
        let blocked_by_json: String = row.try_get("blocked_by_json")?;
        let blocking_json: String = row.try_get("blocking_json")?;
        let comments_json: String = row.try_get("comments_json")?;
        let attachments_json: String = row.try_get("attachments_json")?;
        let changesets_json: String = row.try_get("changesets_json")?;

        let comments: Vec<Comment> = serde_json::from_str(&comments_json)?;
        let attachments: Vec<Attachment> = serde_json::from_str(&attachments_json)?;
        let changesets: Vec<ChangesetRef> = serde_json::from_str(&changesets_json)?;

        Ok(Some(Ticket {
            ticket_id: row.try_get::<i64, _>("ticket_id")? as u32,
            url: row.try_get("url")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            kind: TicketType::normalize(Some(&kind)),
            status: TicketStatus::normalize(Some(&status)),
            priority: TicketPriority::normalize(Some(&priority)),
            severity: severity
                .as_deref()
                .map(|s| TicketSeverity::normalize(Some(s))),
            component: row.try_get("component")?,
            version: row.try_get("version")?,
            milestone: row.try_get("milestone")?,
            owner: row.try_get("owner")?,
            reporter: row.try_get("reporter")?,
            resolution: row.try_get("resolution")?,
            resolution_date: resolution_date.as_deref().and_then(parse_stored_timestamp),
            keywords: serde_json::from_str(&keywords_json)?,
            focuses: serde_json::from_str(&focuses_json)?,
            cc_list: serde_json::from_str(&cc_json)?,
            blocked_by: serde_json::from_str(&blocked_by_json)?,
            blocking: serde_json::from_str(&blocking_json)?,
            created_at: parse_stored_timestamp(&created_at).unwrap_or_else(Utc::now),
            updated_at: parse_stored_timestamp(&updated_at).unwrap_or_else(Utc::now),
            comments,
            attachments,
            changesets,
        }))
    }

    pub async fn ticket_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickets")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Full-text lookup over title, description and comment content, most
    /// relevant first. Exposed for the external query boundary and tests.
    pub async fn search_tickets(&self, query: &str, limit: u32) -> Result<Vec<u32>, StoreError> {
        let rows = sqlx::query(
            "SELECT CAST(ticket_id AS INTEGER) AS ticket_id FROM tickets_fts \
             WHERE tickets_fts MATCH ? ORDER BY rank LIMIT ?",
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("ticket_id")? as u32))
            .collect()
    }
}

fn parse_stored_timestamp(input: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use tracmine_core::FieldChange;

    fn sample_ticket(ticket_id: u32, title: &str) -> Ticket {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        Ticket {
            ticket_id,
            url: format!("https://trac.example.org/ticket/{ticket_id}"),
            title: title.to_string(),
            description: "Widget explodes when serialized.".to_string(),
            kind: TicketType::Defect,
            status: TicketStatus::Accepted,
            priority: TicketPriority::Major,
            severity: Some(TicketSeverity::Critical),
            component: "serializer".to_string(),
            version: Some("2.1".to_string()),
            milestone: Some("2.2".to_string()),
            owner: Some("carol".to_string()),
            reporter: "alice".to_string(),
            resolution: None,
            resolution_date: None,
            keywords: vec!["widget".to_string()],
            focuses: vec![],
            cc_list: vec!["dev@example.org".to_string()],
            blocked_by: vec![],
            blocking: vec![],
            created_at: at,
            updated_at: at,
            comments: vec![Comment {
                id: 1,
                author: "bob".to_string(),
                timestamp: at,
                content: "reproduced on trunk".to_string(),
                changes: vec![FieldChange {
                    field: "status".to_string(),
                    old_value: "new".to_string(),
                    new_value: "accepted".to_string(),
                }],
            }],
            attachments: vec![Attachment {
                filename: "trace.log".to_string(),
                size: 2560,
                uploaded_by: "bob".to_string(),
                uploaded_at: at,
                description: Some("stack trace".to_string()),
                url: "https://trac.example.org/attachment/ticket/1/trace.log".to_string(),
            }],
            changesets: vec![ChangesetRef {
                revision: 4711,
                author: "Unknown".to_string(),
                timestamp: at,
                message: "Referenced in ticket".to_string(),
                files: vec![],
                url: "https://trac.example.org/changeset/4711".to_string(),
            }],
        }
    }

    async fn temp_store() -> (tempfile::TempDir, TicketStore) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite:{}", dir.path().join("tickets.db").display());
        let store = TicketStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        (dir, store)
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let (_dir, store) = temp_store().await;
        store.migrate().await.expect("second migrate");
    }

    #[tokio::test]
    async fn upsert_replaces_whole_document() {
        let (_dir, store) = temp_store().await;
        store
            .upsert_ticket(&sample_ticket(1, "First title"))
            .await
            .expect("first upsert");
        store
            .upsert_ticket(&sample_ticket(1, "Second title"))
            .await
            .expect("second upsert");

        assert_eq!(store.ticket_count().await.expect("count"), 1);
        let stored = store
            .get_ticket(1)
            .await
            .expect("get")
            .expect("ticket present");
        assert_eq!(stored.title, "Second title");
    }

    #[tokio::test]
    async fn stored_ticket_round_trips() {
        let (_dir, store) = temp_store().await;
        let ticket = sample_ticket(7, "Round trip");
        store.upsert_ticket(&ticket).await.expect("upsert");
        let stored = store
            .get_ticket(7)
            .await
            .expect("get")
            .expect("ticket present");
        assert_eq!(stored, ticket);
        assert!(store.get_ticket(8).await.expect("get missing").is_none());
    }

    #[tokio::test]
    async fn full_text_search_spans_comments() {
        let (_dir, store) = temp_store().await;
        store
            .upsert_ticket(&sample_ticket(3, "Unrelated title"))
            .await
            .expect("upsert");
        let hits = store
            .search_tickets("reproduced", 10)
            .await
            .expect("search");
        assert_eq!(hits, vec![3]);
        let misses = store.search_tickets("unicorn", 10).await.expect("search");
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn fetch_gate_spaces_requests() {
        let gate = FetchGate::new(Duration::from_millis(40));
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
