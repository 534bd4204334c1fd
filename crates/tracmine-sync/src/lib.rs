//! Ingestion pipeline orchestration and the dual-cadence scheduler.
//!
//! One run is strictly sequential: enumerate ticket ids, then for each id
//! fetch, extract, normalize and upsert. Ticket-level failures are logged and
//! skipped so one bad ticket never blocks the rest; enumerator failures abort
//! the whole run. A single-flight guard keeps the incremental and bulk
//! cadences (and manual CLI runs) from executing concurrently against the
//! same store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracmine_core::normalize;
use tracmine_scrape::{list_ticket_ids, ScrapeConfig, TicketPageExtractor, TracHtmlExtractor};
use tracmine_storage::{HttpClientConfig, HttpFetcher, PageFetcher, TicketStore};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tracmine-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub report_id: u32,
    pub database_url: String,
    pub user_agent: String,
    pub fetch_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub incremental_cron: String,
    pub bulk_cron: String,
    pub incremental_count: u32,
    pub bulk_max: usize,
    pub bulk_page_size: u32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("TRACMINE_BASE_URL")
                .unwrap_or_else(|_| "https://trac.example.org".to_string()),
            report_id: env_parsed("TRACMINE_REPORT_ID", 1),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:tracmine.db".to_string()),
            user_agent: std::env::var("TRACMINE_USER_AGENT")
                .unwrap_or_else(|_| tracmine_storage::DEFAULT_USER_AGENT.to_string()),
            fetch_delay_ms: env_parsed("TRACMINE_FETCH_DELAY_MS", 1000),
            http_timeout_secs: env_parsed("TRACMINE_HTTP_TIMEOUT_SECS", 30),
            scheduler_enabled: std::env::var("TRACMINE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            incremental_cron: std::env::var("TRACMINE_INCREMENTAL_CRON")
                .unwrap_or_else(|_| "0 0 */2 * * *".to_string()),
            bulk_cron: std::env::var("TRACMINE_BULK_CRON")
                .unwrap_or_else(|_| "0 30 3 * * *".to_string()),
            incremental_count: env_parsed("TRACMINE_INCREMENTAL_COUNT", 20),
            bulk_max: env_parsed("TRACMINE_BULK_MAX", 1000),
            bulk_page_size: env_parsed("TRACMINE_BULK_PAGE_SIZE", 100),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketOutcome {
    Ingested,
    /// The detail page had no summary region: ticket absent or inaccessible.
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub ingested: usize,
    pub not_found: usize,
    pub failed: usize,
}

impl RunSummary {
    fn begin(mode: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode: mode.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            attempted: 0,
            ingested: 0,
            not_found: 0,
            failed: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

pub struct IngestPipeline<F: PageFetcher> {
    fetcher: F,
    extractor: Box<dyn TicketPageExtractor>,
    store: TicketStore,
    scrape: ScrapeConfig,
    bulk_page_size: u32,
    run_guard: Mutex<()>,
}

impl IngestPipeline<HttpFetcher> {
    /// Builds the production pipeline: polite HTTP fetcher, stock Trac
    /// extractor, migrated SQLite store.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            min_request_interval: std::time::Duration::from_millis(config.fetch_delay_ms),
        })?;
        let store = TicketStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("migrating ticket store")?;
        Ok(Self::new(
            fetcher,
            Box::new(TracHtmlExtractor::new(config.base_url.clone())),
            store,
            ScrapeConfig::new(config.base_url.clone(), config.report_id),
            config.bulk_page_size,
        ))
    }
}

impl<F: PageFetcher> IngestPipeline<F> {
    pub fn new(
        fetcher: F,
        extractor: Box<dyn TicketPageExtractor>,
        store: TicketStore,
        scrape: ScrapeConfig,
        bulk_page_size: u32,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            store,
            scrape,
            bulk_page_size: bulk_page_size.max(1),
            run_guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &TicketStore {
        &self.store
    }

    /// Fetch → extract → normalize → upsert for a single ticket. Errors
    /// propagate to the caller; run-level isolation happens in `run_*`.
    pub async fn ingest_ticket(&self, ticket_id: u32) -> Result<TicketOutcome> {
        let url = self.scrape.ticket_url(ticket_id);
        let markup = self
            .fetcher
            .fetch_page(&url)
            .await
            .with_context(|| format!("fetching {url}"))?;
        let Some(raw) = self.extractor.extract_ticket(&markup) else {
            return Ok(TicketOutcome::NotFound);
        };
        let ticket = normalize(raw, ticket_id, self.scrape.base_url(), Utc::now());
        self.store
            .upsert_ticket(&ticket)
            .await
            .with_context(|| format!("storing ticket {ticket_id}"))?;
        Ok(TicketOutcome::Ingested)
    }

    /// Incremental pass: one listing page of the most recent tickets.
    /// Returns `None` when another run already holds the single-flight guard.
    pub async fn run_recent(&self, count: u32) -> Result<Option<RunSummary>> {
        let Ok(_token) = self.run_guard.try_lock() else {
            warn!("recent sync skipped; another run is in flight");
            return Ok(None);
        };

        let mut summary = RunSummary::begin("recent");
        let ids = list_ticket_ids(&self.fetcher, &self.scrape, 1, count)
            .await
            .context("enumerating recent tickets")?;
        self.ingest_ids(&ids, &mut summary).await;
        let summary = summary.finish();
        info!(
            run_id = %summary.run_id,
            attempted = summary.attempted,
            ingested = summary.ingested,
            failed = summary.failed,
            "recent sync finished"
        );
        Ok(Some(summary))
    }

    /// Bulk pass: paginate listing pages until a page comes back empty or
    /// shorter than requested, or `max` tickets have been attempted.
    /// Enumerator failure aborts the run; ticket failures are isolated.
    pub async fn run_bulk(&self, max: usize) -> Result<Option<RunSummary>> {
        let Ok(_token) = self.run_guard.try_lock() else {
            warn!("bulk sync skipped; another run is in flight");
            return Ok(None);
        };

        let mut summary = RunSummary::begin("bulk");
        let mut page = 1u32;
        loop {
            let ids = list_ticket_ids(&self.fetcher, &self.scrape, page, self.bulk_page_size)
                .await
                .with_context(|| format!("enumerating listing page {page}"))?;
            if ids.is_empty() {
                break;
            }
            let last_page = (ids.len() as u32) < self.bulk_page_size;

            let budget = max.saturating_sub(summary.attempted);
            let batch = &ids[..ids.len().min(budget)];
            self.ingest_ids(batch, &mut summary).await;

            if last_page || summary.attempted >= max {
                break;
            }
            page += 1;
        }
        let summary = summary.finish();
        info!(
            run_id = %summary.run_id,
            attempted = summary.attempted,
            ingested = summary.ingested,
            failed = summary.failed,
            "bulk sync finished"
        );
        Ok(Some(summary))
    }

    async fn ingest_ids(&self, ids: &[u32], summary: &mut RunSummary) {
        for &ticket_id in ids {
            summary.attempted += 1;
            match self.ingest_ticket(ticket_id).await {
                Ok(TicketOutcome::Ingested) => summary.ingested += 1,
                Ok(TicketOutcome::NotFound) => {
                    info!(ticket_id, "ticket not found; skipped");
                    summary.not_found += 1;
                }
                Err(err) => {
                    warn!(ticket_id, error = format!("{err:#}"), "ticket ingestion failed; continuing");
                    summary.failed += 1;
                }
            }
        }
    }
}

/// Registers the two independent cadences when the scheduler flag is set.
/// The returned scheduler still needs `.start()`.
pub async fn maybe_build_scheduler(
    pipeline: Arc<IngestPipeline<HttpFetcher>>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let incremental = pipeline.clone();
    let incremental_count = config.incremental_count;
    let job = Job::new_async(config.incremental_cron.as_str(), move |_uuid, _lock| {
        let pipeline = incremental.clone();
        Box::pin(async move {
            match pipeline.run_recent(incremental_count).await {
                Ok(Some(summary)) => info!(run_id = %summary.run_id, "scheduled incremental sync done"),
                Ok(None) => {}
                Err(err) => warn!(error = format!("{err:#}"), "scheduled incremental sync failed"),
            }
        })
    })
    .with_context(|| format!("creating incremental job for cron {}", config.incremental_cron))?;
    sched.add(job).await.context("adding incremental job")?;

    let bulk = pipeline.clone();
    let bulk_max = config.bulk_max;
    let job = Job::new_async(config.bulk_cron.as_str(), move |_uuid, _lock| {
        let pipeline = bulk.clone();
        Box::pin(async move {
            match pipeline.run_bulk(bulk_max).await {
                Ok(Some(summary)) => info!(run_id = %summary.run_id, "scheduled bulk sync done"),
                Ok(None) => {}
                Err(err) => warn!(error = format!("{err:#}"), "scheduled bulk sync failed"),
            }
        })
    })
    .with_context(|| format!("creating bulk job for cron {}", config.bulk_cron))?;
    sched.add(job).await.context("adding bulk job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::tempdir;
    use tracmine_core::TicketStatus;
    use tracmine_storage::FetchError;

    const BASE: &str = "https://trac.example.org";

    struct StubFetcher {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    status_text: "Not Found".to_string(),
                    url: url.to_string(),
                })
        }
    }

    struct SlowFetcher;

    #[async_trait]
    impl PageFetcher for SlowFetcher {
        async fn fetch_page(&self, _url: &str) -> Result<String, FetchError> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(r#"<a href="/ticket/1">x</a>"#.to_string())
        }
    }

    fn listing_markup(ids: &[u32]) -> String {
        ids.iter()
            .map(|id| format!(r#"<a href="/ticket/{id}">#{id}</a>"#))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn detail_markup(id: u32) -> String {
        format!(
            r#"<div id="ticket"><h1 class="summary">Generated ticket {id}</h1>
            <table class="properties">
              <tr><th>Status:</th><td>new</td></tr>
              <tr><th>Reporter:</th><td>generator</td></tr>
            </table>
            <div class="description"><div class="searchable">auto-generated</div></div></div>"#
        )
    }

    async fn pipeline_with(pages: HashMap<String, String>) -> (tempfile::TempDir, IngestPipeline<StubFetcher>) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite:{}", dir.path().join("tickets.db").display());
        let store = TicketStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        let pipeline = IngestPipeline::new(
            StubFetcher { pages },
            Box::new(TracHtmlExtractor::new(BASE)),
            store,
            ScrapeConfig::new(BASE, 1),
            100,
        );
        (dir, pipeline)
    }

    fn scrape() -> ScrapeConfig {
        ScrapeConfig::new(BASE, 1)
    }

    #[tokio::test]
    async fn end_to_end_ingestion_of_fixture_ticket() {
        let fixture = r#"<div id="ticket"><h1 class="summary">Test Ticket</h1>
            <table class="properties">
              <tr><th>Status:</th><td>new</td></tr>
              <tr><th>Reporter:</th><td>alice</td></tr>
            </table>
            <div class="description"><div class="searchable">something broke</div></div></div>
            <div class="change">
              <span class="trac-author">testuser</span>
              <div class="comment searchable">Test comment</div>
            </div>
            <div id="attachments"><dl class="attachments">
              <dt><a href="/attachment/ticket/42/dump.bin">dump.bin</a>
                  <span class="trac-file-size">(10.5 MB)</span>
                  <span class="trac-author">bob</span></dt>
            </dl></div>"#;
        let mut pages = HashMap::new();
        pages.insert(scrape().ticket_url(42), fixture.to_string());
        let (_dir, pipeline) = pipeline_with(pages).await;

        let outcome = pipeline.ingest_ticket(42).await.expect("ingest");
        assert_eq!(outcome, TicketOutcome::Ingested);

        let ticket = pipeline
            .store()
            .get_ticket(42)
            .await
            .expect("get")
            .expect("stored");
        assert_eq!(ticket.title, "Test Ticket");
        assert_eq!(ticket.status, TicketStatus::New);
        assert_eq!(ticket.comments.len(), 1);
        assert_eq!(ticket.comments[0].author, "testuser");
        assert_eq!(ticket.comments[0].content, "Test comment");
        assert_eq!(ticket.attachments.len(), 1);
        assert_eq!(ticket.attachments[0].size, 11_010_048);
    }

    #[tokio::test]
    async fn missing_detail_page_is_not_found_not_error() {
        let mut pages = HashMap::new();
        pages.insert(
            scrape().ticket_url(5),
            "<p>Ticket does not exist</p>".to_string(),
        );
        let (_dir, pipeline) = pipeline_with(pages).await;
        let outcome = pipeline.ingest_ticket(5).await.expect("ingest");
        assert_eq!(outcome, TicketOutcome::NotFound);
        assert_eq!(pipeline.store().ticket_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn recent_run_isolates_ticket_failures() {
        let mut pages = HashMap::new();
        pages.insert(scrape().listing_url(1, 3), listing_markup(&[1, 2, 3]));
        pages.insert(scrape().ticket_url(1), detail_markup(1));
        // Ticket 2 has no page at all: the stub answers 404.
        pages.insert(scrape().ticket_url(3), detail_markup(3));
        let (_dir, pipeline) = pipeline_with(pages).await;

        let summary = pipeline
            .run_recent(3)
            .await
            .expect("run")
            .expect("not skipped");
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(pipeline.store().ticket_count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn enumerator_failure_aborts_run() {
        let (_dir, pipeline) = pipeline_with(HashMap::new()).await;
        assert!(pipeline.run_recent(20).await.is_err());
    }

    #[tokio::test]
    async fn bulk_run_paginates_until_short_page() {
        let mut pages = HashMap::new();
        let mut next_id = 1u32;
        for (page, len) in [(1u32, 100u32), (2, 100), (3, 37)] {
            let ids: Vec<u32> = (next_id..next_id + len).collect();
            next_id += len;
            pages.insert(scrape().listing_url(page, 100), listing_markup(&ids));
            for id in ids {
                pages.insert(scrape().ticket_url(id), detail_markup(id));
            }
        }
        let (_dir, pipeline) = pipeline_with(pages).await;

        let summary = pipeline
            .run_bulk(1000)
            .await
            .expect("run")
            .expect("not skipped");
        assert_eq!(summary.attempted, 237);
        assert_eq!(summary.ingested, 237);
        assert_eq!(summary.failed, 0);
        assert_eq!(pipeline.store().ticket_count().await.expect("count"), 237);
    }

    #[tokio::test]
    async fn bulk_run_respects_requested_maximum() {
        let mut pages = HashMap::new();
        let ids: Vec<u32> = (1..=100).collect();
        pages.insert(scrape().listing_url(1, 100), listing_markup(&ids));
        for id in ids {
            pages.insert(scrape().ticket_url(id), detail_markup(id));
        }
        let (_dir, pipeline) = pipeline_with(pages).await;

        let summary = pipeline
            .run_bulk(25)
            .await
            .expect("run")
            .expect("not skipped");
        assert_eq!(summary.attempted, 25);
        assert_eq!(summary.ingested, 25);
        assert_eq!(pipeline.store().ticket_count().await.expect("count"), 25);
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite:{}", dir.path().join("tickets.db").display());
        let store = TicketStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        let pipeline = Arc::new(IngestPipeline::new(
            SlowFetcher,
            Box::new(TracHtmlExtractor::new(BASE)),
            store,
            ScrapeConfig::new(BASE, 1),
            100,
        ));

        let background = pipeline.clone();
        let handle = tokio::spawn(async move { background.run_recent(1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = pipeline.run_recent(1).await.expect("second run");
        assert!(second.is_none(), "overlapping run should be skipped");

        let first = handle.await.expect("join").expect("first run");
        assert!(first.is_some(), "first run should complete");
    }
}
