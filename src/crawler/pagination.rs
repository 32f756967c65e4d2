//! Resumable pagination over one target's review feed
//!
//! ```text
//! Start ─► Fetch(n) ─► Parse(n) ─┬─► Store(n) ─► Fetch(n+1)
//!                                └─► Stop
//! ```
//!
//! The start page comes from the checkpoint: a crawl with checkpoint `k`
//! resumes at `k + 1` with the token archived alongside page `k`; if page `k`
//! had no token the feed is done and nothing is fetched. Every stored
//! page advances the checkpoint before the stop condition is evaluated, so a
//! crash never loses acknowledged progress and never repeats a page number.

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use std::fmt;
use std::sync::Arc;

use super::delay::PageDelay;
use super::fetcher::PageFetcher;
use super::parser::ReviewParser;
use super::url::{extract_continuation_token, review_url};
use crate::config::PaginationConfig;
use crate::error::Result;
use crate::metrics;
use crate::models::{CrawlRequest, PageRecord, ReviewBatch};
use crate::storage::{CheckpointStore, DocumentStore, PageArchive};

/// Why a crawl ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The page carried no continuation token
    LastPage,
    /// The parser found no reviews on the page
    EmptyBatch,
    /// Every review on the page predates the previous crawl
    ReachedKnownContent,
    /// The page reached past the maximum content age
    ContentTooOld,
    /// The per-crawl page ceiling was hit
    PageCeiling,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LastPage => "last_page",
            Self::EmptyBatch => "empty_batch",
            Self::ReachedKnownContent => "known_content",
            Self::ContentTooOld => "too_old",
            Self::PageCeiling => "page_ceiling",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Summary of a finished crawl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlOutcome {
    pub reason: StopReason,
    /// First page number requested (or that would have been)
    pub start_page: u32,
    /// Pages stored during this crawl
    pub pages_stored: u32,
    /// Last page stored, if any
    pub last_page: Option<u32>,
}

/// Engine knobs, usually taken from [`PaginationConfig`]
#[derive(Debug, Clone)]
pub struct PaginationSettings {
    pub review_host: String,
    pub page_ceiling_min: u32,
    pub page_ceiling_max: u32,
    pub max_age: chrono::Duration,
}

impl From<&PaginationConfig> for PaginationSettings {
    fn from(config: &PaginationConfig) -> Self {
        Self {
            review_host: config.review_host.clone(),
            page_ceiling_min: config.page_ceiling_min,
            page_ceiling_max: config.page_ceiling_max,
            max_age: config.max_age(),
        }
    }
}

/// Drives fetch, parse and store for one target at a time
pub struct PaginationEngine {
    fetcher: Arc<dyn PageFetcher>,
    parser: Arc<dyn ReviewParser>,
    archive: Arc<dyn PageArchive>,
    documents: Arc<dyn DocumentStore>,
    checkpoints: CheckpointStore,
    delay: Arc<dyn PageDelay>,
    settings: PaginationSettings,
}

impl PaginationEngine {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        parser: Arc<dyn ReviewParser>,
        archive: Arc<dyn PageArchive>,
        documents: Arc<dyn DocumentStore>,
        checkpoints: CheckpointStore,
        delay: Arc<dyn PageDelay>,
        settings: PaginationSettings,
    ) -> Self {
        Self {
            fetcher,
            parser,
            archive,
            documents,
            checkpoints,
            delay,
            settings,
        }
    }

    /// Crawl a target with a freshly drawn page ceiling
    pub async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlOutcome> {
        let ceiling = self.draw_ceiling();
        self.crawl_with_ceiling(request, ceiling).await
    }

    /// Crawl a target, never requesting a page number at or above `ceiling`
    pub async fn crawl_with_ceiling(
        &self,
        request: &CrawlRequest,
        ceiling: u32,
    ) -> Result<CrawlOutcome> {
        let secondary_id = request.require_secondary_id()?;
        let target_id = request.target_id.as_str();
        let locale = request.locale.as_str();

        let (start_page, resumed_token) = self.resume_point(request).await?;
        let mut page = start_page;
        let mut last_page = None;

        tracing::info!(target_id, locale, start_page, ceiling, "Starting crawl");

        let reason = 'crawl: {
            // The checkpointed page was the feed's last one.
            let Some(mut token) = resumed_token else {
                tracing::info!(target_id, locale, start_page, "Feed already exhausted, nothing to fetch");
                break 'crawl StopReason::LastPage;
            };

            loop {
                if page >= ceiling {
                    break StopReason::PageCeiling;
                }

                let url = review_url(
                    &self.settings.review_host,
                    secondary_id,
                    &token,
                    &request.domain,
                    locale,
                )?;
                tracing::debug!(target_id, page, %url, "Fetching page");

                let content = self
                    .fetcher
                    .fetch(&url, locale)
                    .await
                    .inspect_err(|e| tracing::warn!(target_id, page, error = %e, "Page fetch failed"))?;
                let next_token = extract_continuation_token(&content);

                let batch = self
                    .parser
                    .parse(&content)
                    .await
                    .inspect_err(|e| tracing::warn!(target_id, page, error = %e, "Page parse failed"))?;
                if batch.is_empty() {
                    tracing::info!(target_id, page, "Empty page, stopping");
                    break StopReason::EmptyBatch;
                }

                self.store_page(request, secondary_id, page, next_token.as_deref(), content, &batch)
                    .await
                    .inspect_err(|e| tracing::error!(target_id, page, error = %e, "Failed to persist page"))?;
                last_page = Some(page);
                metrics::record_page_fetched(locale);

                if let Some(reason) = stop_reason(
                    next_token.as_deref(),
                    &batch,
                    request.last_crawled_at,
                    Utc::now(),
                    self.settings.max_age,
                ) {
                    break reason;
                }

                page += 1;
                if page >= ceiling {
                    break StopReason::PageCeiling;
                }

                token = next_token.unwrap_or_default();
                let wait = self.delay.next_delay();
                tracing::debug!(target_id, next_page = page, wait_ms = wait.as_millis() as u64, "Sleeping between pages");
                tokio::time::sleep(wait).await;
            }
        };

        self.documents
            .mark_reviewed(target_id, locale, Local::now().date_naive())
            .await?;
        metrics::record_crawl_finished(reason.label());

        let outcome = CrawlOutcome {
            reason,
            start_page,
            pages_stored: last_page.map_or(0, |last| last + 1 - start_page),
            last_page,
        };
        tracing::info!(target_id, locale, %reason, pages = outcome.pages_stored, "Crawl finished");
        Ok(outcome)
    }

    /// Page number and token to start from
    ///
    /// `None` for the token means the checkpointed page carried no
    /// continuation token, so there is nothing left to fetch.
    async fn resume_point(&self, request: &CrawlRequest) -> Result<(u32, Option<String>)> {
        let target_id = request.target_id.as_str();
        let locale = request.locale.as_str();

        let Some(checkpoint) = self.checkpoints.load(target_id, locale).await? else {
            return Ok((0, Some(String::new())));
        };

        let token = match self.archive.get(target_id, locale, checkpoint).await? {
            Some(record) => record.continuation_token,
            None => {
                tracing::warn!(target_id, page = checkpoint, "Checkpointed page not archived, resuming without token");
                Some(String::new())
            }
        };

        tracing::info!(target_id, locale, checkpoint, "Resuming from checkpoint");
        Ok((checkpoint.saturating_add(1), token))
    }

    async fn store_page(
        &self,
        request: &CrawlRequest,
        secondary_id: &str,
        page: u32,
        next_token: Option<&str>,
        content: String,
        batch: &ReviewBatch,
    ) -> Result<()> {
        let record = PageRecord {
            target_id: request.target_id.clone(),
            secondary_id: secondary_id.to_string(),
            name: request.name.clone(),
            locale: request.locale.clone(),
            fetch_date: Local::now().date_naive(),
            page_number: page,
            continuation_token: next_token.map(str::to_string),
            content,
            created_at: Utc::now(),
        };

        self.archive.put(&record).await?;
        self.documents.store_reviews(request, page, batch).await?;
        self.checkpoints
            .advance(&request.target_id, &request.locale, page)
            .await?;
        Ok(())
    }

    fn draw_ceiling(&self) -> u32 {
        let (min, max) = (self.settings.page_ceiling_min, self.settings.page_ceiling_max);
        if max <= min {
            min
        } else {
            rand::thread_rng().gen_range(min..max)
        }
    }
}

/// Stop condition evaluated after a page was stored
pub fn stop_reason(
    next_token: Option<&str>,
    batch: &ReviewBatch,
    last_crawled_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> Option<StopReason> {
    if next_token.is_none() {
        return Some(StopReason::LastPage);
    }
    if let (Some(newest), Some(previous)) = (batch.newest(), last_crawled_at) {
        if newest < previous {
            return Some(StopReason::ReachedKnownContent);
        }
    }
    if let Some(oldest) = batch.oldest() {
        if now - oldest > max_age {
            return Some(StopReason::ContentTooOld);
        }
    }
    None
}
