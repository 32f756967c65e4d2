//! Document store for parsed reviews and per-place bookkeeping
//!
//! The crawler only issues writes here; reading the documents back is the job
//! of whatever downstream process consumes them.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{StoreError, StoreResult};
use crate::models::{CrawlRequest, ReviewBatch};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist the reviews parsed from one page
    async fn store_reviews(
        &self,
        request: &CrawlRequest,
        page: u32,
        batch: &ReviewBatch,
    ) -> StoreResult<()>;

    /// Mark a target as reviewed for a locale as of `date`
    async fn mark_reviewed(&self, target_id: &str, locale: &str, date: NaiveDate)
        -> StoreResult<()>;

    /// Record the resolved secondary id of a target
    async fn record_secondary_id(&self, target_id: &str, secondary_id: &str) -> StoreResult<()>;

    /// Check that the store is reachable
    async fn ping(&self) -> StoreResult<()>;
}

/// Reviews of one page as stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReviews {
    pub target_id: String,
    pub locale: String,
    pub page: u32,
    pub batch: ReviewBatch,
}

// ============================================================================
// In-memory adapter
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    reviews: Vec<StoredReviews>,
    reviewed: HashMap<(String, String), NaiveDate>,
    secondary_ids: HashMap<String, String>,
}

/// In-process [`DocumentStore`]
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable store
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every stored page, in write order
    pub async fn stored(&self) -> Vec<StoredReviews> {
        self.state.lock().await.reviews.clone()
    }

    /// Date a target was last marked reviewed for a locale
    pub async fn reviewed_on(&self, target_id: &str, locale: &str) -> Option<NaiveDate> {
        self.state
            .lock()
            .await
            .reviewed
            .get(&(target_id.to_string(), locale.to_string()))
            .copied()
    }

    /// Recorded secondary id of a target
    pub async fn secondary_id(&self, target_id: &str) -> Option<String> {
        self.state.lock().await.secondary_ids.get(target_id).cloned()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::backend("document store is offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn store_reviews(
        &self,
        request: &CrawlRequest,
        page: u32,
        batch: &ReviewBatch,
    ) -> StoreResult<()> {
        self.check_online()?;
        self.state.lock().await.reviews.push(StoredReviews {
            target_id: request.target_id.clone(),
            locale: request.locale.clone(),
            page,
            batch: batch.clone(),
        });
        Ok(())
    }

    async fn mark_reviewed(
        &self,
        target_id: &str,
        locale: &str,
        date: NaiveDate,
    ) -> StoreResult<()> {
        self.check_online()?;
        self.state
            .lock()
            .await
            .reviewed
            .insert((target_id.to_string(), locale.to_string()), date);
        Ok(())
    }

    async fn record_secondary_id(&self, target_id: &str, secondary_id: &str) -> StoreResult<()> {
        self.check_online()?;
        self.state
            .lock()
            .await
            .secondary_ids
            .insert(target_id.to_string(), secondary_id.to_string());
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }
}

// ============================================================================
// JSON-lines adapter
// ============================================================================

const REVIEWS_FILE: &str = "reviews.jsonl";
const REVIEWED_FILE: &str = "reviewed.jsonl";
const SECONDARY_IDS_FILE: &str = "secondary_ids.jsonl";

/// Append-only [`DocumentStore`] writing one JSON document per line
pub struct JsonlDocumentStore {
    output_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlDocumentStore {
    /// Open a store under `output_dir`, creating the directory if needed
    pub async fn open(output_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn append(&self, file: &str, lines: &[serde_json::Value]) -> StoreResult<()> {
        let mut buffer = String::new();
        for line in lines {
            let encoded =
                serde_json::to_string(line).map_err(|e| StoreError::serialization(file, e))?;
            buffer.push_str(&encoded);
            buffer.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.output_dir.join(file))
            .await?;
        handle.write_all(buffer.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonlDocumentStore {
    async fn store_reviews(
        &self,
        request: &CrawlRequest,
        page: u32,
        batch: &ReviewBatch,
    ) -> StoreResult<()> {
        let stored_at = Utc::now();
        let lines: Vec<_> = batch
            .reviews
            .iter()
            .map(|review| {
                json!({
                    "target_id": request.target_id,
                    "secondary_id": request.secondary_id,
                    "name": request.name,
                    "locale": request.locale,
                    "page": page,
                    "reviewed_at": review.reviewed_at,
                    "review": review.body,
                    "stored_at": stored_at,
                })
            })
            .collect();
        self.append(REVIEWS_FILE, &lines).await
    }

    async fn mark_reviewed(
        &self,
        target_id: &str,
        locale: &str,
        date: NaiveDate,
    ) -> StoreResult<()> {
        let line = json!({ "target_id": target_id, "locale": locale, "reviewed_on": date });
        self.append(REVIEWED_FILE, &[line]).await
    }

    async fn record_secondary_id(&self, target_id: &str, secondary_id: &str) -> StoreResult<()> {
        let line = json!({
            "target_id": target_id,
            "secondary_id": secondary_id,
            "resolved_at": Utc::now(),
        });
        self.append(SECONDARY_IDS_FILE, &[line]).await
    }

    async fn ping(&self) -> StoreResult<()> {
        let metadata = tokio::fs::metadata(&self.output_dir).await?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(StoreError::backend(format!(
                "{} is not a directory",
                self.output_dir.display()
            )))
        }
    }
}
