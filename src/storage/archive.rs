//! Raw page archive with bounded retention
//!
//! Pages are kept long enough to recover the continuation token of the last
//! checkpointed page when a crawl resumes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{KvStore, StoreError, StoreResult};
use crate::models::PageRecord;

#[async_trait]
pub trait PageArchive: Send + Sync {
    /// Store a fetched page, replacing any earlier copy of the same page
    async fn put(&self, record: &PageRecord) -> StoreResult<()>;

    /// Look up the archived copy of a page
    async fn get(&self, target_id: &str, locale: &str, page: u32)
        -> StoreResult<Option<PageRecord>>;

    /// Check that the archive is reachable
    async fn ping(&self) -> StoreResult<()>;
}

/// Archive key for one page, `archive:{target}:{locale}:{page}`
pub fn archive_key(target_id: &str, locale: &str, page: u32) -> String {
    format!("archive:{target_id}:{locale}:{page}")
}

/// [`PageArchive`] storing JSON records in a [`KvStore`] with a TTL
#[derive(Clone)]
pub struct KvPageArchive {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl KvPageArchive {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }
}

#[async_trait]
impl PageArchive for KvPageArchive {
    async fn put(&self, record: &PageRecord) -> StoreResult<()> {
        let key = archive_key(&record.target_id, &record.locale, record.page_number);
        let body =
            serde_json::to_string(record).map_err(|e| StoreError::serialization(&key, e))?;
        self.kv.set(&key, &body, Some(self.ttl)).await
    }

    async fn get(
        &self,
        target_id: &str,
        locale: &str,
        page: u32,
    ) -> StoreResult<Option<PageRecord>> {
        let key = archive_key(target_id, locale, page);
        match self.kv.get(&key).await? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| StoreError::serialization(&key, e)),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.kv.ping().await
    }
}
