//! Resumable crawl progress
//!
//! One key per (target, locale) holding the last page number whose records
//! were persisted. The value only moves forward; every write refreshes the
//! expiry so an abandoned crawl eventually restarts from page 0.

use std::sync::Arc;
use std::time::Duration;

use super::{KvStore, StoreError, StoreResult};

/// Number of times a lost CAS race is retried before giving up
const MAX_CAS_RETRIES: usize = 3;

/// Checkpoint key for a crawl target, `{target_id}_{locale}_page`
pub fn checkpoint_key(target_id: &str, locale: &str) -> String {
    format!("{target_id}_{locale}_page")
}

/// Monotonic page checkpoints on top of a [`KvStore`]
#[derive(Clone)]
pub struct CheckpointStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Last persisted page for a target, `None` if never written or expired
    pub async fn load(&self, target_id: &str, locale: &str) -> StoreResult<Option<u32>> {
        let key = checkpoint_key(target_id, locale);
        self.kv
            .get(&key)
            .await?
            .map(|raw| parse_page(&key, &raw))
            .transpose()
    }

    /// Record that `page` was persisted
    ///
    /// Writing the current value again only refreshes the expiry. A lower
    /// value is refused with [`StoreError::CheckpointRegression`].
    pub async fn advance(&self, target_id: &str, locale: &str, page: u32) -> StoreResult<()> {
        let key = checkpoint_key(target_id, locale);
        let new = page.to_string();

        for _ in 0..MAX_CAS_RETRIES {
            let current = self.kv.get(&key).await?;
            if let Some(raw) = current.as_deref() {
                let stored = parse_page(&key, raw)?;
                if stored > page {
                    return Err(StoreError::CheckpointRegression {
                        key,
                        current: stored,
                        attempted: page,
                    });
                }
            }

            if self
                .kv
                .compare_and_swap(&key, current.as_deref(), &new, Some(self.ttl))
                .await?
            {
                tracing::debug!(key = %key, page, "Checkpoint advanced");
                return Ok(());
            }
        }

        Err(StoreError::CheckpointConflict { key })
    }
}

fn parse_page(key: &str, raw: &str) -> StoreResult<u32> {
    raw.trim()
        .parse()
        .map_err(|e| StoreError::serialization(key, format!("bad page number '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn store() -> (Arc<MemoryKv>, CheckpointStore) {
        let kv = Arc::new(MemoryKv::new());
        let checkpoints = CheckpointStore::new(kv.clone(), Duration::from_secs(60));
        (kv, checkpoints)
    }

    #[tokio::test]
    async fn test_load_missing() {
        let (_, checkpoints) = store();
        assert_eq!(checkpoints.load("p1", "es").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_and_load() {
        let (kv, checkpoints) = store();
        checkpoints.advance("p1", "es", 0).await.unwrap();
        checkpoints.advance("p1", "es", 1).await.unwrap();
        checkpoints.advance("p1", "es", 1).await.unwrap();

        assert_eq!(checkpoints.load("p1", "es").await.unwrap(), Some(1));
        assert_eq!(checkpoints.load("p1", "en").await.unwrap(), None);
        assert_eq!(kv.get("p1_es_page").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_regression_is_refused() {
        let (_, checkpoints) = store();
        checkpoints.advance("p1", "es", 5).await.unwrap();

        let err = checkpoints.advance("p1", "es", 3).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::CheckpointRegression {
                current: 5,
                attempted: 3,
                ..
            }
        ));
        assert_eq!(checkpoints.load("p1", "es").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_expired_checkpoint_restarts() {
        let kv = Arc::new(MemoryKv::new());
        let checkpoints = CheckpointStore::new(kv, Duration::from_millis(20));
        checkpoints.advance("p1", "es", 4).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(checkpoints.load("p1", "es").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_write_is_an_error() {
        let (kv, checkpoints) = store();
        kv.set_offline(true);
        assert!(checkpoints.advance("p1", "es", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_value() {
        let (kv, checkpoints) = store();
        kv.set("p1_es_page", "three", None).await.unwrap();
        assert!(matches!(
            checkpoints.load("p1", "es").await,
            Err(StoreError::Serialization { .. })
        ));
    }
}
