//! Producer cadence gate
//!
//! Producers are triggered periodically from outside. While a job class is
//! suspended, the gate lets through at most one run per reduced interval. The
//! override is written with an expiry at the resume instant, so the normal
//! cadence comes back on its own.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::{KvStore, StoreError, StoreResult};

/// Gate key for a job class
pub fn cadence_key(class: &str) -> String {
    format!("{class}_cadence")
}

/// Stored override for a suspended job class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CadenceOverride {
    /// Seconds between permitted runs while suspended
    pub interval_secs: u64,
    /// When the normal cadence resumes
    pub until: DateTime<Utc>,
    /// Last permitted run
    pub last_run: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CadenceGate {
    kv: Arc<dyn KvStore>,
}

impl CadenceGate {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Reduce `class` to one run per `interval` until `until`
    ///
    /// Counts `now` as the last run, so the next permitted run is one
    /// interval away.
    pub async fn suspend(
        &self,
        class: &str,
        interval: Duration,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let key = cadence_key(class);
        let Ok(ttl) = (until - now).to_std() else {
            tracing::warn!(class, %until, "Resume instant already passed, not suspending");
            return Ok(());
        };

        let state = CadenceOverride {
            interval_secs: interval.as_secs(),
            until,
            last_run: now,
        };
        let body = serde_json::to_string(&state).map_err(|e| StoreError::serialization(&key, e))?;
        self.kv.set(&key, &body, Some(ttl)).await?;

        tracing::warn!(class, %until, interval_secs = state.interval_secs, "Producer cadence reduced");
        Ok(())
    }

    /// Restore the normal cadence immediately
    pub async fn resume(&self, class: &str) -> StoreResult<bool> {
        self.kv.delete(&cadence_key(class)).await
    }

    /// Current override, if any
    pub async fn status(&self, class: &str) -> StoreResult<Option<CadenceOverride>> {
        let key = cadence_key(class);
        let Some(body) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| StoreError::serialization(&key, e))
    }

    /// Whether a producer run for `class` at `now` should publish
    ///
    /// A permitted run inside a suspension is recorded, so concurrent
    /// producers do not both get through.
    pub async fn should_publish(&self, class: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let key = cadence_key(class);
        let Some(body) = self.kv.get(&key).await? else {
            return Ok(true);
        };
        let state: CadenceOverride =
            serde_json::from_str(&body).map_err(|e| StoreError::serialization(&key, e))?;

        if now >= state.until {
            return Ok(true);
        }

        let interval = chrono::Duration::seconds(i64::try_from(state.interval_secs).unwrap_or(i64::MAX));
        if now - state.last_run < interval {
            tracing::info!(class, until = %state.until, "Producer run skipped, cadence reduced");
            return Ok(false);
        }

        let updated = CadenceOverride {
            last_run: now,
            ..state
        };
        let new_body =
            serde_json::to_string(&updated).map_err(|e| StoreError::serialization(&key, e))?;
        let ttl = (updated.until - now).to_std().ok();
        self.kv
            .compare_and_swap(&key, Some(&body), &new_body, ttl)
            .await
    }
}

/// First `day` of a month at `hour`:00 strictly after `now`, in `now`'s zone
///
/// Months without that day are skipped.
pub fn next_reset<Tz: TimeZone>(now: &DateTime<Tz>, day: u32, hour: u32) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let month_start = tz
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .earliest()?;

    (0..=12).find_map(|offset| {
        let month = month_start.clone().checked_add_months(Months::new(offset))?;
        let candidate = tz
            .with_ymd_and_hms(month.year(), month.month(), day, hour, 0, 0)
            .earliest()?;
        (candidate > *now).then_some(candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use chrono::FixedOffset;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_next_reset_same_month() {
        let reset = next_reset(&at(2024, 3, 2, 10), 8, 17).unwrap();
        assert_eq!(reset, at(2024, 3, 8, 17));
    }

    #[test]
    fn test_next_reset_rolls_to_next_month() {
        assert_eq!(next_reset(&at(2024, 3, 8, 17), 8, 17).unwrap(), at(2024, 4, 8, 17));
        assert_eq!(next_reset(&at(2024, 12, 20, 0), 8, 17).unwrap(), at(2025, 1, 8, 17));
    }

    #[test]
    fn test_next_reset_skips_short_months() {
        assert_eq!(next_reset(&at(2023, 2, 1, 0), 31, 17).unwrap(), at(2023, 3, 31, 17));
    }

    #[test]
    fn test_next_reset_keeps_zone() {
        let madrid = FixedOffset::east_opt(3600).unwrap();
        let now = madrid.with_ymd_and_hms(2024, 3, 8, 16, 30, 0).unwrap();
        let reset = next_reset(&now, 8, 17).unwrap();
        assert_eq!(reset, madrid.with_ymd_and_hms(2024, 3, 8, 17, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_gate_open_without_override() {
        let gate = CadenceGate::new(Arc::new(MemoryKv::new()));
        assert!(gate.should_publish("serp_queue", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_suspended_gate_reduces_cadence() {
        let gate = CadenceGate::new(Arc::new(MemoryKv::new()));
        let now = Utc::now();
        let day = Duration::from_secs(86_400);
        gate.suspend("serp_queue", day, now + chrono::Duration::days(10), now)
            .await
            .unwrap();

        assert!(!gate.should_publish("serp_queue", now + chrono::Duration::minutes(10)).await.unwrap());
        assert!(gate.should_publish("gmaps_scrape", now).await.unwrap());

        let next_day = now + chrono::Duration::hours(25);
        assert!(gate.should_publish("serp_queue", next_day).await.unwrap());
        assert!(!gate
            .should_publish("serp_queue", next_day + chrono::Duration::minutes(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_gate_opens_after_until() {
        let gate = CadenceGate::new(Arc::new(MemoryKv::new()));
        let now = Utc::now();
        gate.suspend("serp_queue", Duration::from_secs(86_400), now + chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert!(gate
            .should_publish("serp_queue", now + chrono::Duration::hours(2))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_resume_and_status() {
        let gate = CadenceGate::new(Arc::new(MemoryKv::new()));
        let now = Utc::now();
        let until = now + chrono::Duration::days(1);
        gate.suspend("serp_queue", Duration::from_secs(60), until, now)
            .await
            .unwrap();

        let status = gate.status("serp_queue").await.unwrap().unwrap();
        assert_eq!(status.until, until);
        assert_eq!(status.interval_secs, 60);

        assert!(gate.resume("serp_queue").await.unwrap());
        assert!(gate.status("serp_queue").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_suspend_in_the_past_is_ignored() {
        let gate = CadenceGate::new(Arc::new(MemoryKv::new()));
        let now = Utc::now();
        gate.suspend("serp_queue", Duration::from_secs(60), now - chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert!(gate.status("serp_queue").await.unwrap().is_none());
    }
}
