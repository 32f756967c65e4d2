//! Quota governance for secondary-id resolution
//!
//! The resolution API is paid per search. When it reports that the period's
//! budget is spent, there is no point in trying the remaining jobs: the
//! governor drops the queued ones, settles the current one, and slows the
//! producer down until the quota resets.
//!
//! - [`resolver`] - API client and response classification
//! - [`cadence`] - producer cadence gate and reset computation

pub mod cadence;
pub mod resolver;

use chrono::{DateTime, Local, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{QueueConfig, QuotaConfig};
use crate::error::Result;
use crate::metrics;
use crate::models::ResolveRequest;
use crate::queue::{QueueError, Reclaimer, TypedDelivery, TypedQueue};
use crate::storage::{DocumentStore, StoreError};

pub use cadence::{cadence_key, next_reset, CadenceGate, CadenceOverride};
pub use resolver::{classify_response, SecondaryIdResolver, SerpApiResolver};

/// Resolution API errors
#[derive(Error, Debug)]
pub enum QuotaError {
    /// The period's search budget is spent
    #[error("Search quota exhausted: {0}")]
    Exhausted(String),

    /// The API answered with an error
    #[error("Search API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// The search found nothing usable
    #[error("No secondary id found for '{target_id}'")]
    NotFound { target_id: String },

    /// No API key configured
    #[error("Search API key is not configured")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl QuotaError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }
}

/// How a resolution job was settled
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved {
        target_id: String,
        secondary_id: String,
    },
    /// Acked without a result
    Dropped,
    /// Returned to the queue after a store failure
    Requeued,
    /// Quota spent: queue purged and producer slowed down
    QuotaExhausted {
        purged: usize,
        until: Option<DateTime<Utc>>,
    },
}

/// When and how the producer cadence is reduced
#[derive(Debug, Clone)]
pub struct QuotaSettings {
    pub worker: String,
    /// Job class whose producer gets slowed down
    pub class: String,
    pub reset_day: u32,
    pub reset_hour: u32,
    pub reduced_interval: Duration,
    pub error_backoff: Duration,
    /// In-flight deliveries older than this are returned to the queue
    pub visibility_timeout: Duration,
    pub reclaim_interval: Duration,
}

impl QuotaSettings {
    pub fn from_config(
        worker: impl Into<String>,
        class: impl Into<String>,
        quota: &QuotaConfig,
        queue: &QueueConfig,
    ) -> Self {
        Self {
            worker: worker.into(),
            class: class.into(),
            reset_day: quota.reset_day,
            reset_hour: quota.reset_hour,
            reduced_interval: quota.reduced_interval(),
            error_backoff: Duration::from_secs(5),
            visibility_timeout: queue.visibility_timeout(),
            reclaim_interval: queue.reclaim_interval(),
        }
    }
}

/// Resolution worker guarded by quota detection
pub struct QuotaGovernor {
    settings: QuotaSettings,
    queue: TypedQueue<ResolveRequest>,
    resolver: Arc<dyn SecondaryIdResolver>,
    documents: Arc<dyn DocumentStore>,
    gate: CadenceGate,
}

impl QuotaGovernor {
    pub fn new(
        settings: QuotaSettings,
        queue: TypedQueue<ResolveRequest>,
        resolver: Arc<dyn SecondaryIdResolver>,
        documents: Arc<dyn DocumentStore>,
        gate: CadenceGate,
    ) -> Self {
        Self {
            settings,
            queue,
            resolver,
            documents,
            gate,
        }
    }

    /// Consume until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let worker = self.settings.worker.as_str();
        let _reclaimer = Reclaimer::spawn(
            self.queue.queue().clone(),
            self.settings.visibility_timeout,
            self.settings.reclaim_interval,
        );
        tracing::info!(worker, queue = %self.queue.queue().name(), "Resolution worker started");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!(worker, "Resolution worker stopping");
                    return Ok(());
                }
                result = self.run_once() => {
                    if let Err(e) = result {
                        tracing::error!(worker, error = %e, "Resolution iteration failed");
                        tokio::time::sleep(self.settings.error_backoff).await;
                    }
                }
            }
        }
    }

    /// Wait for one job and process it
    pub async fn run_once(&self) -> Result<ResolveOutcome> {
        let delivery = self.queue.consume().await?;
        self.process(delivery).await
    }

    /// Resolve one job and settle its delivery
    pub async fn process(&self, delivery: TypedDelivery<ResolveRequest>) -> Result<ResolveOutcome> {
        let worker = self.settings.worker.as_str();

        let request = match &delivery.message {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(worker, delivery = %delivery.delivery.id, error = %e, "Dropping malformed resolution job");
                self.queue.ack(&delivery).await?;
                return Ok(ResolveOutcome::Dropped);
            }
        };
        let target_id = request.target_id.as_str();

        match self.resolver.resolve(request).await {
            Ok(secondary_id) => {
                if let Err(e) = self.documents.record_secondary_id(target_id, &secondary_id).await {
                    tracing::warn!(worker, target_id, error = %e, "Failed to record secondary id, requeueing");
                    self.queue.requeue(&delivery).await?;
                    return Ok(ResolveOutcome::Requeued);
                }
                self.queue.ack(&delivery).await?;
                tracing::info!(worker, target_id, %secondary_id, "Secondary id resolved");
                Ok(ResolveOutcome::Resolved {
                    target_id: target_id.to_string(),
                    secondary_id,
                })
            }
            Err(QuotaError::Exhausted(reason)) => self.on_exhausted(&delivery, target_id, &reason).await,
            Err(e) => {
                tracing::error!(worker, target_id, error = %e, "Resolution failed, dropping job");
                self.queue.ack(&delivery).await?;
                Ok(ResolveOutcome::Dropped)
            }
        }
    }

    async fn on_exhausted(
        &self,
        delivery: &TypedDelivery<ResolveRequest>,
        target_id: &str,
        reason: &str,
    ) -> Result<ResolveOutcome> {
        let worker = self.settings.worker.as_str();
        let class = self.settings.class.as_str();
        metrics::record_quota_exhausted(class);

        let purged = self.queue.purge().await?;
        self.queue.ack(delivery).await?;

        let now = Local::now();
        let until = next_reset(&now, self.settings.reset_day, self.settings.reset_hour)
            .map(|at| at.with_timezone(&Utc));
        match until {
            Some(until) => {
                self.gate
                    .suspend(class, self.settings.reduced_interval, until, now.with_timezone(&Utc))
                    .await?;
            }
            None => tracing::error!(worker, class, "Could not compute quota reset instant"),
        }

        tracing::warn!(worker, target_id, class, purged, ?until, reason, "Search quota exhausted");
        Ok(ResolveOutcome::QuotaExhausted { purged, until })
    }
}
