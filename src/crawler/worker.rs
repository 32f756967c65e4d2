//! Crawl worker control loop
//!
//! One job at a time: take a delivery, make sure the worker has a healthy
//! identity, crawl the target, then settle the delivery.
//!
//! | Outcome                     | Delivery | Then                          |
//! |-----------------------------|----------|-------------------------------|
//! | crawl finished              | ack      | next job                      |
//! | malformed / no secondary id | ack      | next job (logged as defect)   |
//! | no identity available       | requeue  | sleep the "nothing works" time |
//! | fetch, parse or store error | requeue  | next job                      |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::pagination::{CrawlOutcome, PaginationEngine};
use crate::error::{Error, Result};
use crate::identity::{IdentityError, IdentityScheduler};
use crate::metrics;
use crate::models::CrawlRequest;
use crate::queue::{Reclaimer, TypedDelivery, TypedQueue};

/// How a single job was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(CrawlOutcome),
    /// Acked without crawling
    Dropped,
    /// Returned to the queue after a transient failure
    Requeued,
    /// Returned to the queue because no identity could be activated
    NoIdentity,
}

/// Worker knobs
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    /// Sleep after the identity pool is exhausted
    pub nothing_works_sleep: Duration,
    /// Pause after a broker error
    pub error_backoff: Duration,
    /// In-flight deliveries older than this are returned to the queue
    pub visibility_timeout: Duration,
    /// How often stale deliveries are looked for while running
    pub reclaim_interval: Duration,
}

pub struct CrawlWorker {
    settings: WorkerSettings,
    queue: TypedQueue<CrawlRequest>,
    scheduler: Arc<IdentityScheduler>,
    engine: PaginationEngine,
}

impl CrawlWorker {
    pub fn new(
        settings: WorkerSettings,
        queue: TypedQueue<CrawlRequest>,
        scheduler: Arc<IdentityScheduler>,
        engine: PaginationEngine,
    ) -> Self {
        Self {
            settings,
            queue,
            scheduler,
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Consume until `shutdown` resolves
    ///
    /// A job in progress at shutdown is left unacked and will be redelivered.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let worker = self.name();
        let _reclaimer = Reclaimer::spawn(
            self.queue.queue().clone(),
            self.settings.visibility_timeout,
            self.settings.reclaim_interval,
        );

        tracing::info!(worker, queue = %self.queue.queue().name(), "Crawl worker started");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!(worker, "Crawl worker stopping");
                    return Ok(());
                }
                result = self.run_once() => {
                    if let Err(e) = result {
                        tracing::error!(worker, error = %e, "Worker iteration failed");
                        tokio::time::sleep(self.settings.error_backoff).await;
                    }
                }
            }
        }
    }

    /// Wait for one job and process it
    pub async fn run_once(&self) -> Result<JobOutcome> {
        let delivery = self.queue.consume().await?;
        self.process(delivery).await
    }

    /// Process a job if one is ready
    pub async fn try_run_once(&self) -> Result<Option<JobOutcome>> {
        match self.queue.try_consume().await? {
            Some(delivery) => self.process(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one delivery to completion and settle it
    pub async fn process(&self, delivery: TypedDelivery<CrawlRequest>) -> Result<JobOutcome> {
        let worker = self.name();

        let request = match &delivery.message {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(worker, delivery = %delivery.delivery.id, error = %e, "Dropping malformed crawl job");
                metrics::record_crawl_failed("malformed");
                self.queue.ack(&delivery).await?;
                return Ok(JobOutcome::Dropped);
            }
        };
        let target_id = request.target_id.as_str();

        if let Err(e) = request.require_secondary_id() {
            tracing::error!(worker, target_id, error = %e, "Dropping crawl job without secondary id");
            metrics::record_crawl_failed("missing_secondary_id");
            self.queue.ack(&delivery).await?;
            return Ok(JobOutcome::Dropped);
        }

        match self.scheduler.ensure_fresh(worker).await {
            Ok(binding) => {
                tracing::debug!(worker, target_id, identity = %binding.identity_key, "Identity ready");
            }
            Err(e @ IdentityError::NoIdentityAvailable { .. }) => {
                tracing::error!(worker, target_id, error = %e, sleep_secs = self.settings.nothing_works_sleep.as_secs(), "No identity works, backing off");
                metrics::record_crawl_failed("identity");
                self.queue.requeue(&delivery).await?;
                tokio::time::sleep(self.settings.nothing_works_sleep).await;
                return Ok(JobOutcome::NoIdentity);
            }
            Err(e) => {
                tracing::warn!(worker, target_id, error = %e, "Identity check failed, requeueing");
                metrics::record_crawl_failed("identity");
                self.queue.requeue(&delivery).await?;
                return Ok(JobOutcome::Requeued);
            }
        }

        let result = {
            let _timer = metrics::start_crawl_timer(worker);
            self.engine.crawl(request).await
        };

        match result {
            Ok(outcome) => {
                self.queue.ack(&delivery).await?;
                Ok(JobOutcome::Completed(outcome))
            }
            Err(e) => self.settle_failure(&delivery, target_id, e).await,
        }
    }

    async fn settle_failure(
        &self,
        delivery: &TypedDelivery<CrawlRequest>,
        target_id: &str,
        error: Error,
    ) -> Result<JobOutcome> {
        let worker = self.name();
        metrics::record_crawl_failed(error.category().label());

        if error.is_recoverable() {
            tracing::warn!(worker, target_id, error = %error, "Crawl aborted, requeueing");
            self.queue.requeue(delivery).await?;
            Ok(JobOutcome::Requeued)
        } else {
            tracing::error!(worker, target_id, error = %error, "Crawl failed permanently, dropping job");
            self.queue.ack(delivery).await?;
            Ok(JobOutcome::Dropped)
        }
    }
}
