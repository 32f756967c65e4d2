//! resenha - Distributed review crawler
//!
//! Workers consume crawl jobs from a bounded priority queue, route their
//! traffic through a rotating pool of egress identities, and page through a
//! place's review listing with resumable checkpoints. A separate resolution
//! worker looks up the secondary ids the crawl needs and backs the producers
//! off when the paid search quota runs out.
//!
//! # Architecture
//!
//! - [`config`] - Configuration management and settings
//! - [`queue`] - Bounded priority queues, exchanges and typed consumers
//! - [`identity`] - Egress identity scheduling
//! - [`crawler`] - Fetching, pagination and the crawl worker loop
//! - [`quota`] - Secondary-id resolution and quota governance
//! - [`storage`] - Key-value, page archive and document store ports
//! - [`models`] - Core data structures and job contracts
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use resenha::models::CrawlRequest;
//! use resenha::queue::{Exchange, JobQueue, MemoryQueue, TypedQueue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new("gmaps_scrape", 10));
//!     let mut exchange = Exchange::topic("scrape");
//!     exchange.bind("gmaps_scrape.#", queue.clone());
//!     let jobs = TypedQueue::<CrawlRequest>::new(Arc::new(exchange), queue);
//!
//!     let job = CrawlRequest::new("place-1", "0x1:0x2", "Bar Pepe", "es", "es");
//!     jobs.publish(&job).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crawler;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod quota;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crawler::{CrawlOutcome, CrawlWorker, PaginationEngine, StopReason};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::identity::IdentityScheduler;
    pub use crate::models::{CrawlRequest, ResolveRequest, ReviewBatch, WireMessage};
    pub use crate::queue::{JobQueue, PublishOutcome, TypedQueue};
    pub use crate::quota::{CadenceGate, QuotaGovernor};
    pub use crate::storage::{CheckpointStore, DocumentStore, KvStore, PageArchive};
}

// Direct re-exports for convenience
pub use models::{CrawlRequest, ResolveRequest};
