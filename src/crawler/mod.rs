//! Review crawling
//!
//! - [`fetcher`] - HTTP fetcher with User-Agent rotation and a request cap
//! - [`url`] - review listing URLs and continuation tokens
//! - [`parser`] - parser collaborator boundary
//! - [`delay`] - randomized delay between pages
//! - [`pagination`] - resumable page-by-page state machine
//! - [`worker`] - queue consumer control loop

pub mod delay;
pub mod fetcher;
pub mod pagination;
pub mod parser;
pub mod url;
pub mod worker;

pub use delay::{FixedDelay, GammaDelay, PageDelay};
pub use fetcher::{FetchError, PageFetcher, ReviewFetcher};
pub use pagination::{
    stop_reason, CrawlOutcome, PaginationEngine, PaginationSettings, StopReason,
};
pub use parser::{parse_review_json, CommandParser, ParseError, ReviewParser};
pub use url::{extract_continuation_token, review_url};
pub use worker::{CrawlWorker, JobOutcome, WorkerSettings};
