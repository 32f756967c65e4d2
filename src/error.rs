//! Unified error handling for the resenha crate
//!
//! Every component owns a small `thiserror` enum describing its own failure
//! modes. This module folds them into a single [`Error`] so the worker loop can
//! decide, in one place, whether a failure means "requeue and try later",
//! "drop the message", or "back off globally".
//!
//! # Architecture
//!
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use resenha::error::{Error, ErrorCategory};
//!
//! fn handle_error(err: Error) {
//!     match err.category() {
//!         ErrorCategory::Identity => tracing::warn!("identity pool exhausted: {err}"),
//!         _ if err.is_recoverable() => tracing::warn!("will retry: {err}"),
//!         _ => tracing::error!("dropping job: {err}"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::crawler::fetcher::FetchError;
pub use crate::crawler::parser::ParseError;
pub use crate::identity::IdentityError;
pub use crate::models::JobError;
pub use crate::queue::QueueError;
pub use crate::quota::QuotaError;
pub use crate::storage::StoreError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, unexpected status)
    Network,
    /// Parsing and job-contract errors
    Parsing,
    /// Checkpoint, archive and document store errors
    Storage,
    /// Broker errors
    Queue,
    /// Egress identity errors
    Identity,
    /// Paid API quota errors
    Quota,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Parsing => "parsing",
            Self::Storage => "storage",
            Self::Queue => "queue",
            Self::Identity => "identity",
            Self::Quota => "quota",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the resenha crate
#[derive(Error, Debug)]
pub enum Error {
    /// Page fetch errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Parser collaborator rejected the page
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Store errors (checkpoint, archive, documents, key-value)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Identity scheduling errors
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Job contract violations
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Quota governance errors
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other { context: String },
}

impl Error {
    /// Check if this error is recoverable by redelivering the job later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            Self::Parse(_) => true,
            Self::Store(_) => true,
            Self::Queue(_) => true,
            Self::Identity(_) => true,
            Self::Job(_) => false,
            Self::Quota(_) => false,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Parse(_) | Self::Job(_) | Self::Json(_) => ErrorCategory::Parsing,
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Queue(_) => ErrorCategory::Queue,
            Self::Identity(_) => ErrorCategory::Identity,
            Self::Quota(_) => ErrorCategory::Quota,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
