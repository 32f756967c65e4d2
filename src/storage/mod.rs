//! Storage ports and adapters
//!
//! The crawler keeps three kinds of state outside the process:
//!
//! - small keyed values with expiry (checkpoints, worker bindings, the identity
//!   registry, producer cadence overrides), behind [`KvStore`];
//! - raw pages with a bounded lifetime, behind [`PageArchive`];
//! - parsed reviews and per-place bookkeeping, behind [`DocumentStore`].
//!
//! Each port has an in-memory adapter for tests and single-process runs, and a
//! production adapter ([`RedisKv`], [`KvPageArchive`], [`JsonlDocumentStore`]).

pub mod archive;
pub mod checkpoint;
pub mod documents;
pub mod kv;
pub mod memory;
pub mod redis;

use thiserror::Error;

pub use archive::{KvPageArchive, PageArchive};
pub use checkpoint::CheckpointStore;
pub use documents::{DocumentStore, JsonlDocumentStore, MemoryDocumentStore, StoredReviews};
pub use kv::KvStore;
pub use memory::MemoryKv;
pub use self::redis::{RedisConfig, RedisKv};

/// Errors raised by storage adapters
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend unavailable or command failed
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Stored value could not be encoded or decoded
    #[error("Serialization error for '{key}': {reason}")]
    Serialization { key: String, reason: String },

    /// Key holds a value of another type (string vs hash)
    #[error("Key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    /// A checkpoint write would move progress backwards
    #[error("Checkpoint '{key}' is at page {current}, refusing to write page {attempted}")]
    CheckpointRegression {
        key: String,
        current: u32,
        attempted: u32,
    },

    /// A checkpoint write lost a race against another writer
    #[error("Checkpoint '{key}' changed concurrently")]
    CheckpointConflict { key: String },

    /// File-backed adapters
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn backend(msg: impl ToString) -> Self {
        Self::Backend(msg.to_string())
    }

    pub fn serialization(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Serialization {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
