//! Egress identity rotation
//!
//! Each worker sends its traffic through one provisioned egress identity at a
//! time. The [`IdentityScheduler`] keeps that identity fresh: it reuses a live
//! binding, and otherwise picks the rested identity whose preferred time slot
//! is closest to the current hour, starts it and checks it before binding.
//!
//! # Components
//!
//! - [`affinity`] - time-of-day scoring and candidate ranking
//! - [`registry`] - shared identity registry on the key-value store
//! - [`binding`] - per-worker bindings with expiry
//! - [`launcher`] - egress process control
//! - [`probe`] - reachability checks through the egress
//! - [`scheduler`] - `ensure_fresh`

pub mod affinity;
pub mod binding;
pub mod launcher;
pub mod probe;
pub mod registry;
pub mod scheduler;

use thiserror::Error;

use crate::storage::StoreError;

pub use affinity::{affinity, hour_of_day, rank_candidates};
pub use binding::BindingStore;
pub use launcher::{EgressHandle, EgressLauncher, OpenVpnLauncher};
pub use probe::{LivenessProbe, NetworkProbe};
pub use registry::{discover_identities, IdentityRegistry, RegistryEntry};
pub use scheduler::{IdentityScheduler, SchedulerSettings};

/// Identity scheduling errors
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Every candidate was on cooldown or failed to come up
    #[error("No egress identity available for worker '{worker}' after {attempts} attempts")]
    NoIdentityAvailable { worker: String, attempts: usize },

    /// The egress process could not be started or stopped
    #[error("Egress process error for '{identity}': {reason}")]
    Launch { identity: String, reason: String },

    /// Reachability check failed
    #[error("Liveness probe failed: {0}")]
    Probe(String),

    /// Registry or binding store failure
    #[error("Identity store error: {0}")]
    Store(#[from] StoreError),

    /// Reading egress configs from disk
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IdentityError {
    pub fn launch(identity: impl Into<String>, reason: impl ToString) -> Self {
        Self::Launch {
            identity: identity.into(),
            reason: reason.to_string(),
        }
    }

    pub fn probe(reason: impl Into<String>) -> Self {
        Self::Probe(reason.into())
    }
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// Seconds since the Unix epoch with millisecond precision
pub fn epoch_seconds(at: chrono::DateTime<chrono::Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Registry encoding of a timestamp
pub fn format_timestamp(seconds: f64) -> String {
    format!("{seconds:.3}")
}
