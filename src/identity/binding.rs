//! Per-worker identity bindings
//!
//! Stored as JSON under `{worker}_current_identity` with an expiry. Rotation
//! overwrites the binding; an idle worker's binding simply expires.

use std::sync::Arc;
use std::time::Duration;

use crate::models::IdentityBinding;
use crate::storage::{KvStore, StoreError, StoreResult};

/// Binding key for a worker
pub fn binding_key(worker: &str) -> String {
    format!("{worker}_current_identity")
}

#[derive(Clone)]
pub struct BindingStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl BindingStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// The worker's unexpired binding, if any
    pub async fn get(&self, worker: &str) -> StoreResult<Option<IdentityBinding>> {
        let key = binding_key(worker);
        match self.kv.get(&key).await? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| StoreError::serialization(&key, e)),
            None => Ok(None),
        }
    }

    /// Write (or overwrite) the worker's binding with a fresh expiry
    pub async fn put(&self, binding: &IdentityBinding) -> StoreResult<()> {
        let key = binding_key(&binding.worker);
        let body = serde_json::to_string(binding).map_err(|e| StoreError::serialization(&key, e))?;
        self.kv.set(&key, &body, Some(self.ttl)).await
    }

    /// Remove the worker's binding
    pub async fn clear(&self, worker: &str) -> StoreResult<()> {
        self.kv.delete(&binding_key(worker)).await?;
        Ok(())
    }
}
