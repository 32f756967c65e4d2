//! Key-value store port
//!
//! A deliberately small contract: plain keys with optional expiry, hashes of
//! string fields, and compare-and-swap on both. Everything that needs an atomic
//! read-modify-write (checkpoint advance, marking an identity as attempted)
//! goes through the CAS operations instead of a separate read and write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use super::StoreResult;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a plain key
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a plain key, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove a key of any type; returns whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Write `new` only if the current value equals `expected`
    ///
    /// `expected == None` means "only if the key is absent".
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Read every field of a hash (empty if the hash does not exist)
    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, String>>;

    /// Write one field of a hash
    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Write a hash field only if its current value equals `expected`
    async fn hash_compare_and_swap(
        &self,
        hash: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool>;

    /// Check that the backend answers
    async fn ping(&self) -> StoreResult<()>;
}
