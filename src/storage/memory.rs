//! In-process key-value store with expiry
//!
//! Used by tests and by single-process deployments. Expired entries are
//! dropped lazily on access.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{KvStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Plain(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Expiry-aware in-memory [`KvStore`]
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend; every call fails while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::backend("memory store is offline"))
        } else {
            Ok(())
        }
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn plain(entry: Option<&mut Entry>, key: &str) -> StoreResult<Option<String>> {
        match entry.map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Plain(v)) => Ok(Some(v.clone())),
            Some(Value::Hash(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        Self::plain(Self::live(&mut entries, key), key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Plain(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        let existed = Self::live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        let current = Self::plain(Self::live(&mut entries, key), key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Plain(new.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, String>> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, hash).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(Value::Plain(_)) => Err(StoreError::WrongType {
                key: hash.to_string(),
            }),
        }
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> StoreResult<()> {
        self.hash_compare_and_swap_inner(hash, field, None, value, false)
            .await
            .map(|_| ())
    }

    async fn hash_compare_and_swap(
        &self,
        hash: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool> {
        self.hash_compare_and_swap_inner(hash, field, expected, new, true)
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }
}

impl MemoryKv {
    async fn hash_compare_and_swap_inner(
        &self,
        hash: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
        check: bool,
    ) -> StoreResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        if Self::live(&mut entries, hash).is_none() {
            entries.insert(
                hash.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        let fields = match entries.get_mut(hash).map(|e| &mut e.value) {
            Some(Value::Hash(fields)) => fields,
            _ => {
                return Err(StoreError::WrongType {
                    key: hash.to_string(),
                })
            }
        };
        if check && fields.get(field).map(String::as_str) != expected {
            return Ok(false);
        }
        fields.insert(field.to_string(), new.to_string());
        Ok(true)
    }
}
