//! Shared identity registry
//!
//! A single hash on the key-value store. Field `{name}_{slot}` holds the
//! identity's last-used timestamp (seconds since the epoch). Workers read the
//! whole hash, rank it, and claim a candidate with a compare-and-swap on its
//! timestamp, so two workers cannot both win the same identity from the same
//! observed state.

use chrono::{DateTime, TimeZone, Utc};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::Arc;

use super::{format_timestamp, IdentityResult};
use crate::models::Identity;
use crate::storage::{KvStore, StoreResult};

/// Fixed seed so every seeding of the same config set yields the same slots
const SEED: u64 = 10;

/// Name of the credentials file next to the egress configs
pub const SECRETS_FILE: &str = "secrets";

/// An identity as read from the registry, with its stored timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub identity: Identity,
    raw_last_used: String,
}

/// Registry of egress identities on a [`KvStore`] hash
#[derive(Clone)]
pub struct IdentityRegistry {
    kv: Arc<dyn KvStore>,
    hash: String,
}

impl IdentityRegistry {
    pub fn new(kv: Arc<dyn KvStore>, hash: impl Into<String>) -> Self {
        Self {
            kv,
            hash: hash.into(),
        }
    }

    /// All well-formed entries; malformed fields are skipped with a warning
    pub async fn list(&self) -> StoreResult<Vec<RegistryEntry>> {
        let fields = self.kv.hash_get_all(&self.hash).await?;
        let mut entries: Vec<RegistryEntry> = fields
            .into_iter()
            .filter_map(|(key, raw)| match Identity::from_registry_entry(&key, &raw) {
                Some(identity) => Some(RegistryEntry {
                    identity,
                    raw_last_used: raw,
                }),
                None => {
                    tracing::warn!(hash = %self.hash, field = %key, "Skipping malformed registry entry");
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| a.identity.key().cmp(&b.identity.key()));
        Ok(entries)
    }

    /// Identities only
    pub async fn identities(&self) -> StoreResult<Vec<Identity>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|entry| entry.identity)
            .collect())
    }

    /// Find the entry for an identity key
    pub async fn entry(&self, key: &str) -> StoreResult<Option<RegistryEntry>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|entry| entry.identity.key() == key))
    }

    /// Mark an identity attempted, only if nobody touched it since it was read
    ///
    /// Returns `false` when another worker claimed it first.
    pub async fn claim(&self, entry: &RegistryEntry, now_epoch: f64) -> StoreResult<bool> {
        self.kv
            .hash_compare_and_swap(
                &self.hash,
                &entry.identity.key(),
                Some(&entry.raw_last_used),
                &format_timestamp(now_epoch),
            )
            .await
    }

    /// Refresh an identity's last-used timestamp unconditionally
    pub async fn touch(&self, identity: &Identity, now_epoch: f64) -> StoreResult<()> {
        self.kv
            .hash_set(&self.hash, &identity.key(), &format_timestamp(now_epoch))
            .await
    }

    /// Replace the registry with `names`, spreading preferred slots over the day
    ///
    /// Names are shuffled with a fixed seed, so the assignment is reproducible.
    /// Every identity starts rested.
    pub async fn seed(&self, names: &[String]) -> StoreResult<Vec<Identity>> {
        let identities = seed_identities(names, seed_timestamp());

        self.kv.delete(&self.hash).await?;
        for identity in &identities {
            self.kv
                .hash_set(&self.hash, &identity.key(), &format_timestamp(identity.last_used))
                .await?;
        }

        tracing::info!(hash = %self.hash, count = identities.len(), "Seeded identity registry");
        Ok(identities)
    }

    /// Registry listing, least recently used first
    pub async fn snapshot(&self) -> StoreResult<Vec<Identity>> {
        let mut identities = self.identities().await?;
        identities.sort_by(|a, b| {
            a.last_used
                .partial_cmp(&b.last_used)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(identities)
    }
}

/// Last-used timestamp given to freshly seeded identities (2023-01-01)
fn seed_timestamp() -> f64 {
    Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0)
        .single()
        .map(|at: DateTime<Utc>| at.timestamp() as f64)
        .unwrap_or(0.0)
}

/// Shuffle and assign slots `round(i / n * 24, 1)`
pub fn seed_identities(names: &[String], last_used: f64) -> Vec<Identity> {
    let mut shuffled = names.to_vec();
    shuffled.sort();
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    shuffled.shuffle(&mut rng);

    let count = shuffled.len() as f64;
    shuffled
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let slot = (i as f64 / count * 24.0 * 10.0).round() / 10.0;
            Identity::new(name, slot, last_used)
        })
        .collect()
}

/// Egress config files in `dir` whose names start with one of `countries`
pub async fn discover_identities(dir: &Path, countries: &[String]) -> IdentityResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name == SECRETS_FILE {
            continue;
        }
        if countries.iter().any(|country| name.starts_with(country.as_str())) {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use tempfile::TempDir;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("es-{i:02}.ovpn")).collect()
    }

    #[test]
    fn test_seed_slots_are_evenly_spaced() {
        let identities = seed_identities(&names(4), 0.0);
        let mut slots: Vec<f64> = identities.iter().map(|i| i.preferred_slot).collect();
        slots.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(slots, vec![0.0, 6.0, 12.0, 18.0]);
    }

    #[test]
    fn test_seed_is_deterministic() {
        let first = seed_identities(&names(7), 0.0);
        let mut reversed = names(7);
        reversed.reverse();
        let second = seed_identities(&reversed, 0.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_seed_rounds_to_one_decimal() {
        let identities = seed_identities(&names(7), 0.0);
        for identity in identities {
            let scaled = identity.preferred_slot * 10.0;
            assert!((scaled - scaled.round()).abs() < 1e-9);
            assert!(identity.preferred_slot < 24.0);
        }
    }

    #[tokio::test]
    async fn test_seed_replaces_registry() {
        let kv = Arc::new(MemoryKv::new());
        let registry = IdentityRegistry::new(kv.clone(), "vpns");
        kv.hash_set("vpns", "old.ovpn_3.0", "1.0").await.unwrap();

        registry.seed(&names(3)).await.unwrap();
        let listed = registry.identities().await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|i| i.name.starts_with("es-")));
        assert!(listed.iter().all(|i| i.last_used == seed_timestamp()));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let kv = Arc::new(MemoryKv::new());
        let registry = IdentityRegistry::new(kv, "vpns");
        registry.seed(&names(1)).await.unwrap();

        let entry = registry.list().await.unwrap().remove(0);
        assert!(registry.claim(&entry, 1_700_000_000.0).await.unwrap());
        assert!(!registry.claim(&entry, 1_700_000_001.0).await.unwrap());

        let updated = registry.entry(&entry.identity.key()).await.unwrap().unwrap();
        assert_eq!(updated.identity.last_used, 1_700_000_000.0);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let kv = Arc::new(MemoryKv::new());
        let registry = IdentityRegistry::new(kv.clone(), "vpns");
        kv.hash_set("vpns", "es-01.ovpn_4.0", "1672531200.0").await.unwrap();
        kv.hash_set("vpns", "garbage", "x").await.unwrap();

        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_orders_by_last_used() {
        let kv = Arc::new(MemoryKv::new());
        let registry = IdentityRegistry::new(kv.clone(), "vpns");
        kv.hash_set("vpns", "b.ovpn_1.0", "300.0").await.unwrap();
        kv.hash_set("vpns", "a.ovpn_2.0", "100.0").await.unwrap();

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot[0].name, "a.ovpn");
    }

    #[tokio::test]
    async fn test_discover_identities() {
        let dir = TempDir::new().unwrap();
        for name in ["es-madrid.ovpn", "es-bilbao.ovpn", "pt-lisboa.ovpn", "secrets"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        std::fs::create_dir(dir.path().join("es-subdir")).unwrap();

        let found = discover_identities(dir.path(), &["es".to_string()])
            .await
            .unwrap();
        assert_eq!(found, vec!["es-bilbao.ovpn", "es-madrid.ovpn"]);
    }
}
