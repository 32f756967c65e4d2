//! Identity lifecycle per worker
//!
//! `ensure_fresh` either confirms the worker's current binding is alive or
//! rotates to a new identity:
//!
//! 1. A bound identity whose process runs and whose probe passes is kept.
//! 2. Otherwise the old process is stopped and the binding cleared.
//! 3. Rested identities are ranked by time-of-day affinity.
//! 4. The best one is claimed (last-used updated atomically), started and
//!    probed. Failures move on to the next candidate, up to a bounded number
//!    of attempts.
//! 5. If nothing comes up the caller gets `NoIdentityAvailable`.

use chrono::{DateTime, Local, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::affinity::{hour_of_day, rank_candidates};
use super::binding::BindingStore;
use super::launcher::{EgressHandle, EgressLauncher};
use super::probe::LivenessProbe;
use super::registry::IdentityRegistry;
use super::{epoch_seconds, IdentityError, IdentityResult};
use crate::config::IdentityConfig;
use crate::metrics;
use crate::models::{Identity, IdentityBinding};

/// Scheduling knobs, usually taken from [`IdentityConfig`]
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub cooldown: Duration,
    pub sigma_hours: f64,
    pub max_attempts: usize,
    pub settle: Duration,
}

impl From<&IdentityConfig> for SchedulerSettings {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            sigma_hours: config.affinity_sigma_hours,
            max_attempts: config.max_attempts,
            settle: config.settle(),
        }
    }
}

/// Assigns and health-checks egress identities for workers
pub struct IdentityScheduler {
    registry: IdentityRegistry,
    bindings: BindingStore,
    launcher: Arc<dyn EgressLauncher>,
    probe: Arc<dyn LivenessProbe>,
    settings: SchedulerSettings,
    handles: Mutex<HashMap<String, EgressHandle>>,
}

impl IdentityScheduler {
    pub fn new(
        registry: IdentityRegistry,
        bindings: BindingStore,
        launcher: Arc<dyn EgressLauncher>,
        probe: Arc<dyn LivenessProbe>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            bindings,
            launcher,
            probe,
            settings,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `worker` has a live identity, rotating if needed
    pub async fn ensure_fresh(&self, worker: &str) -> IdentityResult<IdentityBinding> {
        let now = Local::now();
        self.ensure_fresh_at(worker, now.with_timezone(&Utc), hour_of_day(&now))
            .await
    }

    /// [`ensure_fresh`](Self::ensure_fresh) at an explicit instant and local hour
    pub async fn ensure_fresh_at(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        hour: f64,
    ) -> IdentityResult<IdentityBinding> {
        if let Some(binding) = self.bindings.get(worker).await? {
            let handle = self.handle_for(&binding).await;
            if self.is_live(&handle).await {
                tracing::debug!(worker, identity = %binding.identity_key, "Identity still fresh");
                return Ok(binding);
            }
            tracing::warn!(worker, identity = %binding.identity_key, "Bound identity failed liveness, rotating");
        }

        self.release(worker).await?;
        self.rotate(worker, now, hour).await
    }

    /// Stop the worker's egress process and clear its binding
    pub async fn release(&self, worker: &str) -> IdentityResult<()> {
        let tracked = self.handles.lock().await.remove(worker);
        let handle = match tracked {
            Some(handle) => Some(handle),
            None => self
                .bindings
                .get(worker)
                .await?
                .map(|binding| EgressHandle {
                    identity_name: binding.identity_name,
                    pid: binding.pid,
                }),
        };

        if let Some(handle) = handle {
            if let Err(e) = self.launcher.stop(&handle).await {
                tracing::warn!(worker, error = %e, "Failed to stop egress process");
            }
        }

        self.bindings.clear(worker).await?;
        Ok(())
    }

    async fn rotate(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        hour: f64,
    ) -> IdentityResult<IdentityBinding> {
        let now_epoch = epoch_seconds(now);
        let cooldown = self.settings.cooldown.as_secs_f64();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempts = 0;

        while attempts < self.settings.max_attempts {
            let entries = self.registry.list().await?;
            let identities: Vec<Identity> = entries
                .iter()
                .map(|entry| entry.identity.clone())
                .filter(|identity| !excluded.contains(&identity.key()))
                .collect();

            let ranked = rank_candidates(
                &identities,
                now_epoch,
                hour,
                cooldown,
                self.settings.sigma_hours,
            );
            let Some(candidate) = ranked.into_iter().next() else {
                tracing::warn!(worker, attempts, "No rested identity left");
                break;
            };
            let key = candidate.key();
            excluded.insert(key.clone());

            let Some(entry) = entries.iter().find(|entry| entry.identity.key() == key) else {
                continue;
            };
            if !self.registry.claim(entry, now_epoch).await? {
                tracing::debug!(worker, identity = %key, "Identity claimed by another worker");
                continue;
            }

            attempts += 1;
            match self.activate(worker, &candidate, now).await {
                Ok(binding) => {
                    metrics::record_identity_activation(worker, "bound");
                    return Ok(binding);
                }
                Err(e) => {
                    metrics::record_identity_activation(worker, "failed");
                    tracing::warn!(worker, identity = %key, attempt = attempts, error = %e, "Identity activation failed");
                }
            }
        }

        metrics::record_identity_activation(worker, "exhausted");
        Err(IdentityError::NoIdentityAvailable {
            worker: worker.to_string(),
            attempts,
        })
    }

    async fn activate(
        &self,
        worker: &str,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> IdentityResult<IdentityBinding> {
        let handle = self.launcher.start(identity).await?;

        // Nothing past this point may leave the process running untracked.
        let binding = match self.verify_and_bind(worker, identity, &handle, now).await {
            Ok(binding) => binding,
            Err(e) => {
                self.stop_quietly(&handle).await;
                return Err(e);
            }
        };
        self.handles
            .lock()
            .await
            .insert(worker.to_string(), handle);

        tracing::info!(worker, identity = %binding.identity_key, pid = ?binding.pid, "Identity bound");
        Ok(binding)
    }

    async fn verify_and_bind(
        &self,
        worker: &str,
        identity: &Identity,
        handle: &EgressHandle,
        now: DateTime<Utc>,
    ) -> IdentityResult<IdentityBinding> {
        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }

        if !self.launcher.is_running(handle).await {
            return Err(IdentityError::launch(&identity.name, "process exited after start"));
        }
        self.probe.check().await?;

        self.registry.touch(identity, epoch_seconds(Utc::now())).await?;

        let binding = IdentityBinding {
            worker: worker.to_string(),
            identity_key: identity.key(),
            identity_name: identity.name.clone(),
            bound_at: now,
            pid: handle.pid,
        };
        self.bindings.put(&binding).await?;
        Ok(binding)
    }

    async fn handle_for(&self, binding: &IdentityBinding) -> EgressHandle {
        match self.handles.lock().await.get(&binding.worker) {
            Some(handle) if handle.identity_name == binding.identity_name => handle.clone(),
            _ => EgressHandle {
                identity_name: binding.identity_name.clone(),
                pid: binding.pid,
            },
        }
    }

    async fn is_live(&self, handle: &EgressHandle) -> bool {
        if !self.launcher.is_running(handle).await {
            return false;
        }
        match self.probe.check().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(identity = %handle.identity_name, error = %e, "Liveness probe failed");
                false
            }
        }
    }

    async fn stop_quietly(&self, handle: &EgressHandle) {
        if let Err(e) = self.launcher.stop(handle).await {
            tracing::warn!(identity = %handle.identity_name, error = %e, "Failed to stop egress process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KvStore, MemoryKv, StoreError, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeLauncher {
        starts: AtomicUsize,
        stops: AtomicUsize,
        broken: Vec<String>,
    }

    #[async_trait]
    impl EgressLauncher for FakeLauncher {
        async fn start(&self, identity: &Identity) -> IdentityResult<EgressHandle> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            if self.broken.contains(&identity.name) {
                return Err(IdentityError::launch(&identity.name, "bad config"));
            }
            Ok(EgressHandle {
                identity_name: identity.name.clone(),
                pid: Some(1000 + n as u32),
            })
        }

        async fn stop(&self, _handle: &EgressHandle) -> IdentityResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self, _handle: &EgressHandle) -> bool {
            true
        }
    }

    struct FakeProbe {
        healthy: AtomicBool,
        fail_next: AtomicUsize,
    }

    #[async_trait]
    impl LivenessProbe for FakeProbe {
        async fn check(&self) -> IdentityResult<()> {
            let one_shot = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if one_shot || !self.healthy.load(Ordering::SeqCst) {
                Err(IdentityError::probe("unreachable"))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        kv: Arc<MemoryKv>,
        launcher: Arc<FakeLauncher>,
        probe: Arc<FakeProbe>,
        scheduler: IdentityScheduler,
    }

    const DAY: f64 = 86_400.0;

    async fn fixture(entries: &[(&str, f64)], broken: &[&str], now: DateTime<Utc>) -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        for (key, age_days) in entries {
            kv.hash_set(
                "vpns",
                key,
                &format!("{:.3}", epoch_seconds(now) - age_days * DAY),
            )
            .await
            .unwrap();
        }

        let launcher = Arc::new(FakeLauncher {
            broken: broken.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        let probe = Arc::new(FakeProbe {
            healthy: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
        });
        let scheduler = IdentityScheduler::new(
            IdentityRegistry::new(kv.clone(), "vpns"),
            BindingStore::new(kv.clone(), Duration::from_secs(3600)),
            launcher.clone(),
            probe.clone(),
            SchedulerSettings {
                cooldown: Duration::from_secs(86_400),
                sigma_hours: 2.0,
                max_attempts: 5,
                settle: Duration::ZERO,
            },
        );

        Fixture {
            kv,
            launcher,
            probe,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_picks_best_affinity() {
        let now = Utc::now();
        let f = fixture(&[("far.ovpn_22.0", 3.0), ("near.ovpn_10.0", 3.0)], &[], now).await;

        let binding = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();
        assert_eq!(binding.identity_name, "near.ovpn");
        assert_eq!(f.launcher.starts.load(Ordering::SeqCst), 1);
        assert!(f.kv.get("w1_current_identity").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_call_reuses_binding() {
        let now = Utc::now();
        let f = fixture(&[("a.ovpn_8.0", 3.0), ("b.ovpn_9.0", 3.0)], &[], now).await;

        let first = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();
        let registry_before = f.kv.hash_get_all("vpns").await.unwrap();

        let second = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.launcher.starts.load(Ordering::SeqCst), 1);
        assert_eq!(f.kv.hash_get_all("vpns").await.unwrap(), registry_before);
    }

    #[tokio::test]
    async fn test_never_selects_identity_on_cooldown() {
        let now = Utc::now();
        let f = fixture(&[("used.ovpn_8.0", 0.5), ("rested.ovpn_20.0", 2.0)], &[], now).await;

        let binding = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();
        assert_eq!(binding.identity_name, "rested.ovpn");
    }

    #[tokio::test]
    async fn test_failed_candidate_falls_through() {
        let now = Utc::now();
        let f = fixture(
            &[("broken.ovpn_8.0", 3.0), ("backup.ovpn_12.0", 3.0)],
            &["broken.ovpn"],
            now,
        )
        .await;

        let binding = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();
        assert_eq!(binding.identity_name, "backup.ovpn");
        assert_eq!(f.launcher.starts.load(Ordering::SeqCst), 2);

        // The failed identity was marked attempted and is now cooling down.
        let broken = f
            .scheduler
            .registry
            .entry("broken.ovpn_8.0")
            .await
            .unwrap()
            .unwrap();
        assert!(epoch_seconds(now) - broken.identity.last_used < 1.0);
    }

    #[tokio::test]
    async fn test_exhaustion_raises_no_identity_available() {
        let now = Utc::now();
        let f = fixture(&[("a.ovpn_8.0", 3.0), ("b.ovpn_9.0", 0.1)], &[], now).await;
        f.probe.healthy.store(false, Ordering::SeqCst);

        let err = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap_err();
        match err {
            IdentityError::NoIdentityAvailable { worker, attempts } => {
                assert_eq!(worker, "w1");
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.kv.get("w1_current_identity").await.unwrap().is_none());
        assert_eq!(f.launcher.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_binding_rotates() {
        let now = Utc::now();
        let f = fixture(&[("a.ovpn_8.0", 3.0), ("b.ovpn_9.0", 3.0)], &[], now).await;
        let first = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();
        assert_eq!(first.identity_name, "a.ovpn");

        f.probe.fail_next.store(1, Ordering::SeqCst);
        let rotated = f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();
        assert_eq!(rotated.identity_name, "b.ovpn");
        assert_eq!(f.launcher.stops.load(Ordering::SeqCst), 1);
        assert_eq!(f.launcher.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_clears_binding() {
        let now = Utc::now();
        let f = fixture(&[("a.ovpn_8.0", 3.0)], &[], now).await;
        f.scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap();

        f.scheduler.release("w1").await.unwrap();
        assert!(f.kv.get("w1_current_identity").await.unwrap().is_none());
        assert_eq!(f.launcher.stops.load(Ordering::SeqCst), 1);
    }

    /// Plain writes fail; hash writes (the registry) still work
    struct ReadOnlyPlainKv(Arc<MemoryKv>);

    #[async_trait]
    impl KvStore for ReadOnlyPlainKv {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
            Err(StoreError::backend("writes rejected"))
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.0.delete(key).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            new: &str,
            ttl: Option<Duration>,
        ) -> StoreResult<bool> {
            self.0.compare_and_swap(key, expected, new, ttl).await
        }

        async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, String>> {
            self.0.hash_get_all(hash).await
        }

        async fn hash_set(&self, hash: &str, field: &str, value: &str) -> StoreResult<()> {
            self.0.hash_set(hash, field, value).await
        }

        async fn hash_compare_and_swap(
            &self,
            hash: &str,
            field: &str,
            expected: Option<&str>,
            new: &str,
        ) -> StoreResult<bool> {
            self.0.hash_compare_and_swap(hash, field, expected, new).await
        }

        async fn ping(&self) -> StoreResult<()> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_binding_write_failure_stops_started_process() {
        let now = Utc::now();
        let f = fixture(&[("a.ovpn_8.0", 3.0), ("b.ovpn_9.0", 3.0)], &[], now).await;
        let kv: Arc<dyn KvStore> = Arc::new(ReadOnlyPlainKv(f.kv.clone()));
        let scheduler = IdentityScheduler::new(
            IdentityRegistry::new(kv.clone(), "vpns"),
            BindingStore::new(kv, Duration::from_secs(3600)),
            f.launcher.clone(),
            f.probe.clone(),
            SchedulerSettings {
                cooldown: Duration::from_secs(86_400),
                sigma_hours: 2.0,
                max_attempts: 5,
                settle: Duration::ZERO,
            },
        );

        let err = scheduler.ensure_fresh_at("w1", now, 8.0).await.unwrap_err();
        assert!(matches!(
            err,
            IdentityError::NoIdentityAvailable { attempts: 2, .. }
        ));
        assert_eq!(f.launcher.starts.load(Ordering::SeqCst), 2);
        assert_eq!(f.launcher.stops.load(Ordering::SeqCst), 2);
        assert!(scheduler.handles.lock().await.is_empty());
    }
}
