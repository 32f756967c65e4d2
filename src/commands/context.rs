//! Shared wiring for the long-running commands

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use resenha::config::Config;
use resenha::identity::{
    BindingStore, IdentityRegistry, IdentityScheduler, NetworkProbe, OpenVpnLauncher,
    SchedulerSettings,
};
use resenha::metrics;
use resenha::models::{CrawlRequest, ResolveRequest};
use resenha::queue::{Exchange, JobQueue, RedisQueue, TypedQueue};
use resenha::storage::{
    DocumentStore, JsonlDocumentStore, KvPageArchive, KvStore, PageArchive, RedisKv,
};

/// Stores and queues built from one [`Config`]
pub struct AppContext {
    pub config: Config,
    pub kv: Arc<dyn KvStore>,
    pub archive: Arc<dyn PageArchive>,
    pub documents: Arc<dyn DocumentStore>,
    pub crawl: TypedQueue<CrawlRequest>,
    pub resolve: TypedQueue<ResolveRequest>,
}

impl AppContext {
    pub async fn connect(config: Config) -> Result<Self> {
        let redis = RedisKv::connect(&config.redis)
            .await
            .context("Failed to connect to Redis")?;
        let pool = redis.pool().clone();
        let kv: Arc<dyn KvStore> = Arc::new(redis);

        let archive: Arc<dyn PageArchive> =
            Arc::new(KvPageArchive::new(kv.clone(), config.storage.archive_ttl()));
        let documents: Arc<dyn DocumentStore> = Arc::new(
            JsonlDocumentStore::open(&config.storage.output_dir)
                .await
                .context("Failed to open document store")?,
        );

        let q = &config.queue;
        let crawl_queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
            pool.clone(),
            &config.redis,
            q.crawl_queue.clone(),
            q.crawl_capacity,
            q.poll_interval(),
        ));
        let mut crawl_exchange = Exchange::topic(q.crawl_exchange.clone());
        crawl_exchange.bind(q.crawl_binding.clone(), crawl_queue.clone());

        let resolve_queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
            pool,
            &config.redis,
            q.resolve_queue.clone(),
            q.resolve_capacity,
            q.poll_interval(),
        ));
        let mut resolve_exchange = Exchange::direct(q.resolve_exchange.clone());
        resolve_exchange.bind(q.resolve_queue.clone(), resolve_queue.clone());

        Ok(Self {
            crawl: TypedQueue::new(Arc::new(crawl_exchange), crawl_queue),
            resolve: TypedQueue::new(Arc::new(resolve_exchange), resolve_queue),
            kv,
            archive,
            documents,
            config,
        })
    }

    pub fn registry(&self) -> IdentityRegistry {
        IdentityRegistry::new(self.kv.clone(), self.config.identity.registry_key.clone())
    }

    pub fn bindings(&self) -> BindingStore {
        BindingStore::new(self.kv.clone(), self.config.identity.binding_ttl())
    }

    pub fn identity_scheduler(&self) -> Result<IdentityScheduler> {
        let identity = &self.config.identity;
        let launcher = Arc::new(OpenVpnLauncher::new(
            identity.launcher_binary.clone(),
            identity.config_dir.clone(),
        ));
        let probe = Arc::new(
            NetworkProbe::new(
                identity.probe_urls.clone(),
                identity.probe_timeout(),
                self.kv.clone(),
                self.archive.clone(),
                self.documents.clone(),
            )
            .context("Failed to build liveness probe")?,
        );

        Ok(IdentityScheduler::new(
            self.registry(),
            self.bindings(),
            launcher,
            probe,
            SchedulerSettings::from(identity),
        ))
    }

    /// Periodically write the metrics registry as a Prometheus text file
    pub fn spawn_metrics_writer(&self, worker: &str, interval: Duration) {
        if let Err(e) = metrics::init_metrics() {
            tracing::warn!(error = %e, "Failed to initialize metrics");
            return;
        }

        let path: PathBuf = self
            .config
            .storage
            .output_dir
            .join("metrics")
            .join(format!("{worker}.prom"));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = write_metrics(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics");
                }
            }
        });
    }
}

async fn write_metrics(path: &std::path::Path) -> Result<()> {
    let body = metrics::encode_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Resolves on Ctrl-C
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
