use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use resenha::crawler::{
    CommandParser, CrawlWorker, GammaDelay, PaginationEngine, PaginationSettings, ReviewFetcher,
    WorkerSettings,
};
use resenha::storage::CheckpointStore;

use super::context::{shutdown_signal, AppContext};

const METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Run a crawl worker until Ctrl-C
pub async fn worker(ctx: AppContext, name: String) -> Result<()> {
    let config = &ctx.config;
    let pagination = &config.pagination;

    let fetcher = Arc::new(ReviewFetcher::from_config(pagination).context("Failed to build fetcher")?);
    let parser = Arc::new(
        CommandParser::from_command_line(&pagination.parser_command)
            .context("Parser command is empty")?,
    );
    let delay = Arc::new(
        GammaDelay::new(
            pagination.delay_shape,
            pagination.delay_scale,
            pagination.delay_floor_secs,
        )
        .context("Invalid page delay distribution")?,
    );

    let engine = PaginationEngine::new(
        fetcher,
        parser,
        ctx.archive.clone(),
        ctx.documents.clone(),
        CheckpointStore::new(ctx.kv.clone(), config.storage.checkpoint_ttl()),
        delay,
        PaginationSettings::from(pagination),
    );

    let scheduler = Arc::new(ctx.identity_scheduler()?);
    let settings = WorkerSettings {
        name: name.clone(),
        nothing_works_sleep: config.identity.nothing_works_sleep(),
        error_backoff: Duration::from_secs(5),
        visibility_timeout: config.queue.visibility_timeout(),
        reclaim_interval: config.queue.reclaim_interval(),
    };

    ctx.spawn_metrics_writer(&name, METRICS_INTERVAL);

    let worker = CrawlWorker::new(settings, ctx.crawl.clone(), scheduler.clone(), engine);
    worker.run(shutdown_signal()).await?;

    if let Err(e) = scheduler.release(&name).await {
        tracing::warn!(worker = %name, error = %e, "Failed to release identity on shutdown");
    }
    Ok(())
}
