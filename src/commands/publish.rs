use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::ValueEnum;
use std::path::Path;

use resenha::metrics;
use resenha::models::{CrawlRequest, ResolveRequest, WireMessage};
use resenha::queue::{PublishOutcome, TypedQueue};
use resenha::quota::CadenceGate;

use super::context::AppContext;
use super::resolver::RESOLVE_CLASS;

/// Job class gating crawl producer runs
pub const CRAWL_CLASS: &str = "gmaps_scrape";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueKind {
    Crawl,
    Resolve,
}

/// Counts for one producer run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    pub read: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub invalid: usize,
}

/// Publish one batch of jobs read from a JSON-lines file
pub async fn publish(
    ctx: AppContext,
    queue: QueueKind,
    input: &Path,
    limit: Option<usize>,
) -> Result<()> {
    let (class, batch_size) = match queue {
        QueueKind::Crawl => (CRAWL_CLASS, ctx.config.queue.crawl_batch_size),
        QueueKind::Resolve => (RESOLVE_CLASS, ctx.config.queue.resolve_batch_size),
    };

    let gate = CadenceGate::new(ctx.kv.clone());
    if !gate.should_publish(class, Utc::now()).await? {
        println!("Producer run skipped: {class} cadence is reduced");
        return Ok(());
    }

    let content = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read job file: {}", input.display()))?;
    let limit = limit.unwrap_or(batch_size);

    let summary = match queue {
        QueueKind::Crawl => publish_batch::<CrawlRequest>(&ctx.crawl, &content, limit).await?,
        QueueKind::Resolve => {
            publish_batch::<ResolveRequest>(&ctx.resolve, &content, limit).await?
        }
    };

    println!("Publish Summary");
    println!("===============");
    println!("  Class:    {class}");
    println!("  Read:     {}", summary.read);
    println!("  Accepted: {}", summary.accepted);
    println!("  Rejected: {}", summary.rejected);
    println!("  Invalid:  {}", summary.invalid);
    Ok(())
}

/// Publish up to `limit` documents; rejected publishes are logged and dropped
pub async fn publish_batch<T: WireMessage>(
    queue: &TypedQueue<T>,
    content: &str,
    limit: usize,
) -> Result<PublishSummary> {
    if limit == 0 {
        bail!("Batch limit must be greater than 0");
    }

    let mut summary = PublishSummary::default();
    let queue_name = queue.queue().name().to_string();

    for (line_no, line) in content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .take(limit)
    {
        summary.read += 1;
        let message = match T::from_document(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(line = line_no + 1, error = %e, "Skipping invalid job document");
                summary.invalid += 1;
                continue;
            }
        };

        match queue.publish(&message).await? {
            PublishOutcome::Accepted => summary.accepted += 1,
            PublishOutcome::Rejected => {
                tracing::warn!(queue = %queue_name, line = line_no + 1, "Queue at capacity, job dropped");
                summary.rejected += 1;
            }
        }
    }

    if let Ok(depth) = queue.len().await {
        metrics::set_queue_depth(&queue_name, depth);
    }
    tracing::info!(
        queue = %queue_name,
        accepted = summary.accepted,
        rejected = summary.rejected,
        invalid = summary.invalid,
        "Producer batch published"
    );
    Ok(summary)
}
