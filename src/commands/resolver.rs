use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use resenha::quota::{CadenceGate, QuotaGovernor, QuotaSettings, SerpApiResolver};

use super::context::{shutdown_signal, AppContext};

/// Job class slowed down when the search quota runs out
pub const RESOLVE_CLASS: &str = "serp_queue";

/// Run a resolution worker until Ctrl-C
pub async fn resolver(ctx: AppContext, name: String) -> Result<()> {
    let quota = &ctx.config.quota;
    let resolver =
        Arc::new(SerpApiResolver::from_config(quota).context("Failed to build search API client")?);

    ctx.spawn_metrics_writer(&name, Duration::from_secs(15));

    let governor = QuotaGovernor::new(
        QuotaSettings::from_config(name, RESOLVE_CLASS, quota, &ctx.config.queue),
        ctx.resolve.clone(),
        resolver,
        ctx.documents.clone(),
        CadenceGate::new(ctx.kv.clone()),
    );
    governor.run(shutdown_signal()).await?;
    Ok(())
}
