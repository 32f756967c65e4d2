use anyhow::Result;
use chrono::{DateTime, Utc};

use resenha::quota::CadenceGate;

use super::context::AppContext;
use super::publish::CRAWL_CLASS;
use super::resolver::RESOLVE_CLASS;

/// Print the identity registry, worker bindings, queue depths and cadence overrides
pub async fn status(ctx: AppContext, workers: Vec<String>) -> Result<()> {
    let identities = ctx.registry().snapshot().await?;

    println!("Identity Registry ({})", ctx.config.identity.registry_key);
    println!("==================");
    if identities.is_empty() {
        println!("  (empty, run `resenha seed-identities`)");
    }
    for identity in &identities {
        let last_used = DateTime::<Utc>::from_timestamp(identity.last_used as i64, 0)
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        println!(
            "  {:>5.1}h  {:<40} last used {last_used}",
            identity.preferred_slot, identity.name
        );
    }

    if !workers.is_empty() {
        let bindings = ctx.bindings();
        println!();
        println!("Worker Bindings");
        println!("===============");
        for worker in &workers {
            match bindings.get(worker).await? {
                Some(binding) => println!(
                    "  {worker:<20} {} (pid {}, since {})",
                    binding.identity_key,
                    binding.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    binding.bound_at.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("  {worker:<20} (unbound)"),
            }
        }
    }

    println!();
    println!("Queues");
    println!("======");
    for (name, depth) in [
        (ctx.crawl.queue().name().to_string(), ctx.crawl.len().await),
        (ctx.resolve.queue().name().to_string(), ctx.resolve.len().await),
    ] {
        match depth {
            Ok(depth) => println!("  {name:<20} {depth} ready"),
            Err(e) => println!("  {name:<20} unavailable ({e})"),
        }
    }

    let gate = CadenceGate::new(ctx.kv.clone());
    println!();
    println!("Producer Cadence");
    println!("================");
    for class in [CRAWL_CLASS, RESOLVE_CLASS] {
        match gate.status(class).await? {
            Some(state) => println!(
                "  {class:<20} reduced to every {}s until {}",
                state.interval_secs, state.until
            ),
            None => println!("  {class:<20} normal"),
        }
    }
    Ok(())
}
