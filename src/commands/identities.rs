use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use resenha::identity::discover_identities;

use super::context::AppContext;

/// Replace the identity registry with the egress configs found in `dir`
pub async fn seed_identities(ctx: AppContext, dir: Option<PathBuf>) -> Result<()> {
    let identity = &ctx.config.identity;
    let dir = dir.unwrap_or_else(|| identity.config_dir.clone());

    let names = discover_identities(&dir, &identity.countries)
        .await
        .with_context(|| format!("Failed to list egress configs in {}", dir.display()))?;
    if names.is_empty() {
        bail!(
            "No egress configs matching {:?} found in {}",
            identity.countries,
            dir.display()
        );
    }

    let seeded = ctx.registry().seed(&names).await?;

    println!("Seeded {} identities into '{}'", seeded.len(), identity.registry_key);
    for entry in &seeded {
        println!("  {:>5.1}h  {}", entry.preferred_slot, entry.name);
    }
    Ok(())
}
