// ABOUTME: Writes a starter registry config for subvisor.
// ABOUTME: Workers listed in it are scaffolded as placeholders on first start.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use subvisor_core::Config;

use crate::resolve_config_path;

/// Write the sample registry to `config_path` (or the default location).
pub fn run_init(config_path: Option<PathBuf>, force: bool) -> Result<PathBuf> {
    let path = resolve_config_path(config_path)?;
    write_sample(&path, force)?;

    println!("Config written to {}", path.display());
    println!("Workers that do not exist yet are scaffolded as placeholders on start.");
    println!("\nReady to run: subvisor run");
    Ok(path)
}

fn write_sample(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::sample().save(path)?;
    tracing::info!(path = %path.display(), "Wrote sample registry");
    Ok(())
}
