#![forbid(unsafe_code)]

//! One-shot eviction pass over the download directory. Meant for cron when
//! the server's own sweeper is disabled or the server is down.

use std::{path::PathBuf, time::SystemTime};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tunecache::{
    artifact::{ArtifactStore, SweepReport},
    config::{Settings, SettingsOverrides, resolve_settings},
    logging::init_logging,
    security::ensure_not_root,
};

#[derive(Debug, Parser)]
#[command(name = "sweep_cache", about = "Remove expired and undersized cached audio")]
struct SweepArgs {
    /// Artifact directory (DOWNLOAD_DIR).
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_logging();
    ensure_not_root("sweep_cache")?;
    let args = SweepArgs::parse();
    let settings = resolve_settings(SettingsOverrides {
        download_dir: args.download_dir,
        env_path: args.env_file,
        ..SettingsOverrides::default()
    })?;

    let report = run_sweep(&settings, SystemTime::now())?;
    println!(
        "Swept {}: {} expired, {} undersized, {} stale staging, {} errors",
        settings.download_dir.display(),
        report.expired,
        report.undersized,
        report.stale_staging,
        report.errors
    );
    Ok(())
}

/// Nothing is in flight from this process, so no staging dir is protected
/// beyond the retention window.
fn run_sweep(settings: &Settings, now: SystemTime) -> Result<SweepReport> {
    let store = ArtifactStore::new(&settings.download_dir, settings.min_file_size);
    if !store.root().exists() {
        info!("{} does not exist, nothing to sweep", store.root().display());
        return Ok(SweepReport::default());
    }
    store
        .prepare()
        .with_context(|| format!("preparing {}", store.root().display()))?;
    Ok(store.sweep(now, settings.retention, |_| false))
}
