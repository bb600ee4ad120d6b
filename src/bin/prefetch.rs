#![forbid(unsafe_code)]

//! Warms the cache for a list of content ids, optionally archiving each one
//! to the configured channel. Waits for every fetch to finish regardless of
//! the HTTP wait window.

use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{error, info, warn};
use tunecache::{
    archive::{ChannelArchiver, HandleCache, TelegramUploader},
    artifact::CachedArtifact,
    config::{SettingsOverrides, resolve_settings},
    coordinator::{DownloadCoordinator, Obtained},
    error::CoordinatorResult,
    logging::init_logging,
    security::{ContentId, ensure_not_root},
};

#[derive(Debug, Parser)]
#[command(name = "prefetch", about = "Fetch audio into the cache ahead of requests")]
struct PrefetchArgs {
    /// Content ids to fetch.
    #[arg(required = true)]
    ids: Vec<String>,
    /// Artifact directory (DOWNLOAD_DIR).
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Cookie file or directory of cookie files (COOKIES_PATH).
    #[arg(long)]
    cookies: Option<PathBuf>,
    /// yt-dlp executable (YTDLP_BIN).
    #[arg(long = "yt-dlp")]
    ytdlp: Option<PathBuf>,
    /// Upload each fetched file to the archive channel as well.
    #[arg(long)]
    archive: bool,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    ensure_not_root("prefetch")?;
    let args = PrefetchArgs::parse();

    let ids = unique_ids(&args.ids)?;
    let settings = resolve_settings(SettingsOverrides {
        download_dir: args.download_dir,
        cookies_path: args.cookies,
        ytdlp_bin: args.ytdlp,
        env_path: args.env_file,
        ..SettingsOverrides::default()
    })?;
    let archiver = if args.archive {
        let Some(archive) = settings.archive.as_ref() else {
            bail!("--archive needs BOT_TOKEN and CHANNEL_ID");
        };
        Some(ChannelArchiver::new(
            HandleCache::load(&settings.handle_cache_file),
            Arc::new(TelegramUploader::new(archive)),
        ))
    } else {
        None
    };
    let coordinator = DownloadCoordinator::from_settings(&settings)?;

    let mut failed = 0usize;
    for id in &ids {
        let artifact = match fetch_to_completion(&coordinator, id).await {
            Ok(artifact) => artifact,
            Err(err) => {
                error!(id = %id, "prefetch failed: {err}");
                failed += 1;
                continue;
            }
        };
        println!("{id}: {} ({} bytes)", artifact.path.display(), artifact.size);
        if let Some(archiver) = &archiver {
            match archiver.archive(&artifact).await {
                Ok(handle) => info!(id = %id, handle = %handle, "archived"),
                Err(err) => {
                    warn!(id = %id, "archive failed: {err:#}");
                    failed += 1;
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} ids failed", ids.len());
    }
    Ok(())
}

/// Validates every id up front and drops duplicates, keeping input order
/// stable for the report.
fn unique_ids(raw: &[String]) -> Result<Vec<ContentId>> {
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();
    for value in raw {
        let id = ContentId::parse(value.trim())?;
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Re-joins the in-flight fetch each time the wait window elapses.
async fn fetch_to_completion(
    coordinator: &DownloadCoordinator,
    id: &ContentId,
) -> CoordinatorResult<CachedArtifact> {
    loop {
        match coordinator.obtain(id.as_str()).await? {
            Obtained::Ready(artifact) => return Ok(artifact),
            Obtained::StillProcessing => info!(id = %id, "still fetching"),
        }
    }
}
