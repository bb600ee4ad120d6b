//! Free-text song lookup across metadata sources.

use std::{path::PathBuf, process::Command, sync::Arc};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::security::ContentId;

pub const JIOSAAVN_API: &str = "https://www.jiosaavn.com/api.php";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SongMatch {
    pub source: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    pub url: String,
    /// Set when the match can be fed straight into the download coordinator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

#[async_trait]
pub trait SongSource: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str) -> Result<Option<SongMatch>>;
}

/// JioSaavn autocomplete API.
pub struct JioSaavnSource {
    client: reqwest::Client,
    endpoint: String,
}

impl JioSaavnSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, JIOSAAVN_API)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

fn parse_jiosaavn(payload: &Value) -> Option<SongMatch> {
    let song = payload.pointer("/songs/data/0")?;
    let title = song.get("title")?.as_str()?.to_string();
    let info = song.get("more_info")?;
    let url = info.get("media_url")?.as_str()?.to_string();
    let artist = info
        .pointer("/artistMap/primary_artists/0/name")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(SongMatch {
        source: "jiosaavn".to_string(),
        title,
        artist,
        url,
        content_id: None,
    })
}

#[async_trait]
impl SongSource for JioSaavnSource {
    fn name(&self) -> &str {
        "jiosaavn"
    }

    async fn search(&self, query: &str) -> Result<Option<SongMatch>> {
        let payload: Value = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("__call", "autocomplete.get"),
                ("_format", "json"),
                ("_marker", "0"),
                ("query", query),
            ])
            .send()
            .await
            .context("querying jiosaavn")?
            .error_for_status()?
            .json()
            .await
            .context("decoding jiosaavn response")?;
        Ok(parse_jiosaavn(&payload))
    }
}

/// First hit of a yt-dlp `ytsearch1:` query.
pub struct YoutubeSearchSource {
    program: PathBuf,
}

impl YoutubeSearchSource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

fn parse_ytsearch(payload: &Value) -> Option<SongMatch> {
    let entry = payload.pointer("/entries/0")?;
    let id = entry.get("id")?.as_str()?;
    let content_id = ContentId::parse(id).ok()?;
    let title = entry
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(id)
        .to_string();
    let artist = entry
        .get("channel")
        .or_else(|| entry.get("uploader"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(SongMatch {
        source: "youtube".to_string(),
        title,
        artist,
        url: content_id.source_url(),
        content_id: Some(content_id.to_string()),
    })
}

#[async_trait]
impl SongSource for YoutubeSearchSource {
    fn name(&self) -> &str {
        "youtube"
    }

    async fn search(&self, query: &str) -> Result<Option<SongMatch>> {
        let program = self.program.clone();
        let target = format!("ytsearch1:{query}");
        let output = tokio::task::spawn_blocking(move || {
            Command::new(&program)
                .args([
                    "--flat-playlist",
                    "--dump-single-json",
                    "--no-warnings",
                    "--",
                    target.as_str(),
                ])
                .output()
                .with_context(|| format!("running {}", program.display()))
        })
        .await
        .context("joining yt-dlp search")??;

        if !output.status.success() {
            bail!(
                "yt-dlp search failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let payload: Value =
            serde_json::from_slice(&output.stdout).context("decoding yt-dlp search output")?;
        Ok(parse_ytsearch(&payload))
    }
}

pub struct SourceScraper {
    sources: Vec<Arc<dyn SongSource>>,
}

impl SourceScraper {
    pub fn new(sources: Vec<Arc<dyn SongSource>>) -> Self {
        Self { sources }
    }

    /// JioSaavn first, then a YouTube search through `ytdlp`.
    pub fn with_defaults(client: reqwest::Client, ytdlp: impl Into<PathBuf>) -> Self {
        let sources: Vec<Arc<dyn SongSource>> = vec![
            Arc::new(JioSaavnSource::new(client)),
            Arc::new(YoutubeSearchSource::new(ytdlp)),
        ];
        Self::new(sources)
    }

    /// First usable match, trying sources in order. Source failures are
    /// logged and skipped.
    pub async fn resolve(&self, query: &str) -> Option<SongMatch> {
        for source in &self.sources {
            match source.search(query).await {
                Ok(Some(found)) if !found.url.trim().is_empty() => {
                    debug!(source = source.name(), "resolved {query:?}");
                    return Some(found);
                }
                Ok(_) => debug!(source = source.name(), "no match for {query:?}"),
                Err(err) => warn!(source = source.name(), "search failed: {err:#}"),
            }
        }
        None
    }
}
