//! Channel archiving: uploads fetched artifacts to a Telegram channel once
//! and remembers the returned file handle per content id.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{artifact::CachedArtifact, config::ArchiveSettings};

/// Content id to channel file handle, persisted as a JSON object.
pub struct HandleCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl HandleCache {
    /// A missing or unreadable file starts an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("ignoring corrupt handle cache {}: {err}", path.display());
                BTreeMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("cannot read handle cache {}: {err}", path.display());
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.entries.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Inserts and rewrites the file while holding the lock, so concurrent
    /// inserts never lose each other's entries.
    pub fn insert(&self, id: &str, handle: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(id.to_string(), handle.to_string());
        write_json_atomic(&self.path, &*entries)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Destination that stores an artifact and returns a reusable handle.
#[async_trait]
pub trait ChannelUploader: Send + Sync {
    async fn upload(&self, artifact: &CachedArtifact) -> Result<String>;
}

/// Bot API `sendAudio` client.
pub struct TelegramUploader {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramUploader {
    pub fn new(settings: &ArchiveSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: settings.api_base.clone(),
            bot_token: settings.bot_token.clone(),
            chat_id: settings.channel_id.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendAudio", self.api_base, self.bot_token)
    }
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<BotMessage>,
}

#[derive(Debug, Deserialize)]
struct BotMessage {
    #[serde(default)]
    audio: Option<BotFile>,
    #[serde(default)]
    document: Option<BotFile>,
}

#[derive(Debug, Deserialize)]
struct BotFile {
    file_id: String,
}

fn file_id_from(response: BotResponse) -> Result<String> {
    if !response.ok {
        return Err(anyhow!(
            "sendAudio rejected: {}",
            response.description.as_deref().unwrap_or("no description")
        ));
    }
    response
        .result
        .and_then(|message| message.audio.or(message.document))
        .map(|file| file.file_id)
        .ok_or_else(|| anyhow!("sendAudio response carried no file id"))
}

#[async_trait]
impl ChannelUploader for TelegramUploader {
    async fn upload(&self, artifact: &CachedArtifact) -> Result<String> {
        let bytes = tokio::fs::read(&artifact.path)
            .await
            .with_context(|| format!("reading {}", artifact.path.display()))?;
        let mime = mime_guess::from_path(&artifact.path).first_or_octet_stream();
        let part = Part::bytes(bytes)
            .file_name(artifact.file_name())
            .mime_str(mime.essence_str())
            .context("building audio part")?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("audio", part);

        debug!(id = %artifact.content_id, "uploading to channel {}", self.chat_id);
        let response: BotResponse = self
            .client
            .post(self.endpoint())
            .multipart(form)
            .send()
            .await
            .context("sending sendAudio request")?
            .json()
            .await
            .context("decoding sendAudio response")?;
        file_id_from(response)
    }
}

/// Uploads each artifact at most once. Concurrent calls for the same id
/// queue on a per-id gate and reuse the first caller's handle.
pub struct ChannelArchiver {
    cache: HandleCache,
    uploader: Arc<dyn ChannelUploader>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChannelArchiver {
    pub fn new(cache: HandleCache, uploader: Arc<dyn ChannelUploader>) -> Self {
        Self {
            cache,
            uploader,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn known_handle(&self, id: &str) -> Option<String> {
        self.cache.get(id)
    }

    pub async fn archive(&self, artifact: &CachedArtifact) -> Result<String> {
        let id = artifact.content_id.as_str();
        if let Some(handle) = self.cache.get(id) {
            return Ok(handle);
        }

        let gate = Arc::clone(self.gates.lock().entry(id.to_string()).or_default());
        let result = {
            let _turn = gate.lock().await;
            self.archive_locked(artifact).await
        };
        self.release_gate(id, gate);
        result
    }

    async fn archive_locked(&self, artifact: &CachedArtifact) -> Result<String> {
        let id = artifact.content_id.as_str();
        if let Some(handle) = self.cache.get(id) {
            debug!(id, "reusing handle from a concurrent upload");
            return Ok(handle);
        }
        let handle = self
            .uploader
            .upload(artifact)
            .await
            .with_context(|| format!("archiving {id}"))?;
        info!(id, "archived to channel");
        self.cache.insert(id, &handle)?;
        Ok(handle)
    }

    /// Drops the gate once no other caller holds or waits on it.
    fn release_gate(&self, id: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.gates.lock();
        if Arc::strong_count(&gate) == 2 {
            gates.remove(id);
        }
    }
}
