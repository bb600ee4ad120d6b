#![forbid(unsafe_code)]

//! HTTP front for the download coordinator.
//!
//! Handlers never block: cache lookups are cheap stat calls and every fetch
//! runs on the coordinator's worker pool. A slow fetch answers `202` with a
//! processing payload instead of holding the connection forever.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tunecache::{
    archive::{ChannelArchiver, HandleCache, TelegramUploader},
    artifact::CachedArtifact,
    config::{SettingsOverrides, resolve_settings},
    coordinator::{DownloadCoordinator, Obtained},
    error::CoordinatorError,
    logging::init_logging,
    scraper::SourceScraper,
    security::ensure_not_root,
    tasks::{TaskRecord, TaskState},
};

#[derive(Debug, Parser)]
#[command(name = "tunecache-server", about = "Serve cached audio, fetching it on demand")]
struct ServerArgs {
    /// Listen address (TUNECACHE_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Listen port (TUNECACHE_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Artifact directory (DOWNLOAD_DIR).
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Cookie file or directory of cookie files (COOKIES_PATH).
    #[arg(long)]
    cookies: Option<PathBuf>,
    /// Maximum concurrent fetches (WORKER_POOL_SIZE).
    #[arg(long)]
    workers: Option<usize>,
    /// yt-dlp executable (YTDLP_BIN).
    #[arg(long = "yt-dlp")]
    ytdlp: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            host: self.host,
            port: self.port,
            download_dir: self.download_dir,
            cookies_path: self.cookies,
            worker_pool_size: self.workers,
            ytdlp_bin: self.ytdlp,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    coordinator: DownloadCoordinator,
    archiver: Option<Arc<ChannelArchiver>>,
    scraper: Arc<SourceScraper>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        let status = match &err {
            CoordinatorError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::FetchExhausted { .. } => StatusCode::BAD_GATEWAY,
            CoordinatorError::FetchInterrupted(_) | CoordinatorError::Io(_) => {
                error!("request failed: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Status payload shared by the task endpoints.
#[derive(Debug, Serialize)]
struct TaskPayload {
    id: String,
    status: &'static str,
    message: String,
    attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
}

impl From<TaskRecord> for TaskPayload {
    fn from(record: TaskRecord) -> Self {
        Self {
            status: record.state.status_label(),
            id: record.id,
            message: record.message,
            attempts: record.attempts,
            file: record.file_name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRequest {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = ServerArgs::parse();
    ensure_not_root("server")?;

    let settings = resolve_settings(args.overrides())?;
    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("expected an IP address for TUNECACHE_HOST, got {:?}", settings.host))?;

    let coordinator = DownloadCoordinator::from_settings(&settings)?;
    let sweeper = coordinator.spawn_sweeper(settings.sweep_interval);

    let archiver = settings.archive.as_ref().map(|archive| {
        let cache = HandleCache::load(&settings.handle_cache_file);
        info!(entries = cache.len(), "channel archiving enabled");
        Arc::new(ChannelArchiver::new(
            cache,
            Arc::new(TelegramUploader::new(archive)),
        ))
    });
    let scraper = Arc::new(SourceScraper::with_defaults(
        reqwest::Client::new(),
        &settings.ytdlp_bin,
    ));

    let app = build_router(AppState {
        coordinator,
        archiver,
        scraper,
    });

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        download_dir = %settings.download_dir.display(),
        workers = settings.worker_pool_size,
        "listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    sweeper.abort();
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/audio/{id}", get(get_audio))
        .route("/download", get(download_alias))
        .route("/api/files/{id}", get(get_file))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/archive/{id}", get(archive_audio))
        .route("/api/search", get(search))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
    info!("shutting down");
}

async fn get_audio(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    serve_audio(&state, &id, &headers).await
}

async fn download_alias(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = query
        .video_id
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("video_id is required"))?;
    serve_audio(&state, id.trim(), &headers).await
}

async fn serve_audio(state: &AppState, id: &str, headers: &HeaderMap) -> ApiResult<Response> {
    match state.coordinator.obtain(id).await? {
        Obtained::Ready(artifact) => stream_artifact(&artifact, Some(headers)).await,
        Obtained::StillProcessing => Ok(processing_response(id)),
    }
}

async fn get_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let artifact = state.coordinator.lookup(&id)?;
    stream_artifact(&artifact, Some(&headers)).await
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskPayload>)> {
    let record = state.coordinator.enqueue(request.video_id.trim())?;
    let status = if record.state == TaskState::Succeeded {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(record.into())))
}

async fn get_task(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<TaskPayload>> {
    state
        .coordinator
        .task(&id)?
        .map(|record| Json(record.into()))
        .ok_or_else(|| ApiError::not_found(format!("no task for {id}")))
}

async fn archive_audio(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let Some(archiver) = state.archiver.clone() else {
        return Err(ApiError::not_found("channel archiving is disabled"));
    };
    if let Some(handle) = archiver.known_handle(&id) {
        return Ok(Json(json!({ "status": "ready", "id": id, "handle": handle })).into_response());
    }
    let artifact = match state.coordinator.obtain(&id).await? {
        Obtained::Ready(artifact) => artifact,
        Obtained::StillProcessing => return Ok(processing_response(&id)),
    };
    let handle = archiver.archive(&artifact).await.map_err(|err| {
        warn!(id = %artifact.content_id, "archive upload failed: {err:#}");
        ApiError::new(StatusCode::BAD_GATEWAY, format!("archive upload failed: {err}"))
    })?;
    Ok(Json(json!({ "status": "ready", "id": id, "handle": handle })).into_response())
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let q = query
        .q
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("q is required"))?;
    let body = match state.scraper.resolve(&q).await {
        Some(found) => json!({ "status": "success", "data": found }),
        None => json!({ "status": "fail", "reason": "No source found" }),
    };
    Ok(Json(body))
}

fn processing_response(id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "processing", "id": id })),
    )
        .into_response()
}

async fn stream_artifact(artifact: &CachedArtifact, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    stream_file(&artifact.path, Some(&artifact.file_name()), headers).await
}

/// Streams `path`, honouring a single `Range` request. `download_name` adds
/// an attachment disposition.
async fn stream_file(
    path: &Path,
    download_name: Option<&str>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(&format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(format!("seeking: {err}")))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let out = response.headers_mut();
            out.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{size}"))?,
            );
            out.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    let out = response.headers_mut();
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(path).first()
        && let Ok(value) = HeaderValue::from_str(mime.essence_str())
    {
        out.insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = download_name {
        out.insert(
            header::CONTENT_DISPOSITION,
            header_value(&format!("attachment; filename=\"{name}\""))?,
        );
    }
    Ok(response)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| ApiError::internal("invalid header value"))
}

/// Parses `bytes=start-end`, `bytes=start-` and `bytes=-suffix`.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let ranges = value.to_str().ok()?.trim().strip_prefix("bytes=")?.trim();
    let (start, end) = ranges.split_once('-')?;
    let last = size.saturating_sub(1);

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), last));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() { last } else { end.parse().ok()? };
    (end >= start).then_some((start, end))
}
