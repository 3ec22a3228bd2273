#![forbid(unsafe_code)]

//! MEDIS HTTP server.
//!
//! Accepts download requests, serves the stored library (JSON listing, range
//! capable video streams, thumbnails, share pages) and pushes queue and job
//! events to every connected WebSocket client. Everything else falls through
//! to the static frontend under the www root.

use std::{
    io::SeekFrom,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        FromRequestParts, Path as AxumPath, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use medis::{
    config::{RuntimeOverrides, Settings, resolve_settings},
    error::MedisError,
    library::Library,
    logging,
    notifier::{Notifier, Subscription},
    orchestrator::Orchestrator,
    queue::QueueService,
    security::{ensure_not_root, is_uuid},
    store::{DEFAULT_HEIGHT, DEFAULT_WIDTH, VideoRecord, VideoStore},
    thumbnail::ThumbnailFetcher,
    updater,
    ytdlp::{MediaDownloader, YtDlp},
};
use mime_guess::{MimeGuess, mime::Mime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

const MEDIS_VERSION: &str = env!("CARGO_PKG_VERSION");
const VERSION_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Parser)]
#[command(name = "medis", version, about = "Self-hosted media download manager")]
struct ServerArgs {
    /// Directory holding `videos/`, `thumbnails/` and the database.
    #[arg(long, value_name = "DIR")]
    storage_root: Option<PathBuf>,

    /// Static frontend served for every non-API path.
    #[arg(long, value_name = "DIR")]
    www_root: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    /// Maximum number of active plus queued jobs (0 disables the limit).
    #[arg(long, value_name = "N")]
    max_queue_limit: Option<usize>,

    /// Maximum number of entries taken from a playlist (0 disables the limit).
    #[arg(long, value_name = "N")]
    playlist_limit: Option<usize>,

    #[arg(long, value_name = "PATH", env = "MEDIS_ENV_FILE")]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            storage_root: self.storage_root,
            www_root: self.www_root,
            port: self.port,
            host: self.host,
            max_queue_limit: self.max_queue_limit,
            playlist_limit: self.playlist_limit,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
    library: Library,
    downloader: Arc<dyn MediaDownloader>,
    versions: Arc<VersionCache>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct VersionInfo {
    medis: String,
    ytdlp: String,
}

/// Last successful `/api/version` answer. yt-dlp is a subprocess, so the
/// answer is kept for an hour.
#[derive(Default)]
struct VersionCache {
    entry: Mutex<Option<(Instant, VersionInfo)>>,
}

impl VersionCache {
    fn fresh(&self) -> Option<VersionInfo> {
        self.entry
            .lock()
            .as_ref()
            .filter(|(stored_at, _)| stored_at.elapsed() < VERSION_CACHE_TTL)
            .map(|(_, info)| info.clone())
    }

    fn store(&self, info: VersionInfo) {
        *self.entry.lock() = Some((Instant::now(), info));
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<MedisError> for ApiError {
    fn from(err: MedisError) -> Self {
        Self {
            status: err.status_code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    ensure_not_root("medis")?;
    logging::init();

    let settings = resolve_settings(args.into_overrides())?;
    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", settings.host))?;

    let downloader: Arc<dyn MediaDownloader> = Arc::new(YtDlp::new(
        settings.ytdlp_bin.clone(),
        settings.storage().cookies_file(),
    ));
    let state = build_state(&settings, downloader).await?;
    let app = router(state);

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("MEDIS server is running on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running MEDIS server")?;

    Ok(())
}

/// Prepares storage, opens the database, resets the queue and removes files
/// left behind by earlier runs. Only storage and database failures abort.
async fn build_state(settings: &Settings, downloader: Arc<dyn MediaDownloader>) -> Result<AppState> {
    let paths = settings.storage();
    paths.prepare().context("creating storage directories")?;
    let store = Arc::new(
        VideoStore::open(&paths.database)
            .await
            .with_context(|| format!("opening database {}", paths.database.display()))?,
    );

    let notifier = Notifier::new();
    let queue = Arc::new(QueueService::new(settings.max_queue_limit));
    queue.reset();
    notifier.update_status(queue.stats());

    let library = Library::new(store.clone(), notifier.clone(), paths.clone());
    if let Err(err) = library.reconcile_orphans().await {
        warn!(error = %format!("{err:#}"), "orphan reconciliation failed");
    }

    info!("Max queue limit: {}", describe_limit(settings.max_queue_limit));
    info!(
        "Playlist download limit: {}",
        describe_limit(settings.playlist_limit)
    );
    if settings.auto_update_ytdlp {
        updater::spawn(
            downloader.clone(),
            updater::FIRST_CHECK_DELAY,
            updater::CHECK_INTERVAL,
        );
    } else {
        info!("yt-dlp auto-update is disabled");
    }

    let orchestrator = Orchestrator::new(
        downloader.clone(),
        store,
        queue,
        notifier,
        ThumbnailFetcher::new(paths.thumbnails.clone()),
        paths.videos.clone(),
        settings.playlist_limit,
    );

    Ok(AppState {
        orchestrator,
        library,
        downloader,
        versions: Arc::new(VersionCache::default()),
        www_root: Arc::new(settings.www_root.clone()),
    })
}

fn describe_limit(limit: Option<usize>) -> String {
    limit.map_or_else(|| "No Limit".to_string(), |limit| limit.to_string())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_or_socket))
        .route("/ws", get(live_socket))
        .route("/api/download", post(start_download))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{id}", delete(delete_video))
        .route("/api/stream/{filename}", get(stream_video))
        .route("/api/version", get(get_version))
        .route("/share/{id}", get(share_page))
        .route("/thumbnails/{file}", get(serve_thumbnail))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("Not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let url = request.url.unwrap_or_default();
    let accepted = state.orchestrator.submit(&url).await?;
    Ok((StatusCode::ACCEPTED, Json(MessageResponse::new(accepted.message))))
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoRecord>>> {
    let videos = state.library.list().await.map_err(|err| {
        error!(error = %format!("{err:#}"), "listing videos failed");
        ApiError::internal("Failed to retrieve videos")
    })?;
    Ok(Json(videos))
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<MessageResponse>> {
    let id = parse_video_id(&id)?;
    state.library.delete_video(id).await?;
    Ok(Json(MessageResponse::new("Video deleted successfully")))
}

async fn stream_video(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_stream_filename(&filename) {
        return Err(ApiError::bad_request("Invalid filename"));
    }
    let path = state.library.paths().videos.join(&filename);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ApiError::not_found("Video not found"));
    }
    stream_file(path, None, Some(&headers)).await
}

async fn serve_thumbnail(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&file)?;
    let path = state.library.paths().thumbnails.join(&file);
    stream_file(path, None, Some(&headers)).await
}

async fn get_version(State(state): State<AppState>) -> Response {
    if let Some(cached) = state.versions.fresh() {
        return Json(cached).into_response();
    }

    match state.downloader.version().await {
        Ok(ytdlp) => {
            let info = VersionInfo {
                medis: MEDIS_VERSION.to_string(),
                ytdlp,
            };
            state.versions.store(info.clone());
            Json(info).into_response()
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to get version info");
            let fallback = VersionInfo {
                medis: MEDIS_VERSION.to_string(),
                ytdlp: "N/A".to_string(),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(fallback)).into_response()
        }
    }
}

async fn share_page(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Html<String>> {
    let id = parse_video_id(&id)?;
    let video = state
        .library
        .find(id)
        .await
        .map_err(|err| {
            error!(video_id = %id, error = %format!("{err:#}"), "loading shared video failed");
            ApiError::internal("Failed to load video")
        })?
        .ok_or_else(|| ApiError::not_found("Video not found"))?;
    Ok(Html(render_share_page(&video, &public_base_url(&headers))))
}

/// `/` serves the frontend unless the request is a WebSocket handshake.
async fn index_or_socket(State(state): State<AppState>, req: Request<Body>) -> Response {
    if !is_websocket_upgrade(req.headers()) {
        return static_fallback(State(state), req).await;
    }
    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => accept_socket(ws, &state),
        Err(rejection) => rejection.into_response(),
    }
}

async fn live_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    accept_socket(ws, &state)
}

fn accept_socket(ws: WebSocketUpgrade, state: &AppState) -> Response {
    let notifier = state.orchestrator.notifier().clone();
    ws.on_upgrade(move |socket| forward_events(socket, notifier))
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Pushes every notifier event to one client until either side goes away.
/// Client messages are read only to notice the close.
async fn forward_events(socket: WebSocket, notifier: Notifier) {
    let Subscription { id, mut events } = notifier.subscribe();
    info!(observer = id, "WebSocket client connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(observer = id, error = %err, "failed to encode live event");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    notifier.unsubscribe(id);
    info!(observer = id, "WebSocket client disconnected");
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let index = root.join("index.html");
    let target = resolve_www_path(root, request_path)?;

    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(index, None, None).await,
        Ok(_) => stream_file(target, None, None).await,
        Err(_) if should_fallback_to_index(request_path) => stream_file(index, None, None).await,
        Err(_) => Err(ApiError::not_found("Not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("Not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension and render the SPA shell.
fn should_fallback_to_index(request_path: &str) -> bool {
    Path::new(request_path.trim_start_matches('/'))
        .extension()
        .is_none()
}

fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("Not found"));
    }
    Ok(())
}

fn parse_video_id(value: &str) -> ApiResult<Uuid> {
    if !is_uuid(value) {
        return Err(ApiError::bad_request("Invalid ID format"));
    }
    Uuid::try_parse(value).map_err(|_| ApiError::bad_request("Invalid ID format"))
}

/// Stored videos are always `{uuid}.mp4`; anything else is rejected before
/// touching the filesystem.
fn is_stream_filename(name: &str) -> bool {
    name.strip_suffix(".mp4").is_some_and(|stem| {
        !stem.is_empty()
            && stem
                .chars()
                .all(|ch| ch.is_ascii_hexdigit() || ch == '-')
    })
}

/// `{proto}://{host}` as seen by the client, honoring a reverse proxy's
/// `X-Forwarded-Proto`.
fn public_base_url(headers: &HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

fn render_share_page(video: &VideoRecord, base_url: &str) -> String {
    let title = escape_html(&video.title);
    let video_url = escape_html(&format!("{base_url}/api/stream/{}", video.filename));
    let share_url = escape_html(&format!("{base_url}/share/{}", video.id));
    let stream_path = escape_html(&format!("/api/stream/{}", video.filename));
    let thumbnail_url = if video.thumbnail_url.is_empty() {
        String::new()
    } else {
        escape_html(&format!("{base_url}{}", video.thumbnail_url))
    };
    let width = if video.width > 0 {
        video.width
    } else {
        DEFAULT_WIDTH
    };
    let height = if video.height > 0 {
        video.height
    } else {
        DEFAULT_HEIGHT
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <meta name="twitter:card" content="player">
    <meta name="twitter:title" content="{title}">
    <meta name="twitter:player" content="{video_url}">
    <meta name="twitter:player:width" content="{width}">
    <meta name="twitter:player:height" content="{height}">
    <meta name="twitter:image" content="{thumbnail_url}">
    <meta property="og:type" content="video.other">
    <meta property="og:title" content="{title}">
    <meta property="og:url" content="{share_url}">
    <meta property="og:image" content="{thumbnail_url}">
    <meta property="og:video" content="{video_url}">
    <meta property="og:video:secure_url" content="{video_url}">
    <meta property="og:video:type" content="video/mp4">
    <meta property="og:video:width" content="{width}">
    <meta property="og:video:height" content="{height}">
    <style>
        html, body {{ background-color: #000; color: #fff; margin: 0; padding: 0; width: 100%; height: 100%; display: flex; justify-content: center; align-items: center; overflow: hidden; }}
        video {{ max-width: 100vw; max-height: 100vh; width: auto; height: auto; object-fit: contain; }}
    </style>
</head>
<body>
    <video controls autoplay playsinline>
        <source src="{stream_path}" type="video/mp4">
        Your browser does not support the video tag.
    </video>
</body>
</html>
"#
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("Not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("Not found"))?
        .len();

    let content_type = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(&format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start)).await.map_err(|err| {
                error!(path = %path.display(), error = %err, "seek failed");
                ApiError::internal("Failed to read file")
            })?;
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

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = content_type
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| ApiError::internal("Invalid header value"))
}

/// Parses a single `bytes=` range. Open-ended (`N-`) and suffix (`-N`) forms
/// are supported; anything else yields `None` and the whole file is sent.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let (unit, range) = value.to_str().ok()?.trim().split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let (start, end) = range.trim().split_once('-')?;

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), size.saturating_sub(1)));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        end.parse().ok()?
    };
    (end >= start).then_some((start, end))
}
