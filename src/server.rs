//! HTTP front-end: static assets, the download API and one-shot file delivery.

use std::{any::Any, future::Future, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path as AxumPath, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, net::TcpListener, signal};
use tokio_util::io::ReaderStream;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::downloads::{self, DownloadsDir, RemoveOnDrop, ServeOnce, SettlePolicy, StagedFile};
use crate::error::DownloadError;
use crate::ytdlp::{VideoInfo, YtDlp};

pub const INDEX_FILE: &str = "index.html";
pub const DOWNLOADS_ROUTE: &str = "/downloads";
const DOWNLOAD_CONTENT_TYPE: &str = "video/mp4";

#[derive(Clone)]
pub struct AppState {
    tool: Arc<YtDlp>,
    downloads: Arc<DownloadsDir>,
    www_root: Arc<PathBuf>,
    settle: SettlePolicy,
}

impl AppState {
    /// Builds the shared state and makes sure the downloads directory exists.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let downloads = DownloadsDir::new(&config.downloads_dir);
        downloads.prepare()?;
        Ok(Self {
            tool: Arc::new(YtDlp::new(config.tool.clone())),
            downloads: Arc::new(downloads),
            www_root: Arc::new(config.www_root.clone()),
            settle: config.settle,
        })
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
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

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
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
pub struct DownloadResponse {
    pub status: &'static str,
    pub title: String,
    pub duration: f64,
    pub thumbnail: String,
    pub filesize: u64,
    pub filename: String,
    pub url: String,
    pub desc: String,
}

impl DownloadResponse {
    fn new(info: &VideoInfo, staged: StagedFile, filesize: u64) -> Self {
        let duration = info.duration_secs();
        Self {
            status: "success",
            title: info.title().to_string(),
            duration,
            thumbnail: info.thumbnail().to_string(),
            filesize,
            url: format!("{DOWNLOADS_ROUTE}/{}", staged.name),
            filename: staged.name,
            desc: format!("Duration: {}", format_duration(duration)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index).fallback(not_found))
        .route("/api/download", post(start_download).fallback(not_found))
        .route("/downloads/{name}", get(serve_download).fallback(not_found))
        .fallback(serve_static)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("running HTTP server")
}

pub async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to install Ctrl+C handler");
        return;
    }
    info!("server stopped");
}

async fn index(State(state): State<AppState>) -> ApiResult<Response> {
    stream_file(
        state.www_root.join(INDEX_FILE),
        Some(mime_guess::mime::TEXT_HTML_UTF_8),
    )
    .await
}

async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}

async fn start_download(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<DownloadResponse>> {
    let request: DownloadRequest =
        serde_json::from_slice(&body).map_err(|_| DownloadError::InvalidRequest)?;
    let url = request
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or(DownloadError::MissingUrl)?;

    info!(%url, "processing download request");

    // Detached so a client hanging up neither kills yt-dlp nor strands a
    // half-written file.
    let response = tokio::spawn(fetch_and_stage(state, url))
        .await
        .map_err(|err| DownloadError::Internal(err.to_string()))??;

    Ok(Json(response))
}

async fn fetch_and_stage(
    state: AppState,
    url: String,
) -> Result<DownloadResponse, DownloadError> {
    let info = state.tool.fetch_info(&url).await?;
    let staged = state.downloads.allocate(info.ext.as_deref());
    let guard = RemoveOnDrop::new(staged.path.clone());
    state.tool.download(&url, &staged.path).await?;
    let filesize = downloads::settle(&staged.path, state.settle).await?;
    guard.keep();

    Ok(DownloadResponse::new(&info, staged, filesize))
}

async fn serve_download(
    State(state): State<AppState>,
    method: Method,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Response> {
    let path = state
        .downloads
        .resolve(&name)
        .ok_or_else(|| ApiError::not_found("file not found"))?;

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
        .map_err(|err| ApiError::internal(err.to_string()))?;

    // HEAD must not consume the one-shot file.
    let (body, len) = if method == Method::HEAD {
        let len = tokio::fs::metadata(&path)
            .await
            .map_err(|_| ApiError::not_found("file not found"))?
            .len();
        (Body::empty(), len)
    } else {
        let (stream, len) = ServeOnce::open(path)
            .await
            .map_err(|_| ApiError::not_found("file not found"))?;
        info!(%name, size = len, "serving download");
        (Body::from_stream(stream), len)
    };

    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DOWNLOAD_CONTENT_TYPE),
    );
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}

async fn serve_static(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
) -> ApiResult<Response> {
    if method != Method::GET && method != Method::HEAD {
        return Err(ApiError::not_found("not found"));
    }
    let path = resolve_static(&state, uri.path())
        .await
        .ok_or_else(|| ApiError::not_found("not found"))?;
    stream_file(path, None).await
}

/// Maps a request path onto a file below the web root. Staged downloads are
/// only reachable through their own route.
async fn resolve_static(state: &AppState, raw: &str) -> Option<PathBuf> {
    let mut path = state.www_root.as_ref().clone();
    for segment in raw.split('/').filter(|segment| !segment.is_empty()) {
        if segment == "." {
            continue;
        }
        if !downloads::is_plain_file_name(segment) {
            return None;
        }
        path.push(segment);
    }
    let mut meta = tokio::fs::metadata(&path).await.ok()?;
    if meta.is_dir() {
        path.push(INDEX_FILE);
        meta = tokio::fs::metadata(&path).await.ok()?;
    }
    if path.starts_with(state.downloads.path()) {
        return None;
    }
    meta.is_file().then_some(path)
}

async fn stream_file(path: PathBuf, mime: Option<Mime>) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let len = file.metadata().await.ok().map(|meta| meta.len());

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    if let Some(len) = len {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    Ok(response)
}

/// Answers every preflight itself and stamps the permissive CORS headers on
/// every other response.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(%detail, "request handler panicked");
    ApiError::from(DownloadError::Internal(detail)).into_response()
}

/// Renders seconds as `H:MM:SS`, `M:SS`, or `--:--` when unknown.
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "--:--".to_string();
    }
    let total = seconds as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}
