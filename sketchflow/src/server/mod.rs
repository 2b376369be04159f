//! HTTP boundary.
//!
//! ```text
//! /
//! ├── GET  /                        - upload form
//! ├── POST /api/upload              - raw image bytes into the input slot
//! ├── POST /api/analyze             - launch a run
//! ├── GET  /api/status              - poll run status
//! ├── GET  /api/download            - ZIP of the report and run log
//! ├── POST /api/cleanup             - archive then purge the namespace
//! ├── POST /api/history/challenge   - start a history wipe
//! ├── POST /api/history/clear       - confirm a history wipe
//! └── POST /api/cancel              - cancel the active run
//! ```

use crate::errors::SketchflowError;
use crate::service::PipelineService;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Largest accepted upload body.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Sketchflow</title></head>
<body>
<h1>Drawing analysis</h1>
<input type="file" id="file" accept="image/*">
<button onclick="upload()">Analyze</button>
<pre id="status"></pre>
<script>
async function upload() {
  const file = document.getElementById('file').files[0];
  if (!file) return;
  const res = await fetch('/api/upload', { method: 'POST', body: file });
  const body = await res.json();
  if (!body.accepted) { show(body.message); return; }
  await fetch('/api/analyze', { method: 'POST' });
  poll();
}
async function poll() {
  const s = await (await fetch('/api/status')).json();
  show(s.description);
  if (s.stage === 'completed') { window.location = '/api/download'; return; }
  if (s.running) setTimeout(poll, 1000);
}
function show(text) { document.getElementById('status').textContent = text; }
</script>
</body>
</html>
"#;

/// Shared handler state.
pub type AppState = Arc<PipelineService>;

/// Builds the router over `service`.
pub fn build_router(service: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/upload", post(upload))
        .route("/api/analyze", post(analyze))
        .route("/api/status", get(status))
        .route("/api/download", get(download))
        .route("/api/cleanup", post(cleanup))
        .route("/api/history/challenge", post(history_challenge))
        .route("/api/history/clear", post(history_clear))
        .route("/api/cancel", post(cancel))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(service)
}

/// Serves the router on `addr` until the process is stopped.
pub async fn serve(service: AppState, addr: SocketAddr) -> Result<(), SketchflowError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, build_router(service)).await?;
    Ok(())
}

/// A [`SketchflowError`] rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(SketchflowError);

impl From<SketchflowError> for ApiError {
    fn from(err: SketchflowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SketchflowError::Validation(_) => StatusCode::BAD_REQUEST,
            SketchflowError::ConcurrencyConflict(_)
            | SketchflowError::MaintenanceInProgress(_) => StatusCode::CONFLICT,
            SketchflowError::MissingInput(_) => StatusCode::BAD_REQUEST,
            SketchflowError::NotReady(_) => StatusCode::NOT_FOUND,
            SketchflowError::Confirmation(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(self.0.to_dict())).into_response()
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Runs a service call that touches the filesystem off the async workers.
async fn blocking<T, F>(task: &str, f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SketchflowError::Internal(format!("{task} task failed: {e}")).into())
}

fn refusal_status(reason: Option<&str>) -> StatusCode {
    match reason {
        None => StatusCode::OK,
        Some("run_in_progress" | "already_running" | "maintenance_in_progress") => {
            StatusCode::CONFLICT
        }
        Some(_) => StatusCode::BAD_REQUEST,
    }
}

async fn upload(State(service): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let response = blocking("upload", move || service.admit_upload(&body)).await?;
    let status = refusal_status(response.reason.as_deref());
    Ok((status, Json(response)).into_response())
}

async fn analyze(State(service): State<AppState>) -> Result<Response, ApiError> {
    // Hashing the input slot is blocking I/O.
    let response = blocking("analyze", move || service.start_run()).await?;
    let status = refusal_status(response.reason.as_deref());
    Ok((status, Json(response)).into_response())
}

async fn status(State(service): State<AppState>) -> Response {
    Json(service.get_status()).into_response()
}

async fn download(State(service): State<AppState>) -> Result<Response, ApiError> {
    let bundle = service.fetch_result()?;
    let stem = bundle
        .artifact
        .file_stem()
        .map_or_else(|| "result".to_string(), |s| s.to_string_lossy().into_owned());
    let bytes = blocking("bundle", move || bundle.to_zip()).await??;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{stem}.zip\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn cleanup(State(service): State<AppState>) -> Result<Response, ApiError> {
    let report = blocking("cleanup", move || service.request_cleanup()).await??;
    Ok(Json(report).into_response())
}

async fn history_challenge(State(service): State<AppState>) -> Response {
    Json(service.begin_history_wipe()).into_response()
}

/// Body of a history wipe confirmation.
#[derive(Debug, Deserialize)]
pub struct WipeConfirmation {
    /// Token from the challenge.
    pub token: Uuid,
    /// The typed confirmation phrase.
    pub phrase: String,
}

async fn history_clear(
    State(service): State<AppState>,
    Json(confirmation): Json<WipeConfirmation>,
) -> Result<Response, ApiError> {
    let report = blocking("history wipe", move || {
        service.confirm_history_wipe(confirmation.token, &confirmation.phrase)
    })
    .await??;
    Ok(Json(report).into_response())
}

async fn cancel(State(service): State<AppState>) -> Response {
    Json(json!({"cancelled": service.cancel_run()})).into_response()
}
