use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderValue,
    },
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::job::{Job, JobStatus};
use crate::metadata::{MetadataClient, VideoInfo};
use crate::orchestrator::Orchestrator;
use crate::resolver::CANONICAL_EXTENSION;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub metadata: MetadataClient,
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
struct DownloadStarted {
    download_id: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/info", post(video_info))
        .route("/api/download", post(start_download))
        .route("/api/progress/{id}", get(check_progress))
        .route("/api/file/{id}", get(get_file))
        .route("/api/cleanup/{id}", delete(cleanup))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn require_url(payload: Result<Json<UrlRequest>, JsonRejection>) -> Result<String, ServiceError> {
    let Json(request) = payload
        .map_err(|e| ServiceError::BadRequest(format!("Invalid request: {}", e.body_text())))?;
    let url = request.url.trim();
    if url.is_empty() {
        return Err(ServiceError::BadRequest("No URL provided".to_string()));
    }
    if url.starts_with('-') {
        return Err(ServiceError::BadRequest("Invalid URL".to_string()));
    }
    Ok(url.to_string())
}

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Json<VideoInfo>, ServiceError> {
    let url = require_url(payload)?;
    let info = state
        .metadata
        .lookup(&url)
        .await
        .map_err(|e| ServiceError::Upstream(format!("{:#}", e)))?;
    Ok(Json(info))
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Json<DownloadStarted>, ServiceError> {
    let url = require_url(payload)?;
    let download_id = state.orchestrator.start(&url);
    Ok(Json(DownloadStarted { download_id }))
}

async fn check_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ServiceError> {
    Ok(Json(state.orchestrator.store().get(&id)?))
}

async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let job = state.orchestrator.store().get(&id)?;
    if job.status != JobStatus::Completed {
        return Err(ServiceError::BadRequest("Download not completed".to_string()));
    }
    let path = job
        .filename
        .ok_or_else(|| ServiceError::NotFound("File not found".to_string()))?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServiceError::NotFound("File not found".to_string()))
        }
        Err(e) => return Err(ServiceError::Internal(format!("Cannot open file: {}", e))),
    };
    let length = file
        .metadata()
        .await
        .map_err(|e| ServiceError::Internal(format!("Cannot stat file: {}", e)))?
        .len();

    let download_name = path
        .with_extension(CANONICAL_EXTENSION)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("video.{CANONICAL_EXTENSION}"));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    let disposition = content_disposition(&download_name);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|_| ServiceError::Internal("Invalid download name".to_string()))?,
    );

    info!("Job {}: serving {}", id, path.display());
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn cleanup(State(state): State<AppState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    if let Some(job) = state.orchestrator.store().delete(&id) {
        if let Some(path) = job.filename {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Job {}: removed {}", id, path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Job {}: failed to remove {}: {}", id, path.display(), e),
            }
        }
    }
    Json(json!({ "success": true }))
}

/// `attachment` header with an ASCII fallback name and an RFC 5987 UTF-8 name
fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let encoded: String = filename
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect();
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}
