//! REST API routes

use crate::error::{ConflictReason, Error, FetchFailure};
use crate::jobs::DownloadJob;
use crate::storage::StoredFile;
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::error;

/// Create API routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Jobs
        .route("/download", post(submit_download))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(job_status))
        // Stored files
        .route("/files", get(list_files))
        .route("/downloads/{name}", get(serve_file))
        .route("/delete/{name}", delete(delete_file))
}

/// Public URL of a stored file
fn download_path(name: &str) -> String {
    format!("/downloads/{}", urlencoding::encode(name))
}

// ============ Job Endpoints ============

/// Request to start one download, or a batch with `urls`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub urls: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    /// Answer only once the job is terminal
    #[serde(default)]
    pub wait: bool,
}

/// Response after starting a download
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Outcome of one URL in a batch
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchEntry {
    fn fail(&mut self, kind: &'static str, error: String) {
        self.kind = Some(kind);
        self.error = Some(error);
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub jobs: Vec<BatchEntry>,
}

/// Start a download
async fn submit_download(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SubmitParams>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let timeout = match req.timeout_secs {
        None => None,
        Some(secs) => {
            let max = state.orchestrator.limits().max_timeout.as_secs();
            if secs == 0 || secs > max {
                return Err(AppError::BadRequest(format!(
                    "timeoutSecs must be between 1 and {}",
                    max
                )));
            }
            Some(Duration::from_secs(secs))
        }
    };

    if let Some(urls) = req.urls {
        if req.url.is_some() {
            return Err(AppError::BadRequest("send either url or urls".to_string()));
        }
        if urls.is_empty() {
            return Err(Error::invalid("urls is empty").into());
        }
        return Ok(submit_batch(&state, urls, timeout, params.wait).await);
    }

    let url = req
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| Error::invalid("missing url"))?;

    let job_id = state.orchestrator.submit_download(url, timeout)?;

    if !params.wait {
        let body = DownloadResponse {
            job_id,
            file_path: None,
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let job = state.orchestrator.wait(&job_id).await?;
    match job.failure() {
        Some(failure) => Err(AppError::Transfer { job_id, failure }),
        None => Ok(Json(DownloadResponse {
            job_id,
            file_path: Some(download_path(&job.target_name)),
        })
        .into_response()),
    }
}

/// Admit every URL of a batch; each entry carries its own job id or error
async fn submit_batch(
    state: &AppState,
    urls: Vec<String>,
    timeout: Option<Duration>,
    wait: bool,
) -> Response {
    let mut entries: Vec<BatchEntry> = urls
        .into_iter()
        .map(|url| {
            let mut entry = BatchEntry {
                url,
                job_id: None,
                file_path: None,
                kind: None,
                error: None,
            };
            match state.orchestrator.submit_download(&entry.url, timeout) {
                Ok(job_id) => entry.job_id = Some(job_id),
                Err(e) => entry.fail(e.kind(), e.to_string()),
            }
            entry
        })
        .collect();

    if !wait {
        return (StatusCode::ACCEPTED, Json(BatchResponse { jobs: entries })).into_response();
    }

    for entry in &mut entries {
        let Some(job_id) = entry.job_id.clone() else {
            continue;
        };
        match state.orchestrator.wait(&job_id).await {
            Ok(job) => match job.failure() {
                Some(failure) => entry.fail(failure.kind.as_str(), failure.message),
                None => entry.file_path = Some(download_path(&job.target_name)),
            },
            Err(e) => entry.fail(e.kind(), e.to_string()),
        }
    }

    Json(BatchResponse { jobs: entries }).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsParams {
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<DownloadJob>,
}

/// List job records, newest first
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<JobsParams>,
) -> Json<JobsResponse> {
    Json(JobsResponse {
        jobs: state.orchestrator.jobs(params.active),
    })
}

/// Get one job
async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DownloadJob>, AppError> {
    Ok(Json(state.orchestrator.status(&id)?))
}

// ============ File Endpoints ============

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub files: Vec<String>,
    pub entries: Vec<StoredFile>,
}

/// List stored files
async fn list_files(State(state): State<Arc<AppState>>) -> Result<Json<FilesResponse>, AppError> {
    let entries = state.orchestrator.list_files().await?;
    let files = entries.iter().map(|f| f.name.clone()).collect();
    Ok(Json(FilesResponse { files, entries }))
}

/// Send a stored file as an attachment
async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    // Unsafe names are reported as missing here
    let file = match state.orchestrator.stored_file(&name).await {
        Err(Error::InvalidTarget(_)) => return Err(Error::NotFound(name).into()),
        other => other?,
    };
    let path = state.orchestrator.storage().absolute_path(&file.name)?;

    let mut response = match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(&file.name)
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response.into_response())
}

/// Delete a stored file
async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.orchestrator.delete_file(&name).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ============ Error Handling ============

/// Application error type
#[derive(Debug)]
pub enum AppError {
    /// Unparseable body or parameters
    BadRequest(String),
    Service(Error),
    /// A waited-for job failed
    Transfer { job_id: String, failure: FetchFailure },
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Service(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "kind": "BadRequest", "error": message }),
            ),
            AppError::Service(err) => {
                let status = match &err {
                    Error::InvalidTarget(_) => StatusCode::BAD_REQUEST,
                    Error::Conflict { .. } => StatusCode::CONFLICT,
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::Io(e) => {
                        error!("Storage error: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };

                let mut body = serde_json::json!({
                    "kind": err.kind(),
                    "error": err.to_string(),
                });
                if let Error::Conflict { reason, .. } = &err {
                    match reason {
                        ConflictReason::Active { job_id } => {
                            body["reason"] = "active".into();
                            body["jobId"] = job_id.as_str().into();
                        }
                        ConflictReason::Exists => body["reason"] = "exists".into(),
                    }
                }
                (status, body)
            }
            AppError::Transfer { job_id, failure } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "kind": failure.kind.as_str(),
                    "error": failure.message,
                    "jobId": job_id,
                }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
