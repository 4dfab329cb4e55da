use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::auth::CurrentUser;
use crate::services::ingest::{
    IngestMeta, IngestReceipt, InitiateChunkedRequest, InitiateChunkedResponse,
    JobStatusResponse, RemoteInitiateRequest,
};
use crate::services::upload_session::{ChunkReceipt, CompletionReceipt, ResumeInfo};
use crate::utils::validation::UploadLimits;
use axum::{
    Extension, Json,
    extract::{Multipart, Path, Query, State},
};
use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
pub struct CompleteChunkedRequest {
    pub upload_id: String,
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    20
}

/// Collects the metadata fields every ingest mode shares from a multipart
/// stream.
#[derive(Default)]
struct MultipartMeta {
    dataset_name: Option<String>,
    sensor: Option<String>,
    convert: Option<bool>,
    is_public: Option<bool>,
    is_downloadable: Option<String>,
    folder: Option<String>,
    tags: Vec<String>,
    description: Option<String>,
    team_id: Option<String>,
    dataset_identifier: Option<String>,
    add_to_existing: bool,
}

impl MultipartMeta {
    fn absorb(&mut self, name: &str, text: String) {
        match name {
            "dataset_name" => self.dataset_name = Some(text),
            "sensor" => self.sensor = Some(text),
            "convert" => self.convert = parse_bool(&text),
            "is_public" => self.is_public = parse_bool(&text),
            "is_downloadable" => self.is_downloadable = Some(text),
            "folder" if !text.is_empty() => self.folder = Some(text),
            "tags" => {
                self.tags = text
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "description" if !text.is_empty() => self.description = Some(text),
            "team_id" if !text.is_empty() => self.team_id = Some(text),
            "dataset_identifier" if !text.is_empty() => self.dataset_identifier = Some(text),
            "add_to_existing" => self.add_to_existing = parse_bool(&text).unwrap_or(false),
            _ => {}
        }
    }

    fn into_meta(self) -> Result<IngestMeta, AppError> {
        Ok(IngestMeta {
            dataset_name: self
                .dataset_name
                .ok_or_else(|| AppError::Validation("dataset_name is required".into()))?,
            sensor: self
                .sensor
                .ok_or_else(|| AppError::Validation("sensor is required".into()))?,
            convert: self.convert.unwrap_or(true),
            is_public: self.is_public.unwrap_or(false),
            is_downloadable: self
                .is_downloadable
                .unwrap_or_else(|| "only_owner".to_string()),
            folder: self.folder,
            tags: self.tags,
            description: self.description,
            team_id: self.team_id,
            dataset_identifier: self.dataset_identifier,
            add_to_existing: self.add_to_existing,
        })
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    let message = e.to_string();
    if message.contains("length limit exceeded") {
        AppError::PayloadTooLarge("request body exceeds the configured limit".into())
    } else {
        AppError::Validation(message)
    }
}

#[utoipa::path(
    post,
    path = "/api/upload/upload",
    request_body(content = String, description = "Multipart: file + ingest metadata", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Upload accepted", body = IngestReceipt),
        (status = 400, description = "Validation failed or file requires chunked mode"),
        (status = 401, description = "Unauthorized"),
        (status = 413, description = "File exceeds the hard size limit")
    ),
    security(("bearer" = []))
)]
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<Json<IngestReceipt>, AppError> {
    let mut meta = MultipartMeta::default();
    let mut filename: Option<String> = None;
    let mut payload: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            filename = Some(field.file_name().unwrap_or("unnamed").to_string());
            payload = Some(field.bytes().await.map_err(multipart_error)?.to_vec());
        } else {
            let text = field.text().await.map_err(multipart_error)?;
            meta.absorb(&name, text);
        }
    }

    let filename = filename.ok_or_else(|| AppError::Validation("no file provided".into()))?;
    let payload = payload.ok_or_else(|| AppError::Validation("no file provided".into()))?;

    let receipt = state
        .ingest
        .whole_file_upload(&user, meta.into_meta()?, &filename, &payload)
        .await?;
    Ok(Json(receipt))
}

#[utoipa::path(
    post,
    path = "/api/upload/initiate-chunked",
    request_body = InitiateChunkedRequest,
    responses(
        (status = 200, description = "Session created", body = InitiateChunkedResponse),
        (status = 400, description = "Validation failed"),
        (status = 401, description = "Unauthorized")
    ),
    security(("bearer" = []))
)]
pub async fn initiate_chunked(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<InitiateChunkedRequest>,
) -> Result<Json<InitiateChunkedResponse>, AppError> {
    let response = state.ingest.initiate_chunked(&user, req).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/upload/chunk",
    request_body(content = String, description = "Multipart: upload_id, chunk_number, chunk, [chunk_hash]", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Chunk stored", body = ChunkReceipt),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Session not found"),
        (status = 422, description = "Chunk hash mismatch")
    ),
    security(("bearer" = []))
)]
pub async fn upload_chunk(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<Json<ChunkReceipt>, AppError> {
    let mut upload_id: Option<String> = None;
    let mut chunk_number: Option<i32> = None;
    let mut chunk_hash: Option<String> = None;
    let mut chunk: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name().unwrap_or_default() {
            "upload_id" => upload_id = Some(field.text().await.map_err(multipart_error)?),
            "chunk_number" => {
                let text = field.text().await.map_err(multipart_error)?;
                chunk_number = Some(text.parse().map_err(|_| {
                    AppError::Validation(format!("chunk_number must be an integer, got '{text}'"))
                })?);
            }
            "chunk_hash" => chunk_hash = Some(field.text().await.map_err(multipart_error)?),
            "chunk" => chunk = Some(field.bytes().await.map_err(multipart_error)?.to_vec()),
            _ => {}
        }
    }

    let upload_id =
        upload_id.ok_or_else(|| AppError::Validation("upload_id is required".into()))?;
    let chunk_number =
        chunk_number.ok_or_else(|| AppError::Validation("chunk_number is required".into()))?;
    let chunk = chunk.ok_or_else(|| AppError::Validation("no chunk provided".into()))?;

    let receipt = state
        .sessions
        .write_chunk(&user, &upload_id, chunk_number, &chunk, chunk_hash.as_deref())
        .await?;
    Ok(Json(receipt))
}

#[utoipa::path(
    post,
    path = "/api/upload/complete-chunked",
    request_body = CompleteChunkedRequest,
    responses(
        (status = 200, description = "File assembled and verified", body = CompletionReceipt),
        (status = 400, description = "Chunks missing"),
        (status = 409, description = "Completion already in progress"),
        (status = 422, description = "Overall hash mismatch")
    ),
    security(("bearer" = []))
)]
pub async fn complete_chunked(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<CompleteChunkedRequest>,
) -> Result<Json<CompletionReceipt>, AppError> {
    let receipt = state.sessions.complete(&user, &req.upload_id).await?;
    Ok(Json(receipt))
}

#[utoipa::path(
    get,
    path = "/api/upload/resume/{upload_id}",
    params(("upload_id" = String, Path, description = "Upload session id")),
    responses(
        (status = 200, description = "What is still missing", body = ResumeInfo),
        (status = 404, description = "Session not found")
    ),
    security(("bearer" = []))
)]
pub async fn resume_info(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(upload_id): Path<String>,
) -> Result<Json<ResumeInfo>, AppError> {
    let info = state.sessions.resume_info(&user, &upload_id).await?;
    Ok(Json(info))
}

#[utoipa::path(
    post,
    path = "/api/upload/initiate",
    request_body(content = String, description = "source_type + source_config + ingest metadata", content_type = "application/json"),
    responses(
        (status = 200, description = "Remote pull queued", body = IngestReceipt),
        (status = 400, description = "Unknown source type or validation failure")
    ),
    security(("bearer" = []))
)]
pub async fn initiate_remote(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<RemoteInitiateRequest>,
) -> Result<Json<IngestReceipt>, AppError> {
    let receipt = state.ingest.initiate_remote(&user, req).await?;
    Ok(Json(receipt))
}

#[utoipa::path(
    get,
    path = "/api/upload/status/{job_id}",
    params(("job_id" = String, Path, description = "Session id or dataset uuid")),
    responses(
        (status = 200, description = "Job progress", body = JobStatusResponse),
        (status = 404, description = "Job not found")
    ),
    security(("bearer" = []))
)]
pub async fn job_status(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let status = state.ingest.job_status(Some(&user), &job_id).await?;
    Ok(Json(status))
}

#[utoipa::path(
    post,
    path = "/api/upload/cancel/{job_id}",
    params(("job_id" = String, Path, description = "Session id or dataset uuid")),
    responses(
        (status = 200, description = "Cancelled, or already terminal"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "State changed mid-cancel; retry")
    ),
    security(("bearer" = []))
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.ingest.cancel(&user, &job_id).await?;
    Ok(Json(serde_json::json!({})))
}

#[utoipa::path(
    get,
    path = "/api/upload/jobs",
    params(
        ("limit" = Option<u64>, Query, description = "Page size, default 20"),
        ("offset" = Option<u64>, Query, description = "Page offset")
    ),
    responses(
        (status = 200, description = "The caller's jobs, newest first", body = Vec<JobStatusResponse>)
    ),
    security(("bearer" = []))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<JobStatusResponse>>, AppError> {
    let jobs = state
        .ingest
        .list_jobs(&user, page.limit.min(100), page.offset)
        .await?;
    Ok(Json(jobs))
}

#[utoipa::path(
    get,
    path = "/api/upload/supported-sources",
    responses((status = 200, description = "Remote source kinds this deployment accepts"))
)]
pub async fn supported_sources() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "sources": ["url", "s3", "google_drive"],
    }))
}

#[utoipa::path(
    get,
    path = "/api/upload/limits",
    responses((status = 200, description = "Size limits and accepted vocabularies", body = UploadLimits))
)]
pub async fn limits(State(state): State<AppState>) -> Json<UploadLimits> {
    Json(UploadLimits {
        max_file_size: state.config.max_file_size,
        single_upload_limit: state.config.single_upload_limit,
        chunk_size: state.config.chunk_size,
        sensors: crate::entities::datasets::SensorKind::ALL
            .iter()
            .map(|s| s.as_str())
            .collect(),
        download_scopes: vec!["only_owner", "only_team", "public"],
    })
}
