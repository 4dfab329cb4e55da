use crate::api::error::AppError;
use crate::catalog;
use crate::config::ServiceConfig;
use crate::entities::datasets::{self, DownloadScope, FileEntry, SensorKind};
use crate::entities::{upload_sessions, users};
use crate::infrastructure::layout::{IngestLayout, sanitize_filename};
use crate::services::identifier;
use crate::services::remote::RemoteSource;
use crate::status::{DatasetStatus, SessionState};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Metadata carried by every ingest request, whichever mode it uses.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct IngestMeta {
    #[validate(length(min = 1, max = 128))]
    pub dataset_name: String,
    #[validate(custom(function = "crate::utils::validation::validate_sensor"))]
    pub sensor: String,
    #[serde(default = "default_convert")]
    pub convert: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default = "default_download_scope")]
    #[validate(custom(function = "crate::utils::validation::validate_download_scope"))]
    pub is_downloadable: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    #[validate(length(max = 4096))]
    pub description: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    /// Any of the four identifier forms; required with `add_to_existing`.
    #[serde(default)]
    pub dataset_identifier: Option<String>,
    #[serde(default)]
    pub add_to_existing: bool,
}

fn default_convert() -> bool {
    true
}

fn default_download_scope() -> String {
    DownloadScope::OnlyOwner.as_str().to_string()
}

#[derive(Serialize, ToSchema)]
pub struct IngestReceipt {
    pub job_id: String,
    pub status: String,
    pub upload_type: String,
    pub estimated_duration: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct InitiateChunkedRequest {
    #[validate(length(min = 1, max = 255))]
    pub filename: String,
    pub file_size: i64,
    /// Expected SHA-256 of the whole file, verified at completion.
    #[serde(default)]
    pub file_hash: Option<String>,
    /// Expected SHA-256 per chunk, index order.
    #[serde(default)]
    pub chunk_hashes: Option<Vec<String>>,
    #[serde(flatten)]
    #[validate(nested)]
    pub meta: IngestMeta,
}

#[derive(Serialize, ToSchema)]
pub struct InitiateChunkedResponse {
    pub upload_id: String,
    pub chunk_size: i64,
    pub total_chunks: i32,
}

#[derive(Debug, Deserialize)]
pub struct RemoteInitiateRequest {
    #[serde(flatten)]
    pub source: RemoteSource,
    #[serde(flatten)]
    pub meta: IngestMeta,
}

#[derive(Serialize, ToSchema)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub progress_percentage: f64,
    pub bytes_uploaded: i64,
    pub bytes_total: i64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Accepts whole-file, chunked, and remote-source ingests. All three share
/// the same postlude: persist bytes, advance the status machine, hand back a
/// job handle the client can poll.
pub struct IngestService {
    db: DatabaseConnection,
    layout: IngestLayout,
    config: ServiceConfig,
}

impl IngestService {
    pub fn new(db: DatabaseConnection, layout: IngestLayout, config: ServiceConfig) -> Self {
        Self { db, layout, config }
    }

    /// Whole-file content upload. Files above the single-upload threshold
    /// must use chunked mode instead.
    pub async fn whole_file_upload(
        &self,
        user: &users::Model,
        meta: IngestMeta,
        filename: &str,
        data: &[u8],
    ) -> Result<IngestReceipt, AppError> {
        meta.validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        let filename = sanitize_filename(filename).map_err(|e| AppError::Validation(e.to_string()))?;

        if data.is_empty() {
            return Err(AppError::Validation("zero-size files are rejected".into()));
        }
        if data.len() as u64 > self.config.max_file_size {
            return Err(AppError::PayloadTooLarge(format!(
                "file exceeds the {} byte limit",
                self.config.max_file_size
            )));
        }
        if data.len() as u64 > self.config.single_upload_limit {
            return Err(AppError::Validation(format!(
                "files above {} bytes must use the chunked upload endpoints",
                self.config.single_upload_limit
            )));
        }

        let (dataset, created) = self.resolve_target(user, &meta).await?;

        if created {
            self.cas(&dataset.uuid, DatasetStatus::Submitted, DatasetStatus::UploadQueued)
                .await?;
            self.cas(&dataset.uuid, DatasetStatus::UploadQueued, DatasetStatus::Uploading)
                .await?;
        }

        let size = self
            .layout
            .write_whole_file(&dataset.uuid, &filename, data)
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;

        catalog::datasets::append_file(
            &self.db,
            &dataset.uuid,
            FileEntry {
                filename: filename.clone(),
                size_bytes: size,
                uploaded_at: Utc::now(),
                relative_path: filename.clone(),
            },
        )
        .await
        .map_err(AppError::Anyhow)?;

        let status = if created {
            self.advance_after_upload(&dataset.uuid).await?
        } else {
            DatasetStatus::parse(&dataset.status).unwrap_or(DatasetStatus::Done)
        };

        tracing::info!(
            dataset = %dataset.uuid,
            file = %filename,
            bytes = size,
            "whole-file upload accepted"
        );

        Ok(IngestReceipt {
            job_id: dataset.uuid,
            status: status.as_str().to_string(),
            upload_type: "standard".to_string(),
            estimated_duration: "2-15 minutes".to_string(),
        })
    }

    /// Create the dataset and its upload session for a chunked transfer.
    pub async fn initiate_chunked(
        &self,
        user: &users::Model,
        req: InitiateChunkedRequest,
    ) -> Result<InitiateChunkedResponse, AppError> {
        req.validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        let filename =
            sanitize_filename(&req.filename).map_err(|e| AppError::Validation(e.to_string()))?;

        if req.file_size <= 0 {
            return Err(AppError::Validation("zero-size files are rejected".into()));
        }
        if req.file_size as u64 > self.config.max_file_size {
            return Err(AppError::PayloadTooLarge(format!(
                "file exceeds the {} byte limit",
                self.config.max_file_size
            )));
        }

        let chunk_size = self.config.chunk_size as i64;
        let total_chunks = (req.file_size as u64).div_ceil(chunk_size as u64) as i32;

        if let Some(hashes) = &req.chunk_hashes {
            if hashes.len() as i32 != total_chunks {
                return Err(AppError::Validation(format!(
                    "declared {} chunk hashes for {} chunks",
                    hashes.len(),
                    total_chunks
                )));
            }
        }
        if let Some(hash) = &req.file_hash {
            crate::utils::validation::validate_sha256_hex(hash)
                .map_err(|_| AppError::Validation("file_hash must be SHA-256 hex".into()))?;
        }

        let (dataset, created) = self.resolve_target(user, &req.meta).await?;

        if created {
            self.cas(&dataset.uuid, DatasetStatus::Submitted, DatasetStatus::UploadQueued)
                .await?;
            self.cas(&dataset.uuid, DatasetStatus::UploadQueued, DatasetStatus::Uploading)
                .await?;
        }

        let session = upload_sessions::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            dataset_uuid: Set(dataset.uuid.clone()),
            owner_email: Set(user.email.clone()),
            filename: Set(filename),
            total_size: Set(req.file_size),
            chunk_size: Set(chunk_size),
            total_chunks: Set(total_chunks),
            received_chunks: Set(serde_json::json!([])),
            chunk_hashes: Set(req.chunk_hashes.map(|h| serde_json::json!(h))),
            overall_hash: Set(req.file_hash),
            state: Set(SessionState::Open.as_str().to_string()),
            created_at: Set(Utc::now()),
            expires_at: Set(Utc::now() + chrono::Duration::hours(self.config.session_ttl_hours)),
        };

        let session = catalog::sessions::insert(&self.db, session).await?;

        tracing::info!(
            session = %session.id,
            dataset = %session.dataset_uuid,
            chunks = total_chunks,
            "chunked upload initiated"
        );

        Ok(InitiateChunkedResponse {
            upload_id: session.id,
            chunk_size,
            total_chunks,
        })
    }

    /// Register a remote-source pull to be executed by the worker pool.
    pub async fn initiate_remote(
        &self,
        user: &users::Model,
        req: RemoteInitiateRequest,
    ) -> Result<IngestReceipt, AppError> {
        req.meta
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let (dataset, created) = self.resolve_target(user, &req.meta).await?;
        if !created {
            return Err(AppError::Validation(
                "remote sources cannot append to an existing dataset".into(),
            ));
        }

        let source_json =
            serde_json::to_value(&req.source).map_err(|e| AppError::Internal(e.to_string()))?;
        catalog::datasets::set_remote_source(&self.db, &dataset.uuid, source_json).await?;

        let queued = if req.source.needs_sync_landing() {
            DatasetStatus::SyncQueued
        } else {
            DatasetStatus::UploadQueued
        };
        self.cas(&dataset.uuid, DatasetStatus::Submitted, queued).await?;

        tracing::info!(
            dataset = %dataset.uuid,
            source = req.source.source_kind(),
            "remote ingest queued"
        );

        Ok(IngestReceipt {
            job_id: dataset.uuid,
            status: queued.as_str().to_string(),
            upload_type: "remote".to_string(),
            estimated_duration: "5-30 minutes".to_string(),
        })
    }

    /// Shared postlude once a dataset's bytes are fully on disk: run the
    /// unzip stage when the upload produced archives, then queue conversion
    /// or finish.
    pub async fn advance_after_upload(&self, dataset_uuid: &str) -> Result<DatasetStatus, AppError> {
        let dataset = catalog::datasets::get_by_uuid(&self.db, dataset_uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dataset not found: {dataset_uuid}")))?;

        let from = DatasetStatus::parse(&dataset.status)
            .ok_or_else(|| AppError::Internal(format!("corrupt status on {dataset_uuid}")))?;

        // appends to an already-finished dataset record the bytes but do not
        // reopen its lifecycle
        if from.is_terminal() {
            return Ok(from);
        }

        let upload_dir = self.layout.upload_dir(dataset_uuid);
        let archives = list_archives(&upload_dir).await;

        let mut current = from;
        if !archives.is_empty() {
            if !self.try_cas(dataset_uuid, current, DatasetStatus::Unzipping).await? {
                return Err(AppError::StaleState(format!(
                    "dataset {dataset_uuid} moved away from {current}"
                )));
            }
            current = DatasetStatus::Unzipping;

            for archive in archives {
                let dest = upload_dir.clone();
                let result = tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
                    .await
                    .map_err(|e| AppError::Internal(e.to_string()))?;

                if let Err(e) = result {
                    catalog::datasets::set_error_message(&self.db, dataset_uuid, Some(&e.to_string()))
                        .await?;
                    self.cas(dataset_uuid, current, DatasetStatus::UploadError).await?;
                    return Ok(DatasetStatus::UploadError);
                }
            }
        }

        let next = if dataset.convert {
            DatasetStatus::ConversionQueued
        } else {
            DatasetStatus::Done
        };

        if !self.try_cas(dataset_uuid, current, next).await? {
            return Err(AppError::StaleState(format!(
                "dataset {dataset_uuid} moved away from {current}"
            )));
        }
        if next == DatasetStatus::ConversionQueued {
            catalog::datasets::reset_conversion_attempts(&self.db, dataset_uuid).await?;
        }
        Ok(next)
    }

    /// Job progress for either alias of a job id: upload session first, then
    /// dataset lifecycle.
    pub async fn job_status(
        &self,
        user: Option<&users::Model>,
        job_id: &str,
    ) -> Result<JobStatusResponse, AppError> {
        if let Some(session) = catalog::sessions::get(&self.db, job_id).await? {
            let owner = user.map(|u| u.email.as_str());
            if owner != Some(session.owner_email.as_str()) {
                return Err(AppError::Forbidden("not your upload session".into()));
            }
            return Ok(session_status(&session));
        }

        let dataset = catalog::datasets::get_by_uuid(&self.db, job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))?;
        ensure_read_access(user, &dataset)?;
        Ok(dataset_status(&dataset))
    }

    /// Cancel a job. Terminal datasets are left untouched; a running
    /// conversion is signalled through the cancel flag and reaped by its
    /// worker.
    pub async fn cancel(&self, user: &users::Model, job_id: &str) -> Result<(), AppError> {
        if let Some(session) = catalog::sessions::get_owned(&self.db, job_id, &user.email).await? {
            return self.cancel_session(&session).await;
        }

        let dataset = catalog::datasets::get_by_uuid(&self.db, job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))?;
        ensure_write_access(user, &dataset)?;

        let status = DatasetStatus::parse(&dataset.status)
            .ok_or_else(|| AppError::Internal(format!("corrupt status on {job_id}")))?;

        if status.is_terminal() {
            return Ok(());
        }

        match status {
            DatasetStatus::Converting | DatasetStatus::Syncing => {
                catalog::datasets::set_cancel_requested(&self.db, &dataset.uuid, true).await?;
                tracing::info!(dataset = %dataset.uuid, "cancel requested for running job");
                Ok(())
            }
            _ => {
                if self.try_cas(&dataset.uuid, status, DatasetStatus::Cancelled).await? {
                    Ok(())
                } else {
                    Err(AppError::StaleState(format!(
                        "dataset {job_id} changed state during cancel; retry"
                    )))
                }
            }
        }
    }

    async fn cancel_session(&self, session: &upload_sessions::Model) -> Result<(), AppError> {
        let state = SessionState::parse(&session.state)
            .ok_or_else(|| AppError::Internal("corrupt session state".into()))?;
        if state.is_terminal() {
            return Ok(());
        }

        catalog::sessions::set_state(&self.db, &session.id, SessionState::Aborted).await?;
        self.layout
            .remove_spool(&session.id)
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;

        // the dataset this session fed, if it never got other bytes, is dead
        let dataset = catalog::datasets::get_by_uuid(&self.db, &session.dataset_uuid).await?;
        if let Some(dataset) = dataset {
            if let Some(status) = DatasetStatus::parse(&dataset.status) {
                if !status.is_terminal() && dataset.file_entries().is_empty() {
                    let _ = self.try_cas(&dataset.uuid, status, DatasetStatus::Cancelled).await?;
                }
            }
        }
        Ok(())
    }

    /// The caller's jobs: in-flight upload sessions first, then dataset
    /// lifecycles, newest first.
    pub async fn list_jobs(
        &self,
        user: &users::Model,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<JobStatusResponse>, AppError> {
        let mut jobs: Vec<JobStatusResponse> =
            catalog::sessions::list_by_owner(&self.db, &user.email, limit, offset)
                .await?
                .iter()
                .filter(|s| s.state == SessionState::Open.as_str())
                .map(session_status)
                .collect();

        let datasets =
            catalog::datasets::list_by_owner(&self.db, &user.email, None, limit, offset).await?;
        jobs.extend(datasets.iter().map(dataset_status));
        Ok(jobs)
    }

    async fn cas(&self, uuid: &str, from: DatasetStatus, to: DatasetStatus) -> Result<(), AppError> {
        if self.try_cas(uuid, from, to).await? {
            Ok(())
        } else {
            Err(AppError::StaleState(format!(
                "dataset {uuid} is no longer {from}"
            )))
        }
    }

    async fn try_cas(
        &self,
        uuid: &str,
        from: DatasetStatus,
        to: DatasetStatus,
    ) -> Result<bool, AppError> {
        if !from.can_transition_to(to) {
            return Err(AppError::Internal(format!(
                "illegal transition {from} -> {to}"
            )));
        }
        Ok(catalog::datasets::compare_and_set_status(&self.db, uuid, from, to).await?)
    }

    /// Locate the ingest target: an existing dataset the caller may write
    /// to, or a freshly created record.
    async fn resolve_target(
        &self,
        user: &users::Model,
        meta: &IngestMeta,
    ) -> Result<(datasets::Model, bool), AppError> {
        if meta.add_to_existing {
            let identifier = meta
                .dataset_identifier
                .as_deref()
                .ok_or_else(|| {
                    AppError::Validation("add_to_existing requires dataset_identifier".into())
                })?;
            let dataset = identifier::resolve(&self.db, identifier, Some(&user.email)).await?;
            ensure_write_access(user, &dataset)?;
            return Ok((dataset, false));
        }

        let dataset = self.create_dataset(user, meta).await?;
        Ok((dataset, true))
    }

    async fn create_dataset(
        &self,
        user: &users::Model,
        meta: &IngestMeta,
    ) -> Result<datasets::Model, AppError> {
        let sensor = SensorKind::parse(&meta.sensor)
            .ok_or_else(|| AppError::Validation(format!("unknown sensor: {}", meta.sensor)))?;

        if catalog::datasets::get_by_owner_and_name(&self.db, &user.email, &meta.dataset_name)
            .await?
            .is_some()
        {
            return Err(AppError::Validation(format!(
                "you already have a dataset named '{}'",
                meta.dataset_name
            )));
        }

        let slug = identifier::mint_slug(&self.db, &meta.dataset_name, &user.email).await?;
        let mut numeric_id = identifier::next_numeric_id(&self.db).await?;

        // the numeric counter can collide under concurrent creates; walk
        // forward until the unique index accepts us
        for attempt in 0..5 {
            let model = datasets::ActiveModel {
                uuid: Set(Uuid::new_v4().to_string()),
                name: Set(meta.dataset_name.clone()),
                slug: Set(slug.clone()),
                numeric_id: Set(numeric_id),
                owner_email: Set(user.email.clone()),
                team_id: Set(meta.team_id.clone()),
                sensor: Set(sensor.as_str().to_string()),
                convert: Set(meta.convert),
                is_public: Set(meta.is_public),
                is_downloadable: Set(meta.is_downloadable.clone()),
                status: Set(DatasetStatus::Submitted.as_str().to_string()),
                files: Set(serde_json::json!([])),
                data_size_gb: Set(None),
                folder: Set(meta.folder.clone()),
                tags: Set(serde_json::json!(meta.tags)),
                description: Set(meta.description.clone()),
                error_message: Set(None),
                remote_source: Set(None),
                conversion_attempts: Set(0),
                conversion_duration_secs: Set(None),
                claimed_at: Set(None),
                cancel_requested: Set(false),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
                deleted_at: Set(None),
            };

            match catalog::datasets::insert(&self.db, model).await {
                Ok(dataset) => return Ok(dataset),
                Err(e) if attempt < 4 => {
                    tracing::warn!("dataset insert collision ({e}); reminting numeric id");
                    numeric_id = identifier::successor_numeric_id(Some(numeric_id));
                }
                Err(e) => return Err(AppError::Database(e)),
            }
        }
        unreachable!()
    }
}

pub fn ensure_read_access(
    user: Option<&users::Model>,
    dataset: &datasets::Model,
) -> Result<(), AppError> {
    if dataset.is_public {
        return Ok(());
    }
    let Some(user) = user else {
        return Err(AppError::Unauthorized("authentication required".into()));
    };
    if dataset.owner_email == user.email {
        return Ok(());
    }
    if same_team(user, dataset) {
        return Ok(());
    }
    Err(AppError::Forbidden("no access to this dataset".into()))
}

pub fn ensure_write_access(user: &users::Model, dataset: &datasets::Model) -> Result<(), AppError> {
    if dataset.owner_email == user.email || same_team(user, dataset) {
        return Ok(());
    }
    Err(AppError::Forbidden(
        "only the owner or their team may modify this dataset".into(),
    ))
}

fn same_team(user: &users::Model, dataset: &datasets::Model) -> bool {
    match (&user.team_id, &dataset.team_id) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn session_status(session: &upload_sessions::Model) -> JobStatusResponse {
    let received = session.received_set().len() as i64;
    let bytes_uploaded = (received * session.chunk_size).min(session.total_size);
    let progress = if session.total_chunks == 0 {
        0.0
    } else {
        received as f64 / session.total_chunks as f64 * 100.0
    };

    JobStatusResponse {
        job_id: session.id.clone(),
        status: session.state.clone(),
        progress_percentage: progress,
        bytes_uploaded,
        bytes_total: session.total_size,
        message: Some(format!(
            "{received}/{} chunks received",
            session.total_chunks
        )),
        error: None,
        created_at: session.created_at,
        updated_at: session.created_at,
    }
}

fn dataset_status(dataset: &datasets::Model) -> JobStatusResponse {
    let total: i64 = dataset.file_entries().iter().map(|f| f.size_bytes).sum();
    let status = DatasetStatus::parse(&dataset.status);
    let progress = match status {
        Some(s) if s.is_terminal() => 100.0,
        Some(DatasetStatus::Converting) => 75.0,
        Some(DatasetStatus::ConversionQueued) => 50.0,
        _ => 25.0,
    };

    JobStatusResponse {
        job_id: dataset.uuid.clone(),
        status: dataset.status.clone(),
        progress_percentage: progress,
        bytes_uploaded: total,
        bytes_total: total,
        message: None,
        error: dataset.error_message.clone(),
        created_at: dataset.created_at,
        updated_at: dataset.updated_at,
    }
}

async fn list_archives(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut archives = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
            {
                archives.push(path);
            }
        }
    }
    archives
}

/// Extract one archive into `dest`, refusing entries that escape it.
fn extract_zip(archive: &Path, dest: &Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut extracted = 0usize;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            anyhow::bail!("archive entry escapes the dataset directory: {}", entry.name());
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }

    Ok(extracted)
}
