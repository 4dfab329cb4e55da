use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::auth::{CurrentUser, optional_user};
use crate::catalog;
use crate::entities::datasets::{self, FileEntry};
use crate::services::identifier;
use crate::services::ingest::{ensure_read_access, ensure_write_access};
use crate::status::DatasetStatus;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The public projection of a dataset record.
#[derive(Serialize, ToSchema)]
pub struct DatasetPayload {
    pub uuid: String,
    pub name: String,
    pub slug: String,
    pub numeric_id: i32,
    pub owner_email: String,
    pub team_id: Option<String>,
    pub sensor: String,
    pub convert: bool,
    pub is_public: bool,
    pub is_downloadable: String,
    pub status: String,
    pub files: Vec<FileEntry>,
    pub data_size_gb: Option<f64>,
    pub folder: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&datasets::Model> for DatasetPayload {
    fn from(dataset: &datasets::Model) -> Self {
        Self {
            uuid: dataset.uuid.clone(),
            name: dataset.name.clone(),
            slug: dataset.slug.clone(),
            numeric_id: dataset.numeric_id,
            owner_email: dataset.owner_email.clone(),
            team_id: dataset.team_id.clone(),
            sensor: dataset.sensor.clone(),
            convert: dataset.convert,
            is_public: dataset.is_public,
            is_downloadable: dataset.is_downloadable.clone(),
            status: dataset.status.clone(),
            files: dataset.file_entries(),
            data_size_gb: dataset.data_size_gb,
            folder: dataset.folder.clone(),
            tags: dataset.tag_list(),
            description: dataset.description.clone(),
            error_message: dataset.error_message.clone(),
            created_at: dataset.created_at,
            updated_at: dataset.updated_at,
        }
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    20
}

#[utoipa::path(
    get,
    path = "/api/v1/datasets/{identifier}",
    params(("identifier" = String, Path, description = "uuid, numeric id, slug, or name")),
    responses(
        (status = 200, description = "The dataset", body = DatasetPayload),
        (status = 400, description = "Ambiguous name; use the uuid"),
        (status = 403, description = "Not public and not yours"),
        (status = 404, description = "No such dataset")
    )
)]
pub async fn get_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_identifier): Path<String>,
) -> Result<Json<DatasetPayload>, AppError> {
    let user = optional_user(&state, &headers).await;
    let owner_hint = user.as_ref().map(|u| u.email.as_str());

    let dataset = identifier::resolve(&state.db, &raw_identifier, owner_hint).await?;
    ensure_read_access(user.as_ref(), &dataset)?;

    Ok(Json(DatasetPayload::from(&dataset)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/datasets/{identifier}",
    params(("identifier" = String, Path, description = "uuid, numeric id, slug, or name")),
    responses(
        (status = 200, description = "Dataset deleted"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Only the owner may delete"),
        (status = 404, description = "No such dataset")
    ),
    security(("bearer" = []))
)]
pub async fn delete_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_identifier): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = optional_user(&state, &headers)
        .await
        .ok_or_else(|| AppError::Unauthorized("authentication required".into()))?;

    let dataset = identifier::resolve(&state.db, &raw_identifier, Some(&user.email)).await?;
    ensure_write_access(&user, &dataset)?;

    let removed =
        catalog::datasets::soft_delete(&state.db, &dataset.uuid, &dataset.owner_email).await?;
    if removed == 0 {
        return Err(AppError::NotFound(format!(
            "dataset not found: {raw_identifier}"
        )));
    }

    tracing::info!(dataset = %dataset.uuid, by = %user.email, "dataset deleted");
    Ok(Json(serde_json::json!({})))
}

#[utoipa::path(
    get,
    path = "/api/v1/datasets",
    params(
        ("status" = Option<String>, Query, description = "Filter by lifecycle status"),
        ("limit" = Option<u64>, Query, description = "Page size, default 20"),
        ("offset" = Option<u64>, Query, description = "Page offset")
    ),
    responses(
        (status = 200, description = "The caller's datasets, newest first", body = Vec<DatasetPayload>)
    ),
    security(("bearer" = []))
)]
pub async fn list_datasets(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DatasetPayload>>, AppError> {
    let status = match &query.status {
        Some(raw) => Some(
            DatasetStatus::parse(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };

    let datasets = catalog::datasets::list_by_owner(
        &state.db,
        &user.email,
        status,
        query.limit.min(100),
        query.offset,
    )
    .await?;

    Ok(Json(datasets.iter().map(DatasetPayload::from).collect()))
}

#[derive(Serialize, ToSchema)]
pub struct QueueStats {
    pub counts: std::collections::BTreeMap<String, u64>,
}

#[utoipa::path(
    get,
    path = "/api/upload/queue/stats",
    responses((status = 200, description = "Dataset counts per lifecycle status", body = QueueStats)),
    security(("bearer" = []))
)]
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, AppError> {
    let mut counts = std::collections::BTreeMap::new();
    for status in [
        DatasetStatus::Submitted,
        DatasetStatus::UploadQueued,
        DatasetStatus::Uploading,
        DatasetStatus::Unzipping,
        DatasetStatus::SyncQueued,
        DatasetStatus::Syncing,
        DatasetStatus::ConversionQueued,
        DatasetStatus::Converting,
        DatasetStatus::Done,
        DatasetStatus::UploadError,
        DatasetStatus::SyncError,
        DatasetStatus::ConversionError,
        DatasetStatus::ConversionFailed,
        DatasetStatus::Cancelled,
    ] {
        let count = catalog::datasets::count_by_status(&state.db, status).await?;
        if count > 0 {
            counts.insert(status.as_str().to_string(), count);
        }
    }
    Ok(Json(QueueStats { counts }))
}
