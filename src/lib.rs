pub mod api;
pub mod catalog;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod status;
pub mod utils;

use crate::config::ServiceConfig;
use crate::infrastructure::layout::IngestLayout;
use crate::services::ingest::IngestService;
use crate::services::token_service::TokenService;
use crate::services::upload_session::UploadSessionManager;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::auth::login,
        api::handlers::auth::refresh,
        api::handlers::auth::logout,
        api::handlers::auth::me,
        api::handlers::auth::status,
        api::handlers::upload::upload_file,
        api::handlers::upload::initiate_chunked,
        api::handlers::upload::upload_chunk,
        api::handlers::upload::complete_chunked,
        api::handlers::upload::resume_info,
        api::handlers::upload::initiate_remote,
        api::handlers::upload::job_status,
        api::handlers::upload::cancel_job,
        api::handlers::upload::list_jobs,
        api::handlers::upload::supported_sources,
        api::handlers::upload::limits,
        api::handlers::datasets::get_dataset,
        api::handlers::datasets::delete_dataset,
        api::handlers::datasets::list_datasets,
        api::handlers::datasets::queue_stats,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::auth::LoginRequest,
            api::handlers::auth::RefreshRequest,
            api::handlers::auth::AuthStatusResponse,
            api::handlers::upload::CompleteChunkedRequest,
            api::handlers::datasets::DatasetPayload,
            api::handlers::datasets::QueueStats,
            api::handlers::health::HealthResponse,
            crate::services::token_service::LoginResponse,
            crate::services::token_service::RefreshResponse,
            crate::services::token_service::UserPayload,
            crate::services::ingest::IngestMeta,
            crate::services::ingest::IngestReceipt,
            crate::services::ingest::InitiateChunkedRequest,
            crate::services::ingest::InitiateChunkedResponse,
            crate::services::ingest::JobStatusResponse,
            crate::services::upload_session::ChunkReceipt,
            crate::services::upload_session::ResumeInfo,
            crate::services::upload_session::CompletionReceipt,
            crate::services::remote::RemoteSource,
            crate::entities::datasets::FileEntry,
            crate::entities::datasets::SensorKind,
            crate::entities::datasets::DownloadScope,
            crate::utils::validation::UploadLimits,
        )
    ),
    tags(
        (name = "auth", description = "Login and token lifecycle"),
        (name = "upload", description = "Whole-file, chunked, and remote ingestion"),
        (name = "datasets", description = "Dataset queries"),
        (name = "system", description = "Health and capability discovery")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: ServiceConfig,
    pub layout: IngestLayout,
    pub token_service: Arc<TokenService>,
    pub ingest: Arc<IngestService>,
    pub sessions: Arc<UploadSessionManager>,
}

impl AppState {
    pub fn build(db: DatabaseConnection, config: ServiceConfig) -> Self {
        let layout = IngestLayout::new(config.ingest_root.clone());
        let token_service = Arc::new(TokenService::new(db.clone(), config.clone()));
        let ingest = Arc::new(IngestService::new(
            db.clone(),
            layout.clone(),
            config.clone(),
        ));
        let sessions = Arc::new(UploadSessionManager::new(
            db.clone(),
            layout.clone(),
            config.clone(),
            ingest.clone(),
        ));

        Self {
            db,
            config,
            layout,
            token_service,
            ingest,
            sessions,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let auth_middleware = from_fn_with_state(state.clone(), api::middleware::auth::auth_middleware);

    // 10 MiB of multipart framing slack on top of the payload limits
    let slack: usize = 10 * 1024 * 1024;

    let public_routes = Router::new()
        .route("/health", get(api::handlers::health::health_check))
        .route("/api/auth/login", post(api::handlers::auth::login))
        .route("/api/auth/refresh", post(api::handlers::auth::refresh))
        .route("/api/auth/status", get(api::handlers::auth::status))
        .route(
            "/api/v1/datasets/:identifier",
            get(api::handlers::datasets::get_dataset)
                .delete(api::handlers::datasets::delete_dataset),
        )
        .route(
            "/api/upload/supported-sources",
            get(api::handlers::upload::supported_sources),
        )
        .route("/api/upload/limits", get(api::handlers::upload::limits));

    let protected_routes = Router::new()
        .route("/api/auth/logout", post(api::handlers::auth::logout))
        .route("/api/auth/me", get(api::handlers::auth::me))
        .route(
            "/api/upload/upload",
            post(api::handlers::upload::upload_file).layer(DefaultBodyLimit::max(
                state.config.single_upload_limit as usize + slack,
            )),
        )
        .route(
            "/api/upload/initiate-chunked",
            post(api::handlers::upload::initiate_chunked),
        )
        .route(
            "/api/upload/chunk",
            post(api::handlers::upload::upload_chunk).layer(DefaultBodyLimit::max(
                state.config.chunk_size as usize + slack,
            )),
        )
        .route(
            "/api/upload/complete-chunked",
            post(api::handlers::upload::complete_chunked),
        )
        .route(
            "/api/upload/resume/:upload_id",
            get(api::handlers::upload::resume_info),
        )
        .route(
            "/api/upload/initiate",
            post(api::handlers::upload::initiate_remote),
        )
        .route(
            "/api/upload/status/:job_id",
            get(api::handlers::upload::job_status),
        )
        .route(
            "/api/upload/cancel/:job_id",
            post(api::handlers::upload::cancel_job),
        )
        .route("/api/upload/jobs", get(api::handlers::upload::list_jobs))
        .route(
            "/api/upload/queue/stats",
            get(api::handlers::datasets::queue_stats),
        )
        .route(
            "/api/v1/datasets",
            get(api::handlers::datasets::list_datasets),
        )
        .layer(auth_middleware);

    let cors = if state.config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
