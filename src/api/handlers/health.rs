use crate::AppState;
use axum::{Json, extract::State};
use sea_orm::ConnectionTrait;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub catalog: &'static str,
    pub version: &'static str,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service liveness", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let catalog = match state
        .db
        .execute_unprepared("SELECT 1")
        .await
    {
        Ok(_) => "ok",
        Err(_) => "unreachable",
    };

    Json(HealthResponse {
        status: "ok",
        catalog,
        version: env!("CARGO_PKG_VERSION"),
    })
}
