use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::auth::{CurrentUser, extract_token, optional_user};
use crate::services::token_service::{LoginResponse, RefreshResponse, UserPayload};
use axum::{
    Extension, Json,
    extract::State,
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Accepted for client compatibility; identity assertion happens at the
    /// deployment's edge.
    #[serde(default)]
    #[allow(dead_code)]
    pub password: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize, ToSchema)]
pub struct AuthStatusResponse {
    pub authenticated: bool,
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token pair issued", body = LoginResponse),
        (status = 400, description = "Invalid email")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let response = state
        .token_service
        .login(&payload.email, payload.name.as_deref())
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New access token", body = RefreshResponse),
        (status = 401, description = "Refresh token invalid or revoked")
    )
)]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AppError> {
    let response = state.token_service.refresh(&payload.refresh_token).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses(
        (status = 200, description = "Token revoked"),
        (status = 401, description = "Unauthorized")
    ),
    security(("bearer" = []))
)]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = extract_token(&headers)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;
    state.token_service.logout(&token).await?;
    Ok(Json(serde_json::json!({})))
}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "The authenticated profile", body = UserPayload),
        (status = 401, description = "Unauthorized")
    ),
    security(("bearer" = []))
)]
pub async fn me(
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Json<UserPayload> {
    Json(UserPayload {
        user_id: user.id,
        email: user.email,
        name: user.name,
        email_verified: user.email_verified,
    })
}

#[utoipa::path(
    get,
    path = "/api/auth/status",
    responses(
        (status = 200, description = "Whether the presented credentials are valid", body = AuthStatusResponse)
    )
)]
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<AuthStatusResponse> {
    let authenticated = optional_user(&state, &headers).await.is_some();
    Json(AuthStatusResponse { authenticated })
}
