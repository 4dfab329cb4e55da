use crate::api::error::AppError;
use crate::catalog;
use crate::config::ServiceConfig;
use crate::entities::users;
use crate::utils::auth::{self, Claims, KIND_ACCESS, KIND_REFRESH};
use chrono::{Duration, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct UserPayload {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
}

#[derive(Serialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
    pub user: UserPayload,
}

#[derive(Serialize, ToSchema)]
pub struct RefreshResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

/// Issues, validates, refreshes, and revokes bearer tokens.
///
/// Tokens are signed envelopes (user id, expiry, kind) whose SHA-256 is
/// recorded on the owning profile, so a token is only accepted while its
/// descriptor exists, is unrevoked, and is unexpired.
pub struct TokenService {
    db: DatabaseConnection,
    config: ServiceConfig,
}

impl TokenService {
    pub fn new(db: DatabaseConnection, config: ServiceConfig) -> Self {
        Self { db, config }
    }

    /// Authenticate by email, creating the profile on first login.
    pub async fn login(&self, email: &str, name: Option<&str>) -> Result<LoginResponse, AppError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::Validation("a valid email is required".into()));
        }

        let user = catalog::users::find_or_create(&self.db, &email, name).await?;
        if !user.is_active {
            return Err(AppError::Forbidden("account is deactivated".into()));
        }

        let access_lifetime = Duration::hours(self.config.access_token_hours);
        let refresh_lifetime = Duration::days(self.config.refresh_token_days);

        let access_token = auth::create_token(
            &user.id,
            &user.email,
            KIND_ACCESS,
            access_lifetime,
            &self.config.jwt_secret,
        )?;
        let refresh_token = auth::create_token(
            &user.id,
            &user.email,
            KIND_REFRESH,
            refresh_lifetime,
            &self.config.jwt_secret,
        )?;

        catalog::tokens::insert(
            &self.db,
            &user.id,
            KIND_ACCESS,
            &auth::token_hash(&access_token),
            Utc::now() + access_lifetime,
        )
        .await?;
        catalog::tokens::insert(
            &self.db,
            &user.id,
            KIND_REFRESH,
            &auth::token_hash(&refresh_token),
            Utc::now() + refresh_lifetime,
        )
        .await?;

        catalog::users::touch_login(&self.db, &user).await?;
        tracing::info!(email = %user.email, "login issued token pair");

        Ok(LoginResponse {
            access_token,
            refresh_token,
            expires_in: access_lifetime.num_seconds(),
            token_type: "Bearer".to_string(),
            user: UserPayload {
                user_id: user.id,
                email: user.email,
                name: user.name,
                email_verified: user.email_verified,
            },
        })
    }

    /// Full validation of a presented secret: envelope signature and expiry,
    /// then the stored descriptor (known hash, unrevoked, unexpired).
    pub async fn validate(&self, token: &str) -> Result<users::Model, AppError> {
        let claims = self.validate_kind(token, KIND_ACCESS).await?;

        let user = catalog::users::find_by_id(&self.db, &claims.sub)
            .await?
            .ok_or_else(|| AppError::Unauthorized("unknown user".into()))?;
        if !user.is_active {
            return Err(AppError::Unauthorized("account is deactivated".into()));
        }

        catalog::users::touch_activity(&self.db, &user.id).await?;
        Ok(user)
    }

    /// Mint a new access token from a live refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, AppError> {
        let claims = self.validate_kind(refresh_token, KIND_REFRESH).await?;

        let access_lifetime = Duration::hours(self.config.access_token_hours);
        let access_token = auth::create_token(
            &claims.sub,
            &claims.email,
            KIND_ACCESS,
            access_lifetime,
            &self.config.jwt_secret,
        )?;

        catalog::tokens::insert(
            &self.db,
            &claims.sub,
            KIND_ACCESS,
            &auth::token_hash(&access_token),
            Utc::now() + access_lifetime,
        )
        .await?;

        Ok(RefreshResponse {
            access_token,
            expires_in: access_lifetime.num_seconds(),
            token_type: "Bearer".to_string(),
        })
    }

    /// Revoke exactly the presented token.
    pub async fn logout(&self, token: &str) -> Result<(), AppError> {
        let revoked = catalog::tokens::revoke_by_hash(&self.db, &auth::token_hash(token)).await?;
        if revoked == 0 {
            return Err(AppError::Unauthorized("unknown token".into()));
        }
        Ok(())
    }

    async fn validate_kind(&self, token: &str, expected_kind: &str) -> Result<Claims, AppError> {
        let claims = auth::validate_token(token, &self.config.jwt_secret)
            .map_err(|_| AppError::Unauthorized("invalid or expired token".into()))?;

        if claims.kind != expected_kind {
            return Err(AppError::Unauthorized(format!(
                "expected a {expected_kind} token"
            )));
        }

        let descriptor = catalog::tokens::find_by_hash(&self.db, &auth::token_hash(token))
            .await?
            .ok_or_else(|| AppError::Unauthorized("unknown token".into()))?;

        if descriptor.is_revoked {
            return Err(AppError::Unauthorized("token revoked".into()));
        }
        if descriptor.expires_at < Utc::now() {
            return Err(AppError::Unauthorized("token expired".into()));
        }

        catalog::tokens::touch_last_used(&self.db, &descriptor.id).await?;
        Ok(claims)
    }
}
