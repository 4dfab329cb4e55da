use crate::AppState;
use crate::api::error::AppError;
use crate::entities::users;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    http::header,
    middleware::Next,
    response::Response,
};

/// The authenticated user attached to protected requests.
#[derive(Clone)]
pub struct CurrentUser(pub users::Model);

/// Extract the bearer secret from the Authorization header, falling back to
/// the `access_token` cookie for browser contexts.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }

    headers
        .get(header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|pair| pair.strip_prefix("access_token="))
                .map(str::to_string)
        })
}

/// Gate for protected routes: full token validation, then the resolved user
/// rides the request extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(req.headers())
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

    let user = state.token_service.validate(&token).await?;
    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}

/// Best-effort authentication for endpoints that also serve public data.
pub async fn optional_user(state: &AppState, headers: &HeaderMap) -> Option<users::Model> {
    let token = extract_token(headers)?;
    state.token_service.validate(&token).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer header-token"),
        );
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("access_token=cookie-token"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("header-token"));
    }

    #[test]
    fn cookie_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; access_token=tok123; lang=en"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("tok123"));
    }

    #[test]
    fn no_credentials() {
        assert_eq!(extract_token(&HeaderMap::new()), None);
    }
}
