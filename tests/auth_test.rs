mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use scidata_ingest::create_app;
use tower::ServiceExt;

#[tokio::test]
async fn login_creates_profile_and_is_idempotent() {
    let (state, _dir) = test_state().await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            None,
            serde_json::json!({"email": "a@ex.com"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = json_body(response).await;

    assert_eq!(first["token_type"], "Bearer");
    assert_eq!(first["user"]["email"], "a@ex.com");
    assert!(first["expires_in"].as_i64().unwrap() > 0);
    let user_id = first["user"]["user_id"].as_str().unwrap().to_string();

    // a second login binds the same profile
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            None,
            serde_json::json!({"email": "a@ex.com"}),
        ))
        .await
        .unwrap();
    let second = json_body(response).await;
    assert_eq!(second["user"]["user_id"].as_str().unwrap(), user_id);
}

#[tokio::test]
async fn login_rejects_garbage_email() {
    let (state, _dir) = test_state().await;
    let app = create_app(state);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            None,
            serde_json::json!({"email": "not-an-email"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn me_requires_and_honors_bearer_token() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/auth/me")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/auth/me")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["email"], "a@ex.com");
}

#[tokio::test]
async fn logout_revokes_the_presented_token() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/logout")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the revoked secret no longer authenticates even though its envelope
    // is still unexpired
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/auth/me")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_mints_a_working_access_token() {
    let (state, _dir) = test_state().await;
    let pair = state.token_service.login("a@ex.com", None).await.unwrap();
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/refresh",
            None,
            serde_json::json!({"refresh_token": pair.refresh_token}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let new_access = body["access_token"].as_str().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/auth/me")
                .header("Authorization", format!("Bearer {new_access}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn access_token_cannot_be_used_as_refresh_token() {
    let (state, _dir) = test_state().await;
    let pair = state.token_service.login("a@ex.com", None).await.unwrap();
    let app = create_app(state);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/auth/refresh",
            None,
            serde_json::json!({"refresh_token": pair.access_token}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_status_accepts_cookie_fallback() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/auth/status")
                .header("Cookie", format!("access_token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["authenticated"], true);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/auth/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["authenticated"], false);
}
