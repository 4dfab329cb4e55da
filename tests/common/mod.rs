#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use scidata_ingest::AppState;
use scidata_ingest::config::ServiceConfig;
use scidata_ingest::infrastructure::database::ensure_schema;
use scidata_ingest::infrastructure::layout::IngestLayout;
use sea_orm::Database;
use serde_json::Value;
use tempfile::TempDir;

/// Fresh state against an in-memory catalog and a throwaway ingest root.
pub async fn test_state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let db = Database::connect("sqlite::memory:").await.unwrap();
    ensure_schema(&db).await.unwrap();

    let config = ServiceConfig::development(dir.path().to_path_buf());
    IngestLayout::new(dir.path()).ensure_roots().await.unwrap();

    (AppState::build(db, config), dir)
}

/// Log a user in and return their access token.
pub async fn login(state: &AppState, email: &str) -> String {
    state
        .token_service
        .login(email, None)
        .await
        .unwrap()
        .access_token
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub const BOUNDARY: &str = "---------------------------424242424242424242424242424";

/// Assemble a multipart/form-data body from text fields plus one binary file
/// part.
pub fn multipart_body(
    fields: &[(&str, &str)],
    file_field: Option<(&str, &str, &[u8])>,
) -> (String, Vec<u8>) {
    let mut body: Vec<u8> = Vec::new();

    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }

    if let Some((name, filename, bytes)) = file_field {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    (
        format!("multipart/form-data; boundary={BOUNDARY}"),
        body,
    )
}

pub fn multipart_request(
    uri: &str,
    token: &str,
    fields: &[(&str, &str)],
    file_field: Option<(&str, &str, &[u8])>,
) -> Request<Body> {
    let (content_type, body) = multipart_body(fields, file_field);
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", content_type)
        .body(Body::from(body))
        .unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
