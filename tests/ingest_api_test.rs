mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use scidata_ingest::create_app;
use tower::ServiceExt;

fn meta_fields<'a>(name: &'a str, convert: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        ("dataset_name", name),
        ("sensor", "TIFF"),
        ("convert", convert),
        ("tags", "microscopy, test"),
        ("description", "integration fixture"),
    ]
}

#[tokio::test]
async fn whole_file_happy_path() {
    let (state, dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let payload = vec![7u8; 64 * 1024];
    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("D1", "false"),
            Some(("file", "scan.tiff", &payload)),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = json_body(response).await;

    assert_eq!(receipt["upload_type"], "standard");
    // convert=false terminates the pipeline at done
    assert_eq!(receipt["status"], "done");
    let uuid = receipt["job_id"].as_str().unwrap();

    let on_disk = std::fs::read(dir.path().join("upload").join(uuid).join("scan.tiff")).unwrap();
    assert_eq!(on_disk, payload);

    // the job is pollable
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/upload/status/{uuid}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = json_body(response).await;
    assert_eq!(status["status"], "done");
    assert_eq!(status["bytes_total"].as_i64().unwrap(), payload.len() as i64);
}

#[tokio::test]
async fn convertible_upload_lands_in_the_conversion_queue() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("D-convert", "true"),
            Some(("file", "scan.tiff", &[1u8; 1024])),
        ))
        .await
        .unwrap();
    let receipt = json_body(response).await;
    assert_eq!(receipt["status"], "conversion queued");
}

#[tokio::test]
async fn oversized_single_upload_is_directed_to_chunked_mode() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let single_limit = state.config.single_upload_limit as usize;
    let app = create_app(state);

    let payload = vec![0u8; single_limit + 1];
    let response = app
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("D-big", "true"),
            Some(("file", "big.bin", &payload)),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("chunked"));
}

#[tokio::test]
async fn zero_byte_upload_is_rejected() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("D-zero", "true"),
            Some(("file", "empty.bin", &[])),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn add_to_existing_appends_without_changing_identity() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("D2", "false"),
            Some(("file", "f1.tiff", &[1u8; 512])),
        ))
        .await
        .unwrap();
    let first = json_body(response).await;
    let uuid = first["job_id"].as_str().unwrap().to_string();

    let fields = vec![
        ("dataset_name", "ignored"),
        ("sensor", "TIFF"),
        ("dataset_identifier", "D2"),
        ("add_to_existing", "true"),
    ];
    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &fields,
            Some(("file", "f2.tiff", &[2u8; 512])),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second = json_body(response).await;
    assert_eq!(second["job_id"].as_str().unwrap(), uuid);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/datasets/{uuid}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let dataset = json_body(response).await;
    let files: Vec<String> = dataset["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["filename"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(files, vec!["f1.tiff", "f2.tiff"]);
}

#[tokio::test]
async fn all_four_identifier_forms_resolve_to_the_same_record() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "amy@lab.edu").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("My Data", "false"),
            Some(("file", "f.tiff", &[3u8; 128])),
        ))
        .await
        .unwrap();
    let receipt = json_body(response).await;
    let uuid = receipt["job_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/datasets/{uuid}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let by_uuid = json_body(response).await;

    let slug = by_uuid["slug"].as_str().unwrap().to_string();
    let numeric_id = by_uuid["numeric_id"].as_i64().unwrap();
    let year = chrono::Datelike::year(&chrono::Utc::now());
    assert_eq!(slug, format!("amy-my-data-{year}"));
    assert!((10_000..=99_999).contains(&numeric_id));

    for identifier in [slug.clone(), numeric_id.to_string(), "My%20Data".to_string()] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/datasets/{identifier}"))
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "lookup by {identifier}");
        let body = json_body(response).await;
        assert_eq!(body["uuid"].as_str().unwrap(), uuid, "lookup by {identifier}");
    }
}

#[tokio::test]
async fn private_datasets_need_credentials_public_ones_do_not() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    // private
    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("D-private", "false"),
            Some(("file", "f.tiff", &[0u8; 64])),
        ))
        .await
        .unwrap();
    let private_uuid = json_body(response).await["job_id"].as_str().unwrap().to_string();

    // public
    let mut fields = meta_fields("D-public", "false");
    fields.push(("is_public", "true"));
    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &fields,
            Some(("file", "f.tiff", &[0u8; 64])),
        ))
        .await
        .unwrap();
    let public_uuid = json_body(response).await["job_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/datasets/{private_uuid}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/datasets/{public_uuid}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cancel_is_idempotent_on_terminal_datasets() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &token,
            &meta_fields("D-cancel", "true"),
            Some(("file", "f.tiff", &[0u8; 64])),
        ))
        .await
        .unwrap();
    let uuid = json_body(response).await["job_id"].as_str().unwrap().to_string();

    // queued -> cancelled
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/upload/cancel/{uuid}"),
            Some(&token),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/upload/status/{uuid}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "cancelled");

    // cancelling a terminal dataset is a no-op, not an error
    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/api/upload/cancel/{uuid}"),
            Some(&token),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn remote_url_ingest_is_queued_for_the_worker_pool() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/upload/initiate",
            Some(&token),
            serde_json::json!({
                "source_type": "url",
                "source_config": {"url": "https://example.com/data.nc"},
                "dataset_name": "D-remote",
                "sensor": "NETCDF",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = json_body(response).await;
    assert_eq!(receipt["upload_type"], "remote");
    assert_eq!(receipt["status"], "upload queued");

    // bucket-style sources land via the sync path
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/upload/initiate",
            Some(&token),
            serde_json::json!({
                "source_type": "s3",
                "source_config": {"bucket": "b", "key": "k/data.h5"},
                "dataset_name": "D-remote-s3",
                "sensor": "HDF5",
            }),
        ))
        .await
        .unwrap();
    let receipt = json_body(response).await;
    assert_eq!(receipt["status"], "sync queued");
}

#[tokio::test]
async fn unknown_remote_source_kind_is_rejected_at_the_boundary() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/upload/initiate",
            Some(&token),
            serde_json::json!({
                "source_type": "ftp",
                "source_config": {"url": "ftp://example.com/x"},
                "dataset_name": "D-ftp",
                "sensor": "OTHER",
            }),
        ))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn duplicate_dataset_name_per_owner_is_refused() {
    let (state, _dir) = test_state().await;
    let token = login(&state, "a@ex.com").await;
    let app = create_app(state);

    for expected in [StatusCode::OK, StatusCode::BAD_REQUEST] {
        let response = app
            .clone()
            .oneshot(multipart_request(
                "/api/upload/upload",
                &token,
                &meta_fields("D-dup", "false"),
                Some(("file", "f.tiff", &[0u8; 32])),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), expected);
    }
}

#[tokio::test]
async fn delete_is_owner_only_and_hides_the_dataset() {
    let (state, _dir) = test_state().await;
    let owner_token = login(&state, "a@ex.com").await;
    let other_token = login(&state, "b@ex.com").await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(multipart_request(
            "/api/upload/upload",
            &owner_token,
            &meta_fields("D-delete", "false"),
            Some(("file", "f.tiff", &[0u8; 64])),
        ))
        .await
        .unwrap();
    let uuid = json_body(response).await["job_id"].as_str().unwrap().to_string();

    // no credentials at all
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/datasets/{uuid}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // somebody else's credentials
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/datasets/{uuid}"))
                .header("Authorization", format!("Bearer {other_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // the owner succeeds
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/datasets/{uuid}"))
                .header("Authorization", format!("Bearer {owner_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the record is gone from every read path, the owner's included
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/datasets/{uuid}"))
                .header("Authorization", format!("Bearer {owner_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // deleting again finds nothing
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/datasets/{uuid}"))
                .header("Authorization", format!("Bearer {owner_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn capability_discovery_reports_limits_and_sources() {
    let (state, _dir) = test_state().await;
    let chunk = state.config.chunk_size;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/upload/limits")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let limits = json_body(response).await;
    assert_eq!(limits["chunk_size"].as_u64().unwrap(), chunk);
    assert!(limits["sensors"]
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s == "4D_NEXUS"));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/upload/supported-sources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let sources = json_body(response).await;
    assert_eq!(
        sources["sources"],
        serde_json::json!(["url", "s3", "google_drive"])
    );
}
