mod common;

use common::*;
use scidata_ingest::AppState;
use scidata_ingest::catalog;
use scidata_ingest::entities::datasets::SensorKind;
use scidata_ingest::services::converters::{ConverterRegistry, ConverterSpec};
use scidata_ingest::services::dispatcher::Dispatcher;
use scidata_ingest::services::ingest::IngestMeta;
use scidata_ingest::services::remote::FetcherRegistry;
use scidata_ingest::status::DatasetStatus;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn meta(name: &str, sensor: &str) -> IngestMeta {
    serde_json::from_value(serde_json::json!({
        "dataset_name": name,
        "sensor": sensor,
        "convert": true,
    }))
    .unwrap()
}

/// Drop a small shell script into the ingest root and return its path.
fn write_converter(dir: &TempDir, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn registry_with(sensor: SensorKind, executable: String) -> ConverterRegistry {
    let mut registry = ConverterRegistry::default();
    registry.register(ConverterSpec {
        sensor,
        executable,
        timeout_minutes: 1,
        extra_params: None,
    });
    registry
}

fn spawn_dispatcher(
    state: &AppState,
    registry: ConverterRegistry,
) -> (tokio::sync::watch::Sender<bool>, Vec<tokio::task::JoinHandle<()>>) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(
        state.db.clone(),
        state.layout.clone(),
        state.config.clone(),
        registry,
        FetcherRegistry::default(),
        state.ingest.clone(),
        state.sessions.clone(),
    ));
    let handles = dispatcher.spawn(rx);
    (tx, handles)
}

async fn queue_dataset(state: &AppState, name: &str, sensor: &str) -> String {
    let user = catalog::users::find_or_create(&state.db, "worker@ex.com", None)
        .await
        .unwrap();
    let receipt = state
        .ingest
        .whole_file_upload(&user, meta(name, sensor), "input.tiff", &[9u8; 4096])
        .await
        .unwrap();
    assert_eq!(receipt.status, "conversion queued");
    receipt.job_id
}

async fn wait_for_status(state: &AppState, uuid: &str, expected: DatasetStatus, secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let dataset = catalog::datasets::get_by_uuid(&state.db, uuid)
            .await
            .unwrap()
            .unwrap();
        if dataset.status == expected.as_str() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "dataset {uuid} stuck in '{}', expected '{expected}'",
                dataset.status
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test]
async fn successful_conversion_publishes_done() {
    let (state, dir) = test_state().await;
    let uuid = queue_dataset(&state, "W-ok", "TIFF").await;

    // converter writes one artifact into its output dir and succeeds
    let script = write_converter(&dir, "ok.sh", "echo tiled > \"$2/index.bin\"");
    let (tx, handles) = spawn_dispatcher(&state, registry_with(SensorKind::Tiff, script));

    wait_for_status(&state, &uuid, DatasetStatus::Done, 15).await;

    let dataset = catalog::datasets::get_by_uuid(&state.db, &uuid)
        .await
        .unwrap()
        .unwrap();
    assert!(dataset.conversion_duration_secs.is_some());
    assert!(dataset.error_message.is_none());
    assert!(dir.path().join("converted").join(&uuid).join("index.bin").exists());

    let _ = tx.send(true);
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn failing_converter_retries_then_fails_permanently() {
    let (state, dir) = test_state().await;
    let uuid = queue_dataset(&state, "W-fail", "TIFF").await;

    let script = write_converter(&dir, "fail.sh", "echo boom >&2; exit 1");
    let (tx, handles) = spawn_dispatcher(&state, registry_with(SensorKind::Tiff, script));

    wait_for_status(&state, &uuid, DatasetStatus::ConversionFailed, 30).await;

    let dataset = catalog::datasets::get_by_uuid(&state.db, &uuid)
        .await
        .unwrap()
        .unwrap();
    // default budget is two attempts
    assert_eq!(dataset.conversion_attempts, 2);
    let message = dataset.error_message.unwrap();
    assert!(message.contains("boom"), "error should carry stderr: {message}");

    let _ = tx.send(true);
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn empty_converter_output_counts_as_failure() {
    let (state, dir) = test_state().await;
    let uuid = queue_dataset(&state, "W-empty", "TIFF").await;

    let script = write_converter(&dir, "noop.sh", "exit 0");
    let (tx, handles) = spawn_dispatcher(&state, registry_with(SensorKind::Tiff, script));

    wait_for_status(&state, &uuid, DatasetStatus::ConversionFailed, 30).await;

    let dataset = catalog::datasets::get_by_uuid(&state.db, &uuid)
        .await
        .unwrap()
        .unwrap();
    assert!(dataset.error_message.unwrap().contains("no output"));

    let _ = tx.send(true);
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn unregistered_sensor_fails_without_burning_retries() {
    let (state, _dir) = test_state().await;
    let uuid = queue_dataset(&state, "W-other", "OTHER").await;

    // registry with no converter for OTHER
    let (tx, handles) = spawn_dispatcher(&state, ConverterRegistry::default());

    wait_for_status(&state, &uuid, DatasetStatus::ConversionFailed, 15).await;

    let dataset = catalog::datasets::get_by_uuid(&state.db, &uuid)
        .await
        .unwrap()
        .unwrap();
    assert!(dataset.error_message.unwrap().contains("no converter"));
    assert_eq!(dataset.conversion_attempts, 0);

    let _ = tx.send(true);
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn claim_compare_and_set_admits_exactly_one_winner() {
    let (state, _dir) = test_state().await;
    let uuid = queue_dataset(&state, "W-race", "TIFF").await;

    // two workers race for the same dataset; the CAS serializes them
    let first = catalog::datasets::compare_and_set_status(
        &state.db,
        &uuid,
        DatasetStatus::ConversionQueued,
        DatasetStatus::Converting,
    )
    .await
    .unwrap();
    let second = catalog::datasets::compare_and_set_status(
        &state.db,
        &uuid,
        DatasetStatus::ConversionQueued,
        DatasetStatus::Converting,
    )
    .await
    .unwrap();

    assert!(first);
    assert!(!second);

    let dataset = catalog::datasets::get_by_uuid(&state.db, &uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dataset.status, "converting");
    assert!(dataset.claimed_at.is_some());
}

#[tokio::test]
async fn running_conversion_honors_cancel_requests() {
    let (state, dir) = test_state().await;
    let uuid = queue_dataset(&state, "W-cancel", "TIFF").await;

    let script = write_converter(&dir, "slow.sh", "sleep 30");
    let (tx, handles) = spawn_dispatcher(&state, registry_with(SensorKind::Tiff, script));

    wait_for_status(&state, &uuid, DatasetStatus::Converting, 15).await;
    catalog::datasets::set_cancel_requested(&state.db, &uuid, true)
        .await
        .unwrap();

    wait_for_status(&state, &uuid, DatasetStatus::Cancelled, 15).await;

    let dataset = catalog::datasets::get_by_uuid(&state.db, &uuid)
        .await
        .unwrap()
        .unwrap();
    assert!(!dataset.cancel_requested);

    let _ = tx.send(true);
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn reconciler_rescues_abandoned_claims() {
    let (mut state, dir) = test_state().await;
    state.config.stale_claim_minutes = 1;
    state.config.reconcile_interval_secs = 1;

    let uuid = queue_dataset(&state, "W-stale", "TIFF").await;

    // a worker claimed it and died ten minutes ago
    assert!(
        catalog::datasets::compare_and_set_status(
            &state.db,
            &uuid,
            DatasetStatus::ConversionQueued,
            DatasetStatus::Converting,
        )
        .await
        .unwrap()
    );
    {
        use scidata_ingest::entities::datasets;
        use sea_orm::sea_query::Expr;
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

        datasets::Entity::update_many()
            .col_expr(
                datasets::Column::ClaimedAt,
                Expr::value(chrono::Utc::now() - chrono::Duration::minutes(10)),
            )
            .filter(datasets::Column::Uuid.eq(&uuid))
            .exec(&state.db)
            .await
            .unwrap();
    }

    // no converter registered: the rescued dataset must simply reappear in
    // the queue, so run the reconciler with zero workers
    state.config.worker_count = 0;
    let script = write_converter(&dir, "unused.sh", "exit 0");
    let (tx, handles) = spawn_dispatcher(&state, registry_with(SensorKind::Tiff, script));

    wait_for_status(&state, &uuid, DatasetStatus::ConversionQueued, 15).await;

    let _ = tx.send(true);
    for handle in handles {
        handle.abort();
    }
}
