use crate::catalog;
use crate::config::ServiceConfig;
use crate::entities::datasets::{self, FileEntry, SensorKind};
use crate::infrastructure::layout::IngestLayout;
use crate::services::converters::{ConverterRegistry, ConverterSpec};
use crate::services::ingest::IngestService;
use crate::services::remote::{FetcherRegistry, RemoteSource};
use crate::services::upload_session::UploadSessionManager;
use crate::status::DatasetStatus;
use anyhow::{Result, anyhow};
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::DatabaseConnection;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Work a claim can yield.
enum ClaimedJob {
    Convert(datasets::Model),
    Fetch(datasets::Model, DatasetStatus),
}

/// Long-lived worker pool that drives datasets through the queued states.
///
/// Each worker loops: claim one dataset by compare-and-set, execute the
/// matching job (remote fetch or conversion subprocess), publish the
/// outcome. The compare-and-set is the only mutual exclusion; of any two
/// workers racing for a dataset, at most one wins the claim.
pub struct Dispatcher {
    db: DatabaseConnection,
    layout: IngestLayout,
    config: ServiceConfig,
    converters: ConverterRegistry,
    fetchers: FetcherRegistry,
    ingest: Arc<IngestService>,
    sessions: Arc<UploadSessionManager>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        layout: IngestLayout,
        config: ServiceConfig,
        converters: ConverterRegistry,
        fetchers: FetcherRegistry,
        ingest: Arc<IngestService>,
        sessions: Arc<UploadSessionManager>,
    ) -> Self {
        Self {
            db,
            layout,
            config,
            converters,
            fetchers,
            ingest,
            sessions,
        }
    }

    /// Spawn the worker pool plus the reconciler. Handles run until the
    /// shutdown channel flips.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for worker_id in 0..self.config.worker_count {
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, shutdown).await;
            }));
        }

        let dispatcher = self.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.reconciler_loop(shutdown).await;
        }));

        info!(workers = self.config.worker_count, "dispatcher started");
        handles
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(self.config.claim_backoff_initial_secs);
        let backoff_cap = Duration::from_secs(self.config.claim_backoff_cap_secs);

        loop {
            if *shutdown.borrow() {
                info!(worker = worker_id, "worker shutting down");
                return;
            }

            match self.claim_next().await {
                Ok(Some(job)) => {
                    backoff = Duration::from_secs(self.config.claim_backoff_initial_secs);
                    match job {
                        ClaimedJob::Convert(dataset) => {
                            self.run_conversion(worker_id, dataset).await;
                        }
                        ClaimedJob::Fetch(dataset, running) => {
                            self.run_fetch(worker_id, dataset, running).await;
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff = (backoff * 2).min(backoff_cap);
                }
                Err(e) => {
                    error!(worker = worker_id, "claim failed: {e}");
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff = (backoff * 2).min(backoff_cap);
                }
            }
        }
    }

    /// Try to claim one dataset. Remote fetches first, then conversions;
    /// a lost compare-and-set just moves on to the next candidate.
    async fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        for dataset in
            catalog::datasets::find_remote_by_status(&self.db, DatasetStatus::SyncQueued, 5).await?
        {
            if catalog::datasets::compare_and_set_status(
                &self.db,
                &dataset.uuid,
                DatasetStatus::SyncQueued,
                DatasetStatus::Syncing,
            )
            .await?
            {
                return Ok(Some(ClaimedJob::Fetch(dataset, DatasetStatus::Syncing)));
            }
        }

        for dataset in
            catalog::datasets::find_remote_by_status(&self.db, DatasetStatus::UploadQueued, 5)
                .await?
        {
            if catalog::datasets::compare_and_set_status(
                &self.db,
                &dataset.uuid,
                DatasetStatus::UploadQueued,
                DatasetStatus::Uploading,
            )
            .await?
            {
                return Ok(Some(ClaimedJob::Fetch(dataset, DatasetStatus::Uploading)));
            }
        }

        for dataset in
            catalog::datasets::find_by_status(&self.db, DatasetStatus::ConversionQueued, 5).await?
        {
            if catalog::datasets::compare_and_set_status(
                &self.db,
                &dataset.uuid,
                DatasetStatus::ConversionQueued,
                DatasetStatus::Converting,
            )
            .await?
            {
                return Ok(Some(ClaimedJob::Convert(dataset)));
            }
        }

        Ok(None)
    }

    /// Execute one conversion attempt end to end.
    async fn run_conversion(&self, worker_id: usize, dataset: datasets::Model) {
        let uuid = dataset.uuid.clone();
        info!(worker = worker_id, dataset = %uuid, sensor = %dataset.sensor, "conversion claimed");

        if self.cancelled(&uuid).await {
            self.finish_cancelled(&uuid, DatasetStatus::Converting).await;
            return;
        }

        let Some(sensor) = SensorKind::parse(&dataset.sensor) else {
            self.fail_permanently(&uuid, &format!("unknown sensor: {}", dataset.sensor))
                .await;
            return;
        };
        let Some(spec) = self.converters.get(sensor).cloned() else {
            self.fail_permanently(&uuid, &format!("no converter registered for {sensor}"))
                .await;
            return;
        };

        let input_dir = self.layout.upload_dir(&uuid);
        let output_dir = self.layout.converted_dir(&uuid);
        if let Err(e) = self.layout.clear_dir(&output_dir).await {
            self.record_attempt(&dataset, &format!("preparing output directory: {e}"))
                .await;
            return;
        }

        if self.cancelled(&uuid).await {
            self.finish_cancelled(&uuid, DatasetStatus::Converting).await;
            return;
        }

        let started = Instant::now();
        let outcome = self
            .execute_converter(&uuid, &spec, &input_dir, &output_dir)
            .await;

        match outcome {
            Ok(ConverterOutcome::Finished) => {
                if !self.layout.dir_non_empty(&output_dir).await {
                    self.record_attempt(&dataset, "converter produced no output")
                        .await;
                    return;
                }

                let duration = started.elapsed().as_secs() as i64;
                match catalog::datasets::compare_and_set_status(
                    &self.db,
                    &uuid,
                    DatasetStatus::Converting,
                    DatasetStatus::Done,
                )
                .await
                {
                    Ok(true) => {
                        let _ = catalog::datasets::record_conversion_duration(
                            &self.db, &uuid, duration,
                        )
                        .await;
                        let _ =
                            catalog::datasets::set_error_message(&self.db, &uuid, None).await;
                        info!(dataset = %uuid, secs = duration, "conversion published");
                    }
                    Ok(false) => warn!(dataset = %uuid, "lost publish race; leaving as-is"),
                    Err(e) => error!(dataset = %uuid, "publish failed: {e}"),
                }
            }
            Ok(ConverterOutcome::Cancelled) => {
                self.finish_cancelled(&uuid, DatasetStatus::Converting).await;
            }
            Ok(ConverterOutcome::Failed(reason)) => {
                self.record_attempt(&dataset, &reason).await;
            }
            Err(e) => {
                self.record_attempt(&dataset, &format!("converter spawn failed: {e}"))
                    .await;
            }
        }
    }

    /// Spawn the converter subprocess with captured stdio, a hard timeout,
    /// and a periodic cancellation poll.
    async fn execute_converter(
        &self,
        uuid: &str,
        spec: &ConverterSpec,
        input_dir: &std::path::Path,
        output_dir: &std::path::Path,
    ) -> Result<ConverterOutcome> {
        let log_path = self.layout.conversion_log_path(uuid);
        let log_file = std::fs::File::create(&log_path)?;
        let log_err = log_file.try_clone()?;

        let mut command = tokio::process::Command::new(&spec.executable);
        command
            .arg(input_dir)
            .arg(output_dir)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        if let Some(params) = &spec.extra_params {
            command.arg(params.to_string());
        }

        let mut child = command.spawn()?;
        let deadline = Instant::now() + Duration::from_secs(spec.timeout_minutes * 60);

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    if status.success() {
                        return Ok(ConverterOutcome::Finished);
                    }
                    let tail = log_tail(&log_path, 2000);
                    return Ok(ConverterOutcome::Failed(format!(
                        "converter exited with {status}: {tail}"
                    )));
                }
                _ = sleep(Duration::from_secs(2)) => {
                    if self.cancelled(uuid).await {
                        let _ = child.kill().await;
                        return Ok(ConverterOutcome::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill().await;
                        return Ok(ConverterOutcome::Failed(format!(
                            "converter timed out after {} minutes",
                            spec.timeout_minutes
                        )));
                    }
                }
            }
        }
    }

    /// Execute a claimed remote fetch (`running` is Syncing or Uploading).
    async fn run_fetch(&self, worker_id: usize, dataset: datasets::Model, running: DatasetStatus) {
        let uuid = dataset.uuid.clone();
        info!(worker = worker_id, dataset = %uuid, "remote fetch claimed");

        let error_state = match running {
            DatasetStatus::Syncing => DatasetStatus::SyncError,
            _ => DatasetStatus::UploadError,
        };

        if self.cancelled(&uuid).await {
            self.finish_cancelled(&uuid, running).await;
            return;
        }

        let result = self.fetch_into_dataset(&dataset, running).await;

        match result {
            Ok(fetched) => {
                let entry = FileEntry {
                    filename: fetched.filename.clone(),
                    size_bytes: fetched.size_bytes,
                    uploaded_at: Utc::now(),
                    relative_path: fetched.filename,
                };
                if let Err(e) = catalog::datasets::append_file(&self.db, &uuid, entry).await {
                    error!(dataset = %uuid, "recording fetched file failed: {e}");
                }

                match self.ingest.advance_after_upload(&uuid).await {
                    Ok(next) => info!(dataset = %uuid, status = %next, "remote fetch landed"),
                    Err(e) => error!(dataset = %uuid, "post-fetch advance failed: {e}"),
                }
            }
            Err(e) => {
                warn!(dataset = %uuid, "remote fetch failed: {e}");
                let _ =
                    catalog::datasets::set_error_message(&self.db, &uuid, Some(&e.to_string()))
                        .await;
                let _ = catalog::datasets::compare_and_set_status(
                    &self.db, &uuid, running, error_state,
                )
                .await;
            }
        }
    }

    async fn fetch_into_dataset(
        &self,
        dataset: &datasets::Model,
        running: DatasetStatus,
    ) -> Result<crate::services::remote::FetchedFile> {
        let source: RemoteSource = dataset
            .remote_source
            .clone()
            .ok_or_else(|| anyhow!("dataset has no remote source descriptor"))
            .and_then(|v| serde_json::from_value(v).map_err(|e| anyhow!("corrupt source: {e}")))?;

        let fetcher = self
            .fetchers
            .get(source.source_kind())
            .ok_or_else(|| anyhow!("no fetcher for source kind {}", source.source_kind()))?;

        if running == DatasetStatus::Syncing {
            // land in sync/, then move into the dataset file area
            let landing = self.layout.sync_dir(&dataset.uuid);
            let fetched = fetcher.fetch(&source, &landing).await?;

            let upload_dir = self.layout.upload_dir(&dataset.uuid);
            tokio::fs::create_dir_all(&upload_dir).await?;
            tokio::fs::rename(
                landing.join(&fetched.filename),
                upload_dir.join(&fetched.filename),
            )
            .await?;
            Ok(fetched)
        } else {
            fetcher
                .fetch(&source, &self.layout.upload_dir(&dataset.uuid))
                .await
        }
    }

    /// Failed attempt bookkeeping: requeue with backoff until the attempt
    /// budget is spent, then mark the dataset failed for good.
    async fn record_attempt(&self, dataset: &datasets::Model, reason: &str) {
        let uuid = &dataset.uuid;
        warn!(dataset = %uuid, "conversion attempt failed: {reason}");

        let attempts = match catalog::datasets::increment_conversion_attempts(&self.db, uuid).await
        {
            Ok(n) => n,
            Err(e) => {
                error!(dataset = %uuid, "attempt accounting failed: {e}");
                return;
            }
        };

        let _ = catalog::datasets::set_error_message(&self.db, uuid, Some(reason)).await;

        if attempts < self.config.max_conversion_attempts {
            let delay = Duration::from_secs(
                (self.config.claim_backoff_initial_secs << attempts.min(4) as u64)
                    .min(self.config.claim_backoff_cap_secs),
            );
            sleep(delay).await;

            let _ = catalog::datasets::compare_and_set_status(
                &self.db,
                uuid,
                DatasetStatus::Converting,
                DatasetStatus::ConversionQueued,
            )
            .await;
            info!(dataset = %uuid, attempt = attempts, "requeued for retry");
        } else {
            let _ = catalog::datasets::compare_and_set_status(
                &self.db,
                uuid,
                DatasetStatus::Converting,
                DatasetStatus::ConversionFailed,
            )
            .await;
            warn!(dataset = %uuid, attempts, "conversion failed permanently");
        }
    }

    /// Unknown sensor or missing converter: no retry budget applies.
    async fn fail_permanently(&self, uuid: &str, reason: &str) {
        warn!(dataset = %uuid, "{reason}");
        let _ = catalog::datasets::set_error_message(&self.db, uuid, Some(reason)).await;
        let _ = catalog::datasets::compare_and_set_status(
            &self.db,
            uuid,
            DatasetStatus::Converting,
            DatasetStatus::ConversionFailed,
        )
        .await;
    }

    async fn cancelled(&self, uuid: &str) -> bool {
        matches!(
            catalog::datasets::get_by_uuid(&self.db, uuid).await,
            Ok(Some(d)) if d.cancel_requested
        )
    }

    async fn finish_cancelled(&self, uuid: &str, running: DatasetStatus) {
        let output = self.layout.converted_dir(uuid);
        if let Err(e) = self.layout.clear_dir(&output).await {
            warn!(dataset = %uuid, "output cleanup after cancel failed: {e}");
        }
        let _ = catalog::datasets::compare_and_set_status(
            &self.db,
            uuid,
            running,
            DatasetStatus::Cancelled,
        )
        .await;
        let _ = catalog::datasets::set_cancel_requested(&self.db, uuid, false).await;
        info!(dataset = %uuid, "job cancelled");
    }

    /// Periodic sweeps: rescue abandoned claims, expire stale sessions,
    /// reconcile dataset sizes, drop dead token descriptors.
    async fn reconciler_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.reconcile_interval_secs);

        loop {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                info!("reconciler shutting down");
                return;
            }

            self.rescue_stale_claims().await;

            match self.sessions.gc_expired().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "expired upload sessions reaped"),
                Err(e) => warn!("session GC failed: {e}"),
            }

            self.reconcile_sizes().await;

            if let Err(e) = catalog::tokens::purge_expired(&self.db).await {
                warn!("token purge failed: {e}");
            }
        }
    }

    /// Datasets stuck in a running state past the stale threshold were
    /// claimed by a worker that died; put them back in their queue.
    async fn rescue_stale_claims(&self) {
        let threshold = ChronoDuration::minutes(self.config.stale_claim_minutes);

        for (running, queued) in [
            (DatasetStatus::Converting, DatasetStatus::ConversionQueued),
            (DatasetStatus::Syncing, DatasetStatus::SyncQueued),
        ] {
            let stale = match catalog::datasets::find_stale_claims(&self.db, running, threshold)
                .await
            {
                Ok(stale) => stale,
                Err(e) => {
                    warn!("stale-claim scan failed: {e}");
                    continue;
                }
            };

            for dataset in stale {
                match catalog::datasets::compare_and_set_status(
                    &self.db,
                    &dataset.uuid,
                    running,
                    queued,
                )
                .await
                {
                    Ok(true) => {
                        warn!(dataset = %dataset.uuid, "rescued abandoned {running} claim");
                    }
                    Ok(false) => {} // its worker finished after all
                    Err(e) => warn!(dataset = %dataset.uuid, "rescue failed: {e}"),
                }
            }
        }
    }

    async fn reconcile_sizes(&self) {
        let unsized_datasets = match catalog::datasets::find_unsized_done(&self.db, 20).await {
            Ok(list) => list,
            Err(e) => {
                warn!("size reconciliation scan failed: {e}");
                return;
            }
        };

        for dataset in unsized_datasets {
            let upload = self.layout.upload_dir(&dataset.uuid);
            let converted = self.layout.converted_dir(&dataset.uuid);

            let mut total = 0u64;
            for dir in [&upload, &converted] {
                match self.layout.dir_size_bytes(dir).await {
                    Ok(bytes) => total += bytes,
                    Err(e) => warn!(dataset = %dataset.uuid, "size walk failed: {e}"),
                }
            }

            let gb = total as f64 / (1024.0 * 1024.0 * 1024.0);
            if let Err(e) =
                catalog::datasets::set_data_size_gb(&self.db, &dataset.uuid, gb).await
            {
                warn!(dataset = %dataset.uuid, "size update failed: {e}");
            }
        }
    }
}

enum ConverterOutcome {
    Finished,
    Cancelled,
    Failed(String),
}

/// Last `max_bytes` of the per-job log, whitespace-normalized, for the
/// dataset's error message.
fn log_tail(path: &std::path::Path, max_bytes: usize) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(max_bytes);
            String::from_utf8_lossy(&bytes[start..])
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tail_truncates_from_the_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "aaaa bbbb cccc").unwrap();
        assert_eq!(log_tail(&path, 9), "bbb cccc");
        assert_eq!(log_tail(&path, 1000), "aaaa bbbb cccc");
    }

    #[test]
    fn log_tail_of_missing_file_is_empty() {
        assert_eq!(log_tail(std::path::Path::new("/no/such/log"), 10), "");
    }
}
