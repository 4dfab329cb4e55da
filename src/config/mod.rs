use std::env;
use std::path::PathBuf;

/// Runtime configuration for the ingest service.
///
/// Everything is sourced from environment variables so the same binary can
/// run as the API front-end, a conversion worker, or both.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of the on-disk dataset tree (upload/, converted/, sync/, tmp/).
    pub ingest_root: PathBuf,

    /// Symmetric key used to sign token envelopes (required in production).
    pub jwt_secret: String,

    /// Access token lifetime in hours (default: 24).
    pub access_token_hours: i64,

    /// Refresh token lifetime in days (default: 30).
    pub refresh_token_days: i64,

    /// Chunk size for chunked uploads in bytes (default: 100 MiB).
    pub chunk_size: u64,

    /// Files larger than this must use chunked mode (default: 100 MiB).
    pub single_upload_limit: u64,

    /// Absolute upper bound on any file (default: 10 TiB).
    pub max_file_size: u64,

    /// Upload session lifetime in hours (default: 24).
    pub session_ttl_hours: i64,

    /// Number of conversion workers per process (default: 2).
    pub worker_count: usize,

    /// Initial claim-loop backoff when the queue is empty, in seconds.
    pub claim_backoff_initial_secs: u64,

    /// Backoff cap, in seconds.
    pub claim_backoff_cap_secs: u64,

    /// Conversions claimed longer ago than this are considered abandoned.
    /// Must exceed the longest per-sensor timeout.
    pub stale_claim_minutes: i64,

    /// Maximum conversion attempts before a dataset is marked failed.
    pub max_conversion_attempts: i32,

    /// Interval between reconciler sweeps, in seconds.
    pub reconcile_interval_secs: u64,

    /// Allowed CORS origins.
    pub allowed_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ingest_root: PathBuf::from("/mnt/datasets"),
            jwt_secret: "secret".to_string(),
            access_token_hours: 24,
            refresh_token_days: 30,
            chunk_size: 100 * 1024 * 1024,
            single_upload_limit: 100 * 1024 * 1024,
            max_file_size: 10 * 1024 * 1024 * 1024 * 1024,
            session_ttl_hours: 24,
            worker_count: 2,
            claim_backoff_initial_secs: 2,
            claim_backoff_cap_secs: 30,
            stale_claim_minutes: 150,
            max_conversion_attempts: 2,
            reconcile_interval_secs: 300,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            ingest_root: env::var("INGEST_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.ingest_root),

            jwt_secret: env::var("JWT_SECRET").unwrap_or(default.jwt_secret),

            access_token_hours: env::var("ACCESS_TOKEN_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.access_token_hours),

            refresh_token_days: env::var("REFRESH_TOKEN_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.refresh_token_days),

            chunk_size: env::var("CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.chunk_size),

            single_upload_limit: env::var("SINGLE_UPLOAD_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.single_upload_limit),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            session_ttl_hours: env::var("SESSION_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.session_ttl_hours),

            worker_count: env::var("WORKER_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.worker_count),

            claim_backoff_initial_secs: env::var("CLAIM_BACKOFF_INITIAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.claim_backoff_initial_secs),

            claim_backoff_cap_secs: env::var("CLAIM_BACKOFF_CAP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.claim_backoff_cap_secs),

            stale_claim_minutes: env::var("STALE_CLAIM_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.stale_claim_minutes),

            max_conversion_attempts: env::var("MAX_CONVERSION_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_conversion_attempts),

            reconcile_interval_secs: env::var("RECONCILE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.reconcile_interval_secs),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Config for development and tests: tiny chunks, fast sweeps.
    pub fn development(ingest_root: PathBuf) -> Self {
        Self {
            ingest_root,
            jwt_secret: "dev-secret".to_string(),
            chunk_size: 4 * 1024 * 1024,
            single_upload_limit: 8 * 1024 * 1024,
            worker_count: 1,
            claim_backoff_initial_secs: 1,
            claim_backoff_cap_secs: 2,
            reconcile_interval_secs: 5,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let config = ServiceConfig::default();
        assert_eq!(config.chunk_size, 100 * 1024 * 1024);
        assert_eq!(config.single_upload_limit, 100 * 1024 * 1024);
        assert_eq!(config.access_token_hours, 24);
        assert_eq!(config.refresh_token_days, 30);
        assert_eq!(config.max_conversion_attempts, 2);
    }

    #[test]
    fn stale_threshold_exceeds_conversion_timeout() {
        let config = ServiceConfig::default();
        // dataset_conversion runs up to 120 minutes; abandoned claims must
        // not be rescheduled while the subprocess could still be alive.
        assert!(config.stale_claim_minutes > 120);
    }

    #[test]
    fn development_overrides() {
        let config = ServiceConfig::development(PathBuf::from("/tmp/x"));
        assert_eq!(config.worker_count, 1);
        assert!(config.chunk_size < ServiceConfig::default().chunk_size);
    }
}
