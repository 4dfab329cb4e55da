use crate::api::error::AppError;
use crate::catalog;
use crate::config::ServiceConfig;
use crate::entities::datasets::FileEntry;
use crate::entities::{upload_sessions, users};
use crate::infrastructure::layout::IngestLayout;
use crate::services::ingest::IngestService;
use crate::status::SessionState;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct ChunkReceipt {
    pub received: i32,
    pub count: i32,
}

#[derive(Serialize, ToSchema)]
pub struct ResumeInfo {
    pub missing_chunks: Vec<i32>,
    pub total_chunks: i32,
    pub received_chunks: i32,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct CompletionReceipt {
    pub job_id: String,
    pub status: String,
}

/// Tracks chunked-upload state: which chunks arrived, their hashes, and the
/// completion handshake that assembles them into the dataset's file area.
pub struct UploadSessionManager {
    db: DatabaseConnection,
    layout: IngestLayout,
    config: ServiceConfig,
    ingest: Arc<IngestService>,
}

impl UploadSessionManager {
    pub fn new(
        db: DatabaseConnection,
        layout: IngestLayout,
        config: ServiceConfig,
        ingest: Arc<IngestService>,
    ) -> Self {
        Self {
            db,
            layout,
            config,
            ingest,
        }
    }

    /// Accept one chunk. Chunks may arrive in any order and more than once;
    /// re-sending identical bytes is a no-op, differing bytes are refused.
    pub async fn write_chunk(
        &self,
        user: &users::Model,
        session_id: &str,
        chunk_index: i32,
        data: &[u8],
        declared_hash: Option<&str>,
    ) -> Result<ChunkReceipt, AppError> {
        let session = self.open_session(user, session_id).await?;

        if chunk_index < 0 || chunk_index >= session.total_chunks {
            return Err(AppError::Validation(format!(
                "chunk_number {chunk_index} outside [0, {})",
                session.total_chunks
            )));
        }

        let expected_len = chunk_length(
            chunk_index,
            session.total_size,
            session.chunk_size,
            session.total_chunks,
        );
        if data.len() as i64 != expected_len {
            return Err(AppError::Validation(format!(
                "chunk {chunk_index} must be {expected_len} bytes, got {}",
                data.len()
            )));
        }

        let digest = sha256_hex(data);

        // hash declared at initiation wins; a per-request hash is also honored
        let expected_hash = session
            .declared_chunk_hashes()
            .and_then(|hashes| hashes.get(chunk_index as usize).cloned())
            .or_else(|| declared_hash.map(str::to_string));

        if let Some(expected) = expected_hash {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(AppError::ChunkHashMismatch(format!(
                    "chunk {chunk_index} does not match its declared SHA-256"
                )));
            }
        }

        if session.received_set().contains(&chunk_index) {
            let existing = self
                .layout
                .chunk_digest(session_id, chunk_index)
                .await
                .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;
            return match existing {
                Some(prior) if prior == digest => Ok(ChunkReceipt {
                    received: chunk_index,
                    count: session.received_set().len() as i32,
                }),
                _ => Err(AppError::ChunkHashMismatch(format!(
                    "chunk {chunk_index} was already received with different bytes"
                ))),
            };
        }

        self.layout
            .write_chunk(session_id, chunk_index, data)
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;

        let count = catalog::sessions::mark_chunk_received(&self.db, session_id, chunk_index)
            .await
            .map_err(AppError::Anyhow)?;

        tracing::debug!(session = session_id, chunk = chunk_index, "chunk received");

        Ok(ChunkReceipt {
            received: chunk_index,
            count: count as i32,
        })
    }

    /// What is still missing, for clients resuming after a disconnect.
    pub async fn resume_info(
        &self,
        user: &users::Model,
        session_id: &str,
    ) -> Result<ResumeInfo, AppError> {
        let session = catalog::sessions::get_owned(&self.db, session_id, &user.email)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("upload session not found: {session_id}")))?;

        Ok(ResumeInfo {
            missing_chunks: session.missing_chunks(),
            total_chunks: session.total_chunks,
            received_chunks: session.received_set().len() as i32,
            expires_at: session.expires_at,
        })
    }

    /// Assemble the session. Gated by the open -> completing edge so two
    /// racing callers cannot both assemble; exactly one proceeds.
    pub async fn complete(
        &self,
        user: &users::Model,
        session_id: &str,
    ) -> Result<CompletionReceipt, AppError> {
        let session = self.open_session(user, session_id).await?;

        if !catalog::sessions::compare_and_set_state(
            &self.db,
            session_id,
            SessionState::Open,
            SessionState::Completing,
        )
        .await?
        {
            return Err(AppError::StaleState(format!(
                "session {session_id} is already completing"
            )));
        }

        let missing = session.missing_chunks();
        if !missing.is_empty() {
            catalog::sessions::set_state(&self.db, session_id, SessionState::Open).await?;
            return Err(AppError::Validation(format!(
                "{} chunks still missing (first: {})",
                missing.len(),
                missing[0]
            )));
        }

        let (digest, assembled_bytes) = match self
            .layout
            .assemble(
                session_id,
                session.total_chunks,
                &session.dataset_uuid,
                &session.filename,
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                catalog::sessions::set_state(&self.db, session_id, SessionState::Open).await?;
                return Err(AppError::StorageUnavailable(e.to_string()));
            }
        };

        if assembled_bytes != session.total_size {
            catalog::sessions::set_state(&self.db, session_id, SessionState::Open).await?;
            return Err(AppError::Internal(format!(
                "assembled {assembled_bytes} bytes, expected {}",
                session.total_size
            )));
        }

        if let Some(expected) = &session.overall_hash {
            if !expected.eq_ignore_ascii_case(&digest) {
                let dest = self
                    .layout
                    .upload_dir(&session.dataset_uuid)
                    .join(&session.filename);
                let _ = tokio::fs::remove_file(&dest).await;
                catalog::sessions::set_state(&self.db, session_id, SessionState::Open).await?;
                return Err(AppError::OverallHashMismatch(
                    "assembled file does not match the declared SHA-256; restart the session"
                        .into(),
                ));
            }
        }

        catalog::datasets::append_file(
            &self.db,
            &session.dataset_uuid,
            FileEntry {
                filename: session.filename.clone(),
                size_bytes: assembled_bytes,
                uploaded_at: Utc::now(),
                relative_path: session.filename.clone(),
            },
        )
        .await
        .map_err(AppError::Anyhow)?;

        catalog::sessions::set_state(&self.db, session_id, SessionState::Complete).await?;
        self.layout
            .remove_spool(session_id)
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;

        let status = self
            .ingest
            .advance_after_upload(&session.dataset_uuid)
            .await?;

        tracing::info!(
            session = session_id,
            dataset = %session.dataset_uuid,
            bytes = assembled_bytes,
            "chunked upload assembled and verified"
        );

        Ok(CompletionReceipt {
            job_id: session.dataset_uuid,
            status: status.as_str().to_string(),
        })
    }

    pub async fn abort(&self, user: &users::Model, session_id: &str) -> Result<(), AppError> {
        let session = catalog::sessions::get_owned(&self.db, session_id, &user.email)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("upload session not found: {session_id}")))?;

        if session.state == SessionState::Complete.as_str() {
            return Err(AppError::Validation("cannot abort a completed session".into()));
        }

        catalog::sessions::set_state(&self.db, session_id, SessionState::Aborted).await?;
        self.layout
            .remove_spool(session_id)
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Expire overdue sessions and drop their partial bytes. Returns how
    /// many sessions were reaped.
    pub async fn gc_expired(&self) -> Result<usize, AppError> {
        let overdue = catalog::sessions::find_overdue_open(&self.db, 100).await?;
        let count = overdue.len();

        for session in overdue {
            catalog::sessions::set_state(&self.db, &session.id, SessionState::Expired).await?;
            if let Err(e) = self.layout.remove_spool(&session.id).await {
                tracing::warn!(session = %session.id, "spool cleanup failed: {e}");
            }
            tracing::info!(session = %session.id, "expired stale upload session");
        }

        Ok(count)
    }

    pub fn default_chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    async fn open_session(
        &self,
        user: &users::Model,
        session_id: &str,
    ) -> Result<upload_sessions::Model, AppError> {
        let session = catalog::sessions::get_owned(&self.db, session_id, &user.email)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("upload session not found: {session_id}")))?;

        if session.expires_at < Utc::now() {
            catalog::sessions::set_state(&self.db, session_id, SessionState::Expired).await?;
            let _ = self.layout.remove_spool(session_id).await;
            return Err(AppError::Validation(format!(
                "session {session_id} expired; start a new one"
            )));
        }

        if session.state != SessionState::Open.as_str() {
            return Err(AppError::Validation(format!(
                "session {session_id} is {}, not open",
                session.state
            )));
        }

        Ok(session)
    }
}

/// Byte length of chunk `index`; only the last chunk may be short.
pub fn chunk_length(index: i32, total_size: i64, chunk_size: i64, total_chunks: i32) -> i64 {
    if index == total_chunks - 1 {
        total_size - chunk_size * (total_chunks as i64 - 1)
    } else {
        chunk_size
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_multiple_needs_no_short_chunk() {
        // file of exactly one chunk
        assert_eq!(chunk_length(0, 100, 100, 1), 100);
        // two full chunks
        assert_eq!(chunk_length(0, 200, 100, 2), 100);
        assert_eq!(chunk_length(1, 200, 100, 2), 100);
    }

    #[test]
    fn one_byte_overflow_makes_a_one_byte_tail() {
        assert_eq!(chunk_length(0, 101, 100, 2), 100);
        assert_eq!(chunk_length(1, 101, 100, 2), 1);
    }
}
