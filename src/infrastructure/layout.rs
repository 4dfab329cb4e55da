use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The on-disk contract the workers honor.
///
/// ```text
/// {root}/upload/{uuid}/      raw inputs as uploaded
/// {root}/converted/{uuid}/   converter outputs
/// {root}/sync/{uuid}/        remote-source landing
/// {root}/tmp/{session}/      per-session chunk spool
/// ```
///
/// Everything is partitioned by dataset uuid or session id, so concurrent
/// ingests never collide at the filesystem level.
#[derive(Debug, Clone)]
pub struct IngestLayout {
    root: PathBuf,
}

impl IngestLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_roots(&self) -> Result<()> {
        for sub in ["upload", "converted", "sync", "tmp"] {
            fs::create_dir_all(self.root.join(sub))
                .await
                .with_context(|| format!("creating {sub} under {}", self.root.display()))?;
        }
        Ok(())
    }

    pub fn upload_dir(&self, dataset_uuid: &str) -> PathBuf {
        self.root.join("upload").join(dataset_uuid)
    }

    pub fn converted_dir(&self, dataset_uuid: &str) -> PathBuf {
        self.root.join("converted").join(dataset_uuid)
    }

    pub fn sync_dir(&self, dataset_uuid: &str) -> PathBuf {
        self.root.join("sync").join(dataset_uuid)
    }

    pub fn session_spool(&self, session_id: &str) -> PathBuf {
        self.root.join("tmp").join(session_id)
    }

    pub fn chunk_path(&self, session_id: &str, chunk_index: i32) -> PathBuf {
        self.session_spool(session_id)
            .join(format!("chunk_{chunk_index:06}"))
    }

    pub fn conversion_log_path(&self, dataset_uuid: &str) -> PathBuf {
        self.root.join("tmp").join(format!("convert-{dataset_uuid}.log"))
    }

    /// Write one chunk to its spool slot. The write goes to a scratch file
    /// first and is renamed into place, so a slot is either absent or whole.
    pub async fn write_chunk(&self, session_id: &str, chunk_index: i32, data: &[u8]) -> Result<()> {
        let spool = self.session_spool(session_id);
        fs::create_dir_all(&spool).await?;

        let target = self.chunk_path(session_id, chunk_index);
        let scratch = target.with_extension("part");

        let mut file = fs::File::create(&scratch).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&scratch, &target).await?;
        Ok(())
    }

    /// SHA-256 of a spooled chunk, or None when the slot is empty.
    pub async fn chunk_digest(&self, session_id: &str, chunk_index: i32) -> Result<Option<String>> {
        let path = self.chunk_path(session_id, chunk_index);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(hash_file(&path).await?))
    }

    /// Concatenate spooled chunks in index order into the dataset's file
    /// area, returning the SHA-256 of the assembled bytes and their count.
    pub async fn assemble(
        &self,
        session_id: &str,
        total_chunks: i32,
        dataset_uuid: &str,
        filename: &str,
    ) -> Result<(String, i64)> {
        let dest_dir = self.upload_dir(dataset_uuid);
        fs::create_dir_all(&dest_dir).await?;

        let dest = dest_dir.join(filename);
        let scratch = dest.with_extension("assembling");

        let mut out = fs::File::create(&scratch).await?;
        let mut hasher = Sha256::new();
        let mut written: i64 = 0;
        let mut buf = vec![0u8; 1024 * 1024];

        for index in 0..total_chunks {
            let path = self.chunk_path(session_id, index);
            let mut chunk = fs::File::open(&path)
                .await
                .with_context(|| format!("missing chunk {index} for session {session_id}"))?;
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n]).await?;
                written += n as i64;
            }
        }

        out.sync_all().await?;
        drop(out);
        fs::rename(&scratch, &dest).await?;

        Ok((hex::encode(hasher.finalize()), written))
    }

    /// Persist a whole-file upload directly into the dataset's file area.
    pub async fn write_whole_file(
        &self,
        dataset_uuid: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<i64> {
        let dir = self.upload_dir(dataset_uuid);
        fs::create_dir_all(&dir).await?;

        let dest = dir.join(filename);
        let scratch = dest.with_extension("part");

        let mut file = fs::File::create(&scratch).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&scratch, &dest).await?;
        Ok(data.len() as i64)
    }

    pub async fn remove_spool(&self, session_id: &str) -> Result<()> {
        let spool = self.session_spool(session_id);
        if spool.exists() {
            fs::remove_dir_all(&spool).await?;
        }
        Ok(())
    }

    pub async fn clear_dir(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir).await?;
        }
        fs::create_dir_all(dir).await?;
        Ok(())
    }

    pub async fn dir_non_empty(&self, dir: &Path) -> bool {
        match fs::read_dir(dir).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
            Err(_) => false,
        }
    }

    /// Recursive byte count of a directory tree.
    pub async fn dir_size_bytes(&self, dir: &Path) -> Result<u64> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut total = 0u64;
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reject filenames that would escape the dataset directory.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    let name = filename.trim();
    if name.is_empty() {
        bail!("empty filename");
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("filename must not contain path separators: {name}");
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunk_write_and_assemble() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IngestLayout::new(dir.path());
        layout.ensure_roots().await.unwrap();

        layout.write_chunk("s1", 1, b"world").await.unwrap();
        layout.write_chunk("s1", 0, b"hello ").await.unwrap();

        let (digest, size) = layout.assemble("s1", 2, "ds1", "greeting.txt").await.unwrap();
        assert_eq!(size, 11);

        let mut hasher = Sha256::new();
        hasher.update(b"hello world");
        assert_eq!(digest, hex::encode(hasher.finalize()));

        let assembled = std::fs::read(layout.upload_dir("ds1").join("greeting.txt")).unwrap();
        assert_eq!(assembled, b"hello world");
    }

    #[tokio::test]
    async fn chunk_digest_reports_missing_slot() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IngestLayout::new(dir.path());
        layout.ensure_roots().await.unwrap();

        assert!(layout.chunk_digest("s2", 0).await.unwrap().is_none());
        layout.write_chunk("s2", 0, b"abc").await.unwrap();
        assert!(layout.chunk_digest("s2", 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dir_size_walks_nested_trees() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IngestLayout::new(dir.path());
        layout.ensure_roots().await.unwrap();

        let nested = layout.upload_dir("ds").join("inner");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(layout.upload_dir("ds").join("b.bin"), vec![0u8; 28]).unwrap();

        let size = layout.dir_size_bytes(&layout.upload_dir("ds")).await.unwrap();
        assert_eq!(size, 128);
    }

    #[test]
    fn filename_sanitization() {
        assert!(sanitize_filename("scan_001.tiff").is_ok());
        assert!(sanitize_filename("../etc/passwd").is_err());
        assert!(sanitize_filename("a/b.txt").is_err());
        assert!(sanitize_filename("").is_err());
    }
}
