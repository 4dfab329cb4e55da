use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use utoipa::ToSchema;

/// A remote-source descriptor, dispatched by `source_type`. Unknown kinds
/// are rejected at deserialization.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "source_type", content = "source_config", rename_all = "snake_case")]
pub enum RemoteSource {
    Url {
        url: String,
    },
    S3 {
        bucket: String,
        key: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    GoogleDrive {
        file_id: String,
        #[serde(default)]
        access_token: Option<String>,
    },
}

impl RemoteSource {
    pub fn source_kind(&self) -> &'static str {
        match self {
            Self::Url { .. } => "url",
            Self::S3 { .. } => "s3",
            Self::GoogleDrive { .. } => "google_drive",
        }
    }

    /// URL sources stream straight into the dataset file area; bucket-style
    /// sources land in sync/ first.
    pub fn needs_sync_landing(&self) -> bool {
        !matches!(self, Self::Url { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub filename: String,
    pub size_bytes: i64,
}

/// Pulls bytes for one remote source kind into a destination directory.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    fn source_kind(&self) -> &'static str;
    async fn fetch(&self, source: &RemoteSource, dest_dir: &Path) -> Result<FetchedFile>;
}

/// Fetcher registry keyed by source kind.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<&'static str, Arc<dyn RemoteFetcher>>,
}

impl FetcherRegistry {
    pub fn with_defaults() -> Self {
        let client = reqwest::Client::new();
        let mut registry = Self::default();
        registry.register(Arc::new(HttpFetcher::new(client.clone())));
        registry.register(Arc::new(S3Fetcher::new(client.clone())));
        registry.register(Arc::new(DriveFetcher::new(client)));
        registry
    }

    pub fn register(&mut self, fetcher: Arc<dyn RemoteFetcher>) {
        self.fetchers.insert(fetcher.source_kind(), fetcher);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn RemoteFetcher>> {
        self.fetchers.get(kind).cloned()
    }
}

/// Plain HTTP(S) downloads.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    fn source_kind(&self) -> &'static str {
        "url"
    }

    async fn fetch(&self, source: &RemoteSource, dest_dir: &Path) -> Result<FetchedFile> {
        let RemoteSource::Url { url } = source else {
            bail!("http fetcher given a non-url source");
        };

        let filename = url
            .split('/')
            .next_back()
            .filter(|s| !s.is_empty())
            .map(|s| s.split('?').next().unwrap_or(s).to_string())
            .unwrap_or_else(|| "download.bin".to_string());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("fetching {url}"))?;

        stream_to_file(response, dest_dir, &filename).await
    }
}

/// Bucket pulls over the S3 HTTP surface (virtual-hosted or custom
/// endpoint). Credentialed access is delegated to the deployment's edge.
pub struct S3Fetcher {
    client: reqwest::Client,
}

impl S3Fetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn object_url(bucket: &str, key: &str, region: Option<&str>, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) => format!("{}/{bucket}/{key}", endpoint.trim_end_matches('/')),
            None => {
                let region = region.unwrap_or("us-east-1");
                format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
            }
        }
    }
}

#[async_trait]
impl RemoteFetcher for S3Fetcher {
    fn source_kind(&self) -> &'static str {
        "s3"
    }

    async fn fetch(&self, source: &RemoteSource, dest_dir: &Path) -> Result<FetchedFile> {
        let RemoteSource::S3 {
            bucket,
            key,
            region,
            endpoint,
        } = source
        else {
            bail!("s3 fetcher given a non-s3 source");
        };

        let url = Self::object_url(bucket, key, region.as_deref(), endpoint.as_deref());
        let filename = key
            .split('/')
            .next_back()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("s3 key has no object name: {key}"))?;

        let response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("fetching s3://{bucket}/{key}"))?;

        stream_to_file(response, dest_dir, &filename).await
    }
}

/// Google Drive pulls via the files API (`alt=media`).
pub struct DriveFetcher {
    client: reqwest::Client,
}

impl DriveFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteFetcher for DriveFetcher {
    fn source_kind(&self) -> &'static str {
        "google_drive"
    }

    async fn fetch(&self, source: &RemoteSource, dest_dir: &Path) -> Result<FetchedFile> {
        let RemoteSource::GoogleDrive {
            file_id,
            access_token,
        } = source
        else {
            bail!("drive fetcher given a non-drive source");
        };

        let url = format!("https://www.googleapis.com/drive/v3/files/{file_id}?alt=media");
        let mut request = self.client.get(&url);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("fetching drive file {file_id}"))?;

        stream_to_file(response, dest_dir, &format!("drive-{file_id}.bin")).await
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    dest_dir: &Path,
    filename: &str,
) -> Result<FetchedFile> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let dest = dest_dir.join(filename);
    let scratch = dest.with_extension("part");

    let mut file = tokio::fs::File::create(&scratch).await?;
    let mut size: i64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        let piece = piece?;
        file.write_all(&piece).await?;
        size += piece.len() as i64;
    }
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&scratch, &dest).await?;

    Ok(FetchedFile {
        filename: filename.to_string(),
        size_bytes: size,
    })
}
