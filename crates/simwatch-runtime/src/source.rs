use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use simwatch_core::retry::{retry_with_backoff, RetryPolicy};
use simwatch_core::types::RunKey;
use simwatch_core::upload_url::{file_url_to_path, UploadUrl};

/// Read-only view of the upload site. `Ok(None)` means the resource does not
/// exist (yet); every other failure is an error.
#[async_trait]
pub trait UploadSource: Send + Sync + 'static {
    async fn fetch_json(&self, url: &str) -> Result<Option<Value>>;
    async fn fetch_binary(&self, url: &str) -> Result<Option<Vec<u8>>>;
}

/// URLs of the documents published by the upload site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    base: String,
}

impl SourceLayout {
    pub fn new(url: &UploadUrl) -> Self {
        Self {
            base: url.base().to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn index_url(&self) -> String {
        format!("{}/shots/index.json", self.base)
    }

    pub fn time_url(&self, run: &RunKey) -> String {
        format!("{}/shots/{}/{}/time.json", self.base, run.shot, run.run)
    }

    pub fn variables_url(&self, run: &RunKey, timestep: u64) -> String {
        format!(
            "{}/shots/{}/{}/{timestep}/variables.json",
            self.base, run.shot, run.run
        )
    }

    pub fn archive_url(&self, run: &RunKey, timestep: u64) -> String {
        format!(
            "{}/shots/{}/{}/{timestep}/images.tar.gz",
            self.base, run.shot, run.run
        )
    }
}

/// Fetches `url` and deserializes it into `T`. A document that exists but does
/// not match `T` is an error, not `None`.
pub async fn fetch_typed<T: DeserializeOwned>(
    source: &dyn UploadSource,
    url: &str,
) -> Result<Option<T>> {
    match source.fetch_json(url).await? {
        None => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .with_context(|| format!("unexpected document shape at {url}")),
    }
}

pub fn open_upload_source(url: &UploadUrl, retry: RetryPolicy) -> Result<Arc<dyn UploadSource>> {
    if url.is_file() {
        Ok(Arc::new(FsUploadSource::new()))
    } else {
        Ok(Arc::new(HttpUploadSource::new(retry)?))
    }
}

pub struct HttpUploadSource {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpUploadSource {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        // Upload sites are lab hosts with self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self { client, retry })
    }

    async fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let resp = retry_with_backoff(
            &self.retry,
            url,
            |e: &reqwest::Error| e.is_connect() || e.is_timeout(),
            || self.client.get(url).send(),
        )
        .await
        .with_context(|| format!("GET {url}"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("GET {url} failed: status={}", resp.status());
        }
        let body = resp
            .bytes()
            .await
            .with_context(|| format!("reading body of {url}"))?;
        Ok(Some(body.to_vec()))
    }
}

#[async_trait]
impl UploadSource for HttpUploadSource {
    async fn fetch_json(&self, url: &str) -> Result<Option<Value>> {
        let Some(body) = self.get(url).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&body).with_context(|| format!("invalid json at {url}"))?;
        Ok(Some(value))
    }

    async fn fetch_binary(&self, url: &str) -> Result<Option<Vec<u8>>> {
        self.get(url).await
    }
}

/// `file://` upload site, typically a directory synced from the simulation host.
#[derive(Debug, Default)]
pub struct FsUploadSource;

impl FsUploadSource {
    pub fn new() -> Self {
        Self
    }

    async fn read(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let path = file_url_to_path(url)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[async_trait]
impl UploadSource for FsUploadSource {
    async fn fetch_json(&self, url: &str) -> Result<Option<Value>> {
        let Some(body) = self.read(url).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&body).with_context(|| format!("invalid json at {url}"))?;
        Ok(Some(value))
    }

    async fn fetch_binary(&self, url: &str) -> Result<Option<Vec<u8>>> {
        self.read(url).await
    }
}
