use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use simwatch_core::retry::{retry_with_backoff, RetryPolicy};
use simwatch_core::types::Metadata;
use tokio::sync::Semaphore;

use crate::{Folder, Item, ResourceType, StoreBackend, StoreError};

pub const TOKEN_HEADER: &str = "Girder-Token";

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// REST root, e.g. `https://host/api/v1`.
    pub api_url: String,
    /// Rendering service root; defaults to `api_url`.
    pub movie_api_url: Option<String>,
    /// Process-wide cap on simultaneous outbound requests.
    pub max_concurrent_requests: usize,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpStoreConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            movie_api_url: None,
            max_concurrent_requests: 5,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
        }
    }
}

enum Payload {
    Empty,
    Json(Value),
    Bytes { bytes: Vec<u8>, mime_type: String },
}

/// REST client for the Girder-style store.
pub struct HttpStore {
    client: reqwest::Client,
    api_url: String,
    movie_api_url: String,
    token: String,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "authToken")]
    auth_token: AuthToken,
}

#[derive(Deserialize)]
struct AuthToken {
    token: String,
}

#[derive(Deserialize)]
struct MetaOnly {
    #[serde(default)]
    meta: Metadata,
}

fn is_connection_error(err: &StoreError) -> bool {
    match err {
        StoreError::Transport { source, .. } => source.is_connect() || source.is_timeout(),
        _ => false,
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

impl HttpStore {
    /// Builds the client and exchanges `api_key` for a session token.
    pub async fn connect(config: HttpStoreConfig, api_key: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| StoreError::Transport {
                url: config.api_url.clone(),
                source,
            })?;
        let api_url = trim_base(&config.api_url);
        let movie_api_url = config
            .movie_api_url
            .as_deref()
            .map(trim_base)
            .unwrap_or_else(|| api_url.clone());

        let mut store = Self {
            client,
            api_url,
            movie_api_url,
            token: String::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            retry: config.retry,
        };

        let resp: TokenResponse = store
            .request_json(
                Method::POST,
                "api_key/token",
                &[("key", api_key.to_string())],
                Payload::Empty,
            )
            .await?;
        store.token = resp.auth_token.token;
        tracing::info!(
            target: "simwatch_store",
            event = "authenticated",
            api_url = %store.api_url,
            "store session established"
        );
        Ok(store)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.api_url, path.trim_start_matches('/'))
        }
    }

    /// One rate-limited, retried round trip. The permit is held until the body
    /// has been read. Error statuses are returned as replies; only
    /// connection-level failures are retried.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: &Payload,
    ) -> Result<Reply, StoreError> {
        let url = self.url(path);
        retry_with_backoff(&self.retry, &url, is_connection_error, || {
            let method = method.clone();
            let url = url.clone();
            async move {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| StoreError::RateLimiterClosed)?;
                let mut req = self.client.request(method.clone(), &url).query(query);
                if !self.token.is_empty() {
                    req = req.header(TOKEN_HEADER, &self.token);
                }
                req = match payload {
                    Payload::Empty => req,
                    Payload::Json(v) => req.json(v),
                    Payload::Bytes { bytes, mime_type } => req
                        .header(reqwest::header::CONTENT_TYPE, mime_type.as_str())
                        .body(bytes.clone()),
                };
                let resp = req.send().await.map_err(|source| StoreError::Transport {
                    url: url.clone(),
                    source,
                })?;
                let status = resp.status();
                let body = resp
                    .bytes()
                    .await
                    .map_err(|source| StoreError::Transport {
                        url: url.clone(),
                        source,
                    })?;
                Ok(Reply {
                    method,
                    url,
                    status,
                    body: body.to_vec(),
                })
            }
        })
        .await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: Payload,
    ) -> Result<T, StoreError> {
        self.send(method, path, query, &payload)
            .await?
            .success()?
            .decode()
    }

    async fn request_unit(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: Payload,
    ) -> Result<(), StoreError> {
        self.send(method, path, query, &payload).await?.success()?;
        Ok(())
    }
}

/// A fully read response.
struct Reply {
    method: Method,
    url: String,
    status: StatusCode,
    body: Vec<u8>,
}

impl Reply {
    fn success(self) -> Result<Self, StoreError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(StoreError::Status {
            method: self.method.to_string(),
            url: self.url,
            status: self.status.as_u16(),
            body: String::from_utf8_lossy(&self.body).into_owned(),
        })
    }

    fn decode<T: DeserializeOwned>(self) -> Result<T, StoreError> {
        serde_json::from_slice(&self.body).map_err(|e| StoreError::Decode {
            url: self.url,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl StoreBackend for HttpStore {
    async fn create_folder(
        &self,
        parent_id: &str,
        parent_type: ResourceType,
        name: &str,
    ) -> Result<Folder, StoreError> {
        self.request_json(
            Method::POST,
            "folder",
            &[
                ("parentId", parent_id.to_string()),
                ("parentType", parent_type.as_str().to_string()),
                ("name", name.to_string()),
                ("reuseExisting", "true".to_string()),
            ],
            Payload::Empty,
        )
        .await
    }

    async fn create_item(&self, folder_id: &str, name: &str) -> Result<Item, StoreError> {
        self.request_json(
            Method::POST,
            "item",
            &[
                ("folderId", folder_id.to_string()),
                ("name", name.to_string()),
                ("reuseExisting", "true".to_string()),
            ],
            Payload::Empty,
        )
        .await
    }

    async fn get_folder(&self, folder_id: &str) -> Result<Folder, StoreError> {
        self.request_json(
            Method::GET,
            &format!("folder/{folder_id}"),
            &[],
            Payload::Empty,
        )
        .await
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<Folder>, StoreError> {
        self.request_json(
            Method::GET,
            "folder",
            &[
                ("parentId", parent_id.to_string()),
                ("parentType", "folder".to_string()),
                ("limit", "0".to_string()),
            ],
            Payload::Empty,
        )
        .await
    }

    async fn list_items(&self, folder_id: &str) -> Result<Vec<Item>, StoreError> {
        self.request_json(
            Method::GET,
            "item",
            &[
                ("folderId", folder_id.to_string()),
                ("limit", "0".to_string()),
            ],
            Payload::Empty,
        )
        .await
    }

    async fn upload_file(
        &self,
        item_id: &str,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let size = bytes.len();
        self.request_unit(
            Method::POST,
            "file",
            &[
                ("parentType", "item".to_string()),
                ("parentId", item_id.to_string()),
                ("name", name.to_string()),
                ("size", size.to_string()),
                ("mimeType", mime_type.to_string()),
            ],
            Payload::Bytes {
                bytes,
                mime_type: mime_type.to_string(),
            },
        )
        .await?;
        tracing::debug!(
            target: "simwatch_store",
            event = "file_uploaded",
            item_id = item_id,
            name = name,
            size = size as u64,
            "uploaded file"
        );
        Ok(())
    }

    async fn get_metadata(
        &self,
        resource: ResourceType,
        id: &str,
    ) -> Result<Metadata, StoreError> {
        let doc: MetaOnly = self
            .request_json(
                Method::GET,
                &format!("{}/{id}", resource.as_str()),
                &[],
                Payload::Empty,
            )
            .await?;
        Ok(doc.meta)
    }

    async fn put_metadata(
        &self,
        resource: ResourceType,
        id: &str,
        meta: &Metadata,
    ) -> Result<(), StoreError> {
        self.request_unit(
            Method::PUT,
            &format!("{}/{id}/metadata", resource.as_str()),
            &[],
            Payload::Json(Value::Object(meta.clone())),
        )
        .await
    }

    async fn resource_path(&self, id: &str, resource: ResourceType) -> Result<String, StoreError> {
        self.request_json(
            Method::GET,
            &format!("resource/{id}/path"),
            &[("type", resource.as_str().to_string())],
            Payload::Empty,
        )
        .await
    }

    async fn lookup_path(&self, path: &str) -> Result<bool, StoreError> {
        let reply = self
            .send(
                Method::GET,
                "resource/lookup",
                &[("path", path.to_string()), ("test", "true".to_string())],
                &Payload::Empty,
            )
            .await?;
        if matches!(reply.status, StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND) {
            return Ok(false);
        }
        let reply = reply.success()?;
        if reply.body.is_empty() {
            return Ok(false);
        }
        let doc: Value = reply.decode()?;
        Ok(!doc.is_null())
    }

    async fn request_movie(&self, item_id: &str, format: &str) -> Result<(), StoreError> {
        let url = format!("{}/variables/{item_id}/timesteps/movie", self.movie_api_url);
        self.request_unit(
            Method::PUT,
            &url,
            &[("format", format.to_string())],
            Payload::Empty,
        )
        .await
    }
}
