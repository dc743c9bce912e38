#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod http;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use simwatch_core::types::Metadata;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} returned status {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("request rate limiter is closed")]
    RateLimiterClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Folder,
    Item,
    Collection,
    User,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Folder => "folder",
            ResourceType::Item => "item",
            ResourceType::Collection => "collection",
            ResourceType::User => "user",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    #[serde(rename = "parentCollection", default)]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub meta: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "folderId")]
    pub folder_id: String,
    #[serde(default)]
    pub meta: Metadata,
}

/// Raw operations of the remote folder/item/file/metadata store.
///
/// Contract expected from every backend:
/// - `create_folder` / `create_item` reuse an existing child with the same name.
/// - `put_metadata` merges keys into the existing document; `null` deletes a key.
/// - `lookup_path` reports absence as `Ok(false)`, never as an error.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    async fn create_folder(
        &self,
        parent_id: &str,
        parent_type: ResourceType,
        name: &str,
    ) -> Result<Folder, StoreError>;
    async fn create_item(&self, folder_id: &str, name: &str) -> Result<Item, StoreError>;
    async fn get_folder(&self, folder_id: &str) -> Result<Folder, StoreError>;
    async fn list_folders(&self, parent_id: &str) -> Result<Vec<Folder>, StoreError>;
    async fn list_items(&self, folder_id: &str) -> Result<Vec<Item>, StoreError>;
    async fn upload_file(
        &self,
        item_id: &str,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError>;
    async fn get_metadata(&self, resource: ResourceType, id: &str)
        -> Result<Metadata, StoreError>;
    async fn put_metadata(
        &self,
        resource: ResourceType,
        id: &str,
        meta: &Metadata,
    ) -> Result<(), StoreError>;
    async fn resource_path(&self, id: &str, resource: ResourceType) -> Result<String, StoreError>;
    async fn lookup_path(&self, path: &str) -> Result<bool, StoreError>;
    /// Asks the rendering service to build a movie of `item_id` in `format`.
    async fn request_movie(&self, item_id: &str, format: &str) -> Result<(), StoreError>;
}

/// Serializes read-modify-write cycles on one metadata document.
///
/// The store's metadata PUT is not atomic with the preceding GET, so every
/// writer of a given record must hold the same lock.
#[derive(Debug, Clone)]
pub struct MetadataLock {
    name: Arc<str>,
    inner: Arc<Mutex<()>>,
}

impl MetadataLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

type FolderKey = (String, ResourceType, String);

/// Session-scoped client over a [`StoreBackend`].
///
/// Folder/item creation and path resolution are memoized for the lifetime of
/// the client. Creation is serialized because the remote create-or-reuse is not
/// atomic for two concurrent callers using the same name under the same parent.
pub struct StoreClient {
    backend: Arc<dyn StoreBackend>,
    folders: Mutex<HashMap<FolderKey, Folder>>,
    items: Mutex<HashMap<(String, String), Item>>,
    paths: Mutex<HashMap<(String, ResourceType), String>>,
    folder_create: Mutex<()>,
    item_create: Mutex<()>,
    movie_create: Mutex<()>,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            folders: Mutex::new(HashMap::new()),
            items: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
            folder_create: Mutex::new(()),
            item_create: Mutex::new(()),
            movie_create: Mutex::new(()),
        }
    }

    /// Returns the cached folder, so its `meta` may be stale; read metadata
    /// through [`StoreClient::get_metadata`].
    pub async fn create_folder(
        &self,
        parent_id: &str,
        parent_type: ResourceType,
        name: &str,
    ) -> Result<Folder, StoreError> {
        let key: FolderKey = (parent_id.to_string(), parent_type, name.to_string());
        if let Some(folder) = self.folders.lock().await.get(&key) {
            return Ok(folder.clone());
        }

        let _create = self.folder_create.lock().await;
        if let Some(folder) = self.folders.lock().await.get(&key) {
            return Ok(folder.clone());
        }
        let folder = self
            .backend
            .create_folder(parent_id, parent_type, name)
            .await?;
        self.folders.lock().await.insert(key, folder.clone());
        Ok(folder)
    }

    /// Walks (creating as needed) `names` below the folder `parent_id`.
    pub async fn ensure_folders(
        &self,
        parent_id: &str,
        names: &[&str],
    ) -> Result<Folder, StoreError> {
        let mut current: Option<Folder> = None;
        for name in names {
            let parent = current.as_ref().map(|f| f.id.as_str()).unwrap_or(parent_id);
            current = Some(self.create_folder(parent, ResourceType::Folder, name).await?);
        }
        match current {
            Some(folder) => Ok(folder),
            None => self.backend.get_folder(parent_id).await,
        }
    }

    pub async fn create_item(&self, folder_id: &str, name: &str) -> Result<Item, StoreError> {
        let key = (folder_id.to_string(), name.to_string());
        if let Some(item) = self.items.lock().await.get(&key) {
            return Ok(item.clone());
        }

        let _create = self.item_create.lock().await;
        if let Some(item) = self.items.lock().await.get(&key) {
            return Ok(item.clone());
        }
        let item = self.backend.create_item(folder_id, name).await?;
        self.items.lock().await.insert(key, item.clone());
        Ok(item)
    }

    pub async fn get_folder(&self, folder_id: &str) -> Result<Folder, StoreError> {
        self.backend.get_folder(folder_id).await
    }

    pub async fn list_folders(&self, parent_id: &str) -> Result<Vec<Folder>, StoreError> {
        self.backend.list_folders(parent_id).await
    }

    pub async fn list_items(&self, folder_id: &str) -> Result<Vec<Item>, StoreError> {
        self.backend.list_items(folder_id).await
    }

    /// Attaches `bytes` to `item` as `file_name`. Does not check for an
    /// existing file; see [`StoreClient::file_exist`].
    pub async fn upload_file(
        &self,
        item: &Item,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mime_type = guess_mime_type(file_name);
        self.backend
            .upload_file(&item.id, file_name, mime_type, bytes)
            .await
    }

    pub async fn file_exist(&self, item: &Item, name: &str) -> Result<bool, StoreError> {
        let item_path = self.resource_path(&item.id, ResourceType::Item).await?;
        self.backend
            .lookup_path(&format!("{item_path}/{name}"))
            .await
    }

    pub async fn resource_path(
        &self,
        id: &str,
        resource: ResourceType,
    ) -> Result<String, StoreError> {
        let key = (id.to_string(), resource);
        if let Some(path) = self.paths.lock().await.get(&key) {
            return Ok(path.clone());
        }
        let path = self.backend.resource_path(id, resource).await?;
        self.paths.lock().await.insert(key, path.clone());
        Ok(path)
    }

    pub async fn get_metadata(
        &self,
        resource: ResourceType,
        id: &str,
    ) -> Result<Metadata, StoreError> {
        self.backend.get_metadata(resource, id).await
    }

    /// Writes (merges) `meta`, holding `lock` for the duration when given.
    pub async fn set_metadata(
        &self,
        resource: ResourceType,
        id: &str,
        meta: &Metadata,
        lock: Option<&MetadataLock>,
    ) -> Result<(), StoreError> {
        let _guard = match lock {
            Some(lock) => Some(lock.acquire().await),
            None => None,
        };
        self.backend.put_metadata(resource, id, meta).await
    }

    /// Read-modify-write under `lock`. `patch` maps the current metadata to the
    /// keys to write; an empty patch skips the write. Returns the patch.
    pub async fn update_metadata<F>(
        &self,
        resource: ResourceType,
        id: &str,
        lock: &MetadataLock,
        patch: F,
    ) -> Result<Metadata, StoreError>
    where
        F: FnOnce(&Metadata) -> Metadata,
    {
        let _guard = lock.acquire().await;
        let current = self.backend.get_metadata(resource, id).await?;
        let update = patch(&current);
        if !update.is_empty() {
            self.backend.put_metadata(resource, id, &update).await?;
            tracing::debug!(
                lock = %lock.name,
                resource = %resource,
                id = id,
                keys = update.len(),
                "metadata updated"
            );
        }
        Ok(update)
    }

    /// One movie job per call; concurrent requests are serialized so the same
    /// item is never submitted twice at once.
    pub async fn request_movie(&self, item: &Item, format: &str) -> Result<(), StoreError> {
        let _create = self.movie_create.lock().await;
        self.backend.request_movie(&item.id, format).await
    }
}

pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "json" => "application/json",
        "tgz" | "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "mp4" => "video/mp4",
        "mpg" | "mpeg" => "video/mpeg",
        _ => "application/octet-stream",
    }
}
