use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use simwatch_core::types::Metadata;

use crate::{Folder, Item, ResourceType, StoreBackend, StoreError};

#[derive(Debug, Clone)]
struct FolderRecord {
    name: String,
    parent_id: Option<String>,
    meta: Metadata,
}

#[derive(Debug, Clone)]
struct ItemRecord {
    name: String,
    folder_id: String,
    meta: Metadata,
    // upload order; a second upload of the same name is kept, like the real store
    files: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    folders: HashMap<String, FolderRecord>,
    items: HashMap<String, ItemRecord>,
    movie_requests: Vec<(String, String)>,
    folder_create_calls: u64,
    upload_calls: u64,
    failing_items: HashSet<String>,
}

impl MemoryState {
    fn alloc_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:024x}", self.next_id)
    }

    fn folder_path(&self, id: &str) -> Result<String, StoreError> {
        let mut parts = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(id) = cursor {
            let folder = self.folders.get(&id).ok_or_else(|| StoreError::NotFound {
                resource: "folder",
                id: id.clone(),
            })?;
            parts.push(folder.name.clone());
            cursor = folder.parent_id.clone();
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    fn child_folder(&self, parent_id: Option<&str>, name: &str) -> Option<String> {
        self.folders
            .iter()
            .find(|(_, f)| f.parent_id.as_deref() == parent_id && f.name == name)
            .map(|(id, _)| id.clone())
    }

    fn child_item(&self, folder_id: &str, name: &str) -> Option<String> {
        self.items
            .iter()
            .find(|(_, i)| i.folder_id == folder_id && i.name == name)
            .map(|(id, _)| id.clone())
    }

    fn to_folder(&self, id: &str) -> Result<Folder, StoreError> {
        let f = self.folders.get(id).ok_or_else(|| StoreError::NotFound {
            resource: "folder",
            id: id.to_string(),
        })?;
        Ok(Folder {
            id: id.to_string(),
            name: f.name.clone(),
            parent_id: f.parent_id.clone(),
            parent_type: f.parent_id.as_ref().map(|_| "folder".to_string()),
            meta: f.meta.clone(),
        })
    }

    fn to_item(&self, id: &str) -> Result<Item, StoreError> {
        let i = self.items.get(id).ok_or_else(|| StoreError::NotFound {
            resource: "item",
            id: id.to_string(),
        })?;
        Ok(Item {
            id: id.to_string(),
            name: i.name.clone(),
            folder_id: i.folder_id.clone(),
            meta: i.meta.clone(),
        })
    }

    fn meta_mut(&mut self, resource: ResourceType, id: &str) -> Result<&mut Metadata, StoreError> {
        let missing = || StoreError::NotFound {
            resource: resource.as_str(),
            id: id.to_string(),
        };
        match resource {
            ResourceType::Folder => self
                .folders
                .get_mut(id)
                .map(|f| &mut f.meta)
                .ok_or_else(missing),
            ResourceType::Item => self
                .items
                .get_mut(id)
                .map(|i| &mut i.meta)
                .ok_or_else(missing),
            ResourceType::Collection | ResourceType::User => Err(missing()),
        }
    }
}

/// In-process [`StoreBackend`]: folders form a single tree of named roots;
/// paths render as `/root/child/.../item/file`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates (or reuses) a top-level folder and returns its id.
    pub fn create_root_folder(&self, name: &str) -> String {
        let mut st = self.state();
        if let Some(id) = st.child_folder(None, name) {
            return id;
        }
        let id = st.alloc_id();
        st.folders.insert(
            id.clone(),
            FolderRecord {
                name: name.to_string(),
                parent_id: None,
                meta: Metadata::new(),
            },
        );
        id
    }

    /// Resolves a `/`-separated folder path below `root_id`.
    pub fn find_folder(&self, root_id: &str, names: &[&str]) -> Option<Folder> {
        let st = self.state();
        let mut current = root_id.to_string();
        for name in names {
            current = st.child_folder(Some(current.as_str()), name)?;
        }
        st.to_folder(&current).ok()
    }

    pub fn find_item(&self, folder_id: &str, name: &str) -> Option<Item> {
        let st = self.state();
        let id = st.child_item(folder_id, name)?;
        st.to_item(&id).ok()
    }

    /// Names of the files attached to an item, in upload order. Duplicate
    /// uploads appear more than once.
    pub fn file_names(&self, item_id: &str) -> Vec<String> {
        self.state()
            .items
            .get(item_id)
            .map(|i| i.files.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// Contents of the most recent upload named `name`.
    pub fn file_bytes(&self, item_id: &str, name: &str) -> Option<Vec<u8>> {
        self.state()
            .items
            .get(item_id)?
            .files
            .iter()
            .rev()
            .find(|(file, _)| file == name)
            .map(|(_, bytes)| bytes.clone())
    }

    /// `(item_id, format)` pairs in request order.
    pub fn movie_requests(&self) -> Vec<(String, String)> {
        self.state().movie_requests.clone()
    }

    pub fn folder_create_calls(&self) -> u64 {
        self.state().folder_create_calls
    }

    pub fn upload_calls(&self) -> u64 {
        self.state().upload_calls
    }

    /// Makes every upload into items named `item_name` fail with a 500.
    pub fn fail_uploads_to(&self, item_name: &str) {
        self.state().failing_items.insert(item_name.to_string());
    }

    pub fn clear_upload_failures(&self) {
        self.state().failing_items.clear();
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn create_folder(
        &self,
        parent_id: &str,
        _parent_type: ResourceType,
        name: &str,
    ) -> Result<Folder, StoreError> {
        let mut st = self.state();
        st.folder_create_calls += 1;
        if !st.folders.contains_key(parent_id) {
            return Err(StoreError::NotFound {
                resource: "folder",
                id: parent_id.to_string(),
            });
        }
        if let Some(id) = st.child_folder(Some(parent_id), name) {
            return st.to_folder(&id);
        }
        let id = st.alloc_id();
        st.folders.insert(
            id.clone(),
            FolderRecord {
                name: name.to_string(),
                parent_id: Some(parent_id.to_string()),
                meta: Metadata::new(),
            },
        );
        st.to_folder(&id)
    }

    async fn create_item(&self, folder_id: &str, name: &str) -> Result<Item, StoreError> {
        let mut st = self.state();
        if !st.folders.contains_key(folder_id) {
            return Err(StoreError::NotFound {
                resource: "folder",
                id: folder_id.to_string(),
            });
        }
        if let Some(id) = st.child_item(folder_id, name) {
            return st.to_item(&id);
        }
        let id = st.alloc_id();
        st.items.insert(
            id.clone(),
            ItemRecord {
                name: name.to_string(),
                folder_id: folder_id.to_string(),
                meta: Metadata::new(),
                files: Vec::new(),
            },
        );
        st.to_item(&id)
    }

    async fn get_folder(&self, folder_id: &str) -> Result<Folder, StoreError> {
        self.state().to_folder(folder_id)
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<Folder>, StoreError> {
        let st = self.state();
        let mut out = st
            .folders
            .iter()
            .filter(|(_, f)| f.parent_id.as_deref() == Some(parent_id))
            .map(|(id, _)| st.to_folder(id))
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn list_items(&self, folder_id: &str) -> Result<Vec<Item>, StoreError> {
        let st = self.state();
        let mut out = st
            .items
            .iter()
            .filter(|(_, i)| i.folder_id == folder_id)
            .map(|(id, _)| st.to_item(id))
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn upload_file(
        &self,
        item_id: &str,
        name: &str,
        _mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut st = self.state();
        st.upload_calls += 1;
        let failing = st
            .items
            .get(item_id)
            .is_some_and(|i| st.failing_items.contains(&i.name));
        if failing {
            return Err(StoreError::Status {
                method: "POST".to_string(),
                url: format!("memory://file?parentId={item_id}&name={name}"),
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        let item = st.items.get_mut(item_id).ok_or_else(|| StoreError::NotFound {
            resource: "item",
            id: item_id.to_string(),
        })?;
        item.files.push((name.to_string(), bytes));
        Ok(())
    }

    async fn get_metadata(
        &self,
        resource: ResourceType,
        id: &str,
    ) -> Result<Metadata, StoreError> {
        let mut st = self.state();
        Ok(st.meta_mut(resource, id)?.clone())
    }

    async fn put_metadata(
        &self,
        resource: ResourceType,
        id: &str,
        meta: &Metadata,
    ) -> Result<(), StoreError> {
        let mut st = self.state();
        let current = st.meta_mut(resource, id)?;
        for (k, v) in meta {
            if v.is_null() {
                current.remove(k);
            } else {
                current.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn resource_path(&self, id: &str, resource: ResourceType) -> Result<String, StoreError> {
        let st = self.state();
        match resource {
            ResourceType::Folder => st.folder_path(id),
            ResourceType::Item => {
                let item = st.items.get(id).ok_or_else(|| StoreError::NotFound {
                    resource: "item",
                    id: id.to_string(),
                })?;
                Ok(format!("{}/{}", st.folder_path(&item.folder_id)?, item.name))
            }
            ResourceType::Collection | ResourceType::User => Err(StoreError::NotFound {
                resource: resource.as_str(),
                id: id.to_string(),
            }),
        }
    }

    async fn lookup_path(&self, path: &str) -> Result<bool, StoreError> {
        let st = self.state();
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let Some((first, rest)) = parts.split_first() else {
            return Ok(false);
        };
        let Some(mut folder) = st.child_folder(None, first) else {
            return Ok(false);
        };
        for (i, name) in rest.iter().enumerate() {
            if let Some(next) = st.child_folder(Some(folder.as_str()), name) {
                folder = next;
                continue;
            }
            let Some(item_id) = st.child_item(&folder, name) else {
                return Ok(false);
            };
            return Ok(match &rest[i + 1..] {
                [] => true,
                [file] => st
                    .items
                    .get(&item_id)
                    .is_some_and(|item| item.files.iter().any(|(stored, _)| stored == file)),
                _ => false,
            });
        }
        Ok(true)
    }

    async fn request_movie(&self, item_id: &str, format: &str) -> Result<(), StoreError> {
        let mut st = self.state();
        if !st.items.contains_key(item_id) {
            return Err(StoreError::NotFound {
                resource: "item",
                id: item_id.to_string(),
            });
        }
        st.movie_requests
            .push((item_id.to_string(), format.to_string()));
        Ok(())
    }
}
