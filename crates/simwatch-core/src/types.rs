use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Store metadata document (a JSON object).
pub type Metadata = Map<String, Value>;

/// Metadata keys written by the watcher. These are read by the dashboard, so
/// they keep the store's camelCase convention.
pub mod meta_keys {
    pub const CURRENT_TIMESTEP: &str = "currentTimestep";
    /// Highest timestep any session has attempted; files at or below it may
    /// already be in the store.
    pub const HIGHEST_TIMESTEP: &str = "highestTimestep";
    pub const USERNAME: &str = "username";
    pub const MACHINE: &str = "machine";
    pub const USERS: &str = "users";
    pub const MACHINES: &str = "machines";
    pub const TIMESTEPS: &str = "timesteps";
    pub const TIME: &str = "time";
    pub const X_RANGE: &str = "x_range";
    pub const Y_RANGE: &str = "y_range";
    pub const COLOR_RANGE: &str = "color_range";
    pub const RUN_FOLDER_ID: &str = "runFolderId";
    pub const SHOT_FOLDER_ID: &str = "shotFolderId";
    pub const MOVIE_ITEM_ID: &str = "movieItemId";
    pub const ITEM_ID: &str = "itemId";
}

/// Identity of a tracked run: `shot/run`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub shot: String,
    pub run: String,
}

impl RunKey {
    pub fn new(shot: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            shot: shot.into(),
            run: run.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shot, self.run)
    }
}

/// One entry of `shots/index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotIndexEntry {
    pub shot_name: String,
    pub run_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub machine_name: Option<String>,
    /// Creation timestamp as published by the upload site (ISO-8601, not parsed).
    #[serde(default)]
    pub date: Option<String>,
}

impl ShotIndexEntry {
    pub fn run_key(&self) -> RunKey {
        RunKey::new(self.shot_name.clone(), self.run_name.clone())
    }
}

/// Contents of a run's `time.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub current: u64,
    #[serde(default)]
    pub complete: bool,
}

/// One entry of a timestep's `variables.json`, exactly as uploaded.
///
/// Every field is optional at this level; [`ManifestEntry::validate`] decides
/// whether the entry is usable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub attribute_name: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub time: Option<f64>,
}

/// A manifest entry with every required field present.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableRecord {
    pub attribute_name: String,
    pub group_name: String,
    pub file_name: String,
    pub time: f64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest entry is missing attribute_name")]
    MissingAttributeName,
    #[error("manifest entry for '{variable}' is missing {field}")]
    MissingField {
        variable: String,
        field: &'static str,
    },
}

impl ManifestEntry {
    pub fn validate(&self) -> Result<VariableRecord, ManifestError> {
        let attribute_name = match self.attribute_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => return Err(ManifestError::MissingAttributeName),
        };
        let missing = |field: &'static str| ManifestError::MissingField {
            variable: attribute_name.clone(),
            field,
        };

        let group_name = self
            .group_name
            .clone()
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| missing("group_name"))?;
        let time = self.time.ok_or_else(|| missing("time"))?;
        let file_name = self
            .file_name
            .clone()
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| missing("file_name"))?;

        Ok(VariableRecord {
            attribute_name,
            group_name,
            file_name,
            time,
        })
    }
}

/// Validates a whole manifest; the first bad entry rejects it.
pub fn validate_manifest(entries: &[ManifestEntry]) -> Result<Vec<VariableRecord>, ManifestError> {
    entries.iter().map(ManifestEntry::validate).collect()
}

pub const MESH_COLORMAP: &str = "mesh-colormap";

/// Per-variable plot description stored alongside the data in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotAttributes {
    #[serde(rename = "type")]
    pub plot_type: String,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<OneOrMany>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl PlotAttributes {
    /// Every plot type except `mesh-colormap` carries x/y axes.
    pub fn has_axes(&self) -> bool {
        self.plot_type != MESH_COLORMAP
    }

    pub fn y_names(&self) -> Vec<&str> {
        match &self.y {
            None => Vec::new(),
            Some(OneOrMany::One(name)) => vec![name.as_str()],
            Some(OneOrMany::Many(names)) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Reads `currentTimestep` from a run folder's metadata.
pub fn current_timestep(meta: &Metadata) -> Option<u64> {
    meta.get(meta_keys::CURRENT_TIMESTEP).and_then(Value::as_u64)
}

pub fn highest_timestep(meta: &Metadata) -> Option<u64> {
    meta.get(meta_keys::HIGHEST_TIMESTEP).and_then(Value::as_u64)
}

/// Zero-padded name used for timestep items (`7` -> `0007`).
pub fn timestep_label(timestep: u64) -> String {
    format!("{timestep:04}")
}
