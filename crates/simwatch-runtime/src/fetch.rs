use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use simwatch_core::types::{
    current_timestep, highest_timestep, meta_keys, timestep_label, validate_manifest,
    ManifestEntry, ManifestError, Metadata, RunKey, VariableRecord,
};
use simwatch_observe::metrics::ScopedTimer;
use simwatch_store::{Item, MetadataLock, ResourceType};
use tokio::task::JoinSet;
use tracing::{info_span, Instrument};

use crate::archive::{unpack_into, ContainerArchive, TimestepArchive};
use crate::container::range_patch;
use crate::scheduler::{FetchExecutor, FetchJob};
use crate::session::WatchContext;

pub const TIMESTEPS_FOLDER: &str = "timesteps";
pub const MOVIES_FOLDER: &str = "movies";

/// Why a timestep was given up on without uploading anything. Skipped
/// timesteps still advance the run's progress.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    MissingManifest,
    EmptyManifest,
    MalformedManifest(String),
    InvalidManifest(ManifestError),
    MissingArchive,
    CorruptArchive(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingManifest => f.write_str("variables.json not found"),
            SkipReason::EmptyManifest => f.write_str("variables.json lists no variables"),
            SkipReason::MalformedManifest(e) => write!(f, "variables.json is malformed: {e}"),
            SkipReason::InvalidManifest(e) => write!(f, "{e}"),
            SkipReason::MissingArchive => f.write_str("images.tar.gz not found"),
            SkipReason::CorruptArchive(e) => write!(f, "images.tar.gz is unreadable: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Uploaded {
        files: usize,
        skipped_existing: usize,
    },
    Skipped(SkipReason),
}

enum UploadResult {
    Uploaded(u64),
    Existing,
}

/// Inserts `timestep`/`time` into the parallel `timesteps`/`time` arrays,
/// keeping them ascending. `None` if `timestep` is already recorded.
pub fn insert_timestep(
    current: &Metadata,
    timestep: u64,
    time: f64,
) -> Option<(Vec<Value>, Vec<Value>)> {
    let mut timesteps: Vec<Value> = current
        .get(meta_keys::TIMESTEPS)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut times: Vec<Value> = current
        .get(meta_keys::TIME)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if timesteps.iter().any(|v| v.as_u64() == Some(timestep)) {
        return None;
    }
    let pos = timesteps
        .iter()
        .position(|v| v.as_u64().is_some_and(|t| t > timestep))
        .unwrap_or(timesteps.len());
    timesteps.insert(pos, json!(timestep));
    times.insert(pos.min(times.len()), json!(time));
    Some((timesteps, times))
}

/// Fetch job executor for one run.
pub struct RunFetcher {
    ctx: Arc<WatchContext>,
    run: RunKey,
    root_folder_id: String,
    run_folder_id: String,
    progress_lock: MetadataLock,
    variable_lock: MetadataLock,
    // lowest timestep that failed; progress is not persisted beyond it
    stalled_at: Mutex<Option<u64>>,
}

impl RunFetcher {
    pub fn new(
        ctx: Arc<WatchContext>,
        run: RunKey,
        root_folder_id: String,
        run_folder_id: String,
        progress_lock: MetadataLock,
    ) -> Self {
        let variable_lock = MetadataLock::new(format!("variables:{run}"));
        Self {
            ctx,
            run,
            root_folder_id,
            run_folder_id,
            progress_lock,
            variable_lock,
            stalled_at: Mutex::new(None),
        }
    }

    pub fn stalled_at(&self) -> Option<u64> {
        *self.stalled_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stall(&self, timestep: u64) {
        let mut stalled = self.stalled_at.lock().unwrap_or_else(|e| e.into_inner());
        *stalled = Some(stalled.map_or(timestep, |s| s.min(timestep)));
    }

    fn run_path<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut path = vec![self.run.shot.as_str(), self.run.run.as_str()];
        path.extend_from_slice(rest);
        path
    }

    /// Processes one timestep end to end, without touching run progress.
    pub async fn fetch_timestep(&self, job: FetchJob) -> Result<FetchOutcome> {
        let timestep = job.timestep;
        let layout = &self.ctx.layout;
        let source = &self.ctx.source;

        tracing::info!(event = "fetch_manifest", "fetching variables.json");
        let url = layout.variables_url(&self.run, timestep);
        let Some(raw) = source.fetch_json(&url).await? else {
            return Ok(FetchOutcome::Skipped(SkipReason::MissingManifest));
        };
        let entries: Vec<ManifestEntry> = match serde_json::from_value(raw) {
            Ok(entries) => entries,
            Err(e) => {
                return Ok(FetchOutcome::Skipped(SkipReason::MalformedManifest(
                    e.to_string(),
                )))
            }
        };
        if entries.is_empty() {
            return Ok(FetchOutcome::Skipped(SkipReason::EmptyManifest));
        }
        let records = match validate_manifest(&entries) {
            Ok(records) => records,
            Err(e) => return Ok(FetchOutcome::Skipped(SkipReason::InvalidManifest(e))),
        };

        tracing::info!(event = "fetch_archive", "fetching images.tar.gz");
        let url = layout.archive_url(&self.run, timestep);
        let Some(bytes) = source.fetch_binary(&url).await? else {
            return Ok(FetchOutcome::Skipped(SkipReason::MissingArchive));
        };
        let archive = match tokio::task::spawn_blocking(move || TimestepArchive::from_tar_gz(&bytes))
            .await
            .context("archive decode task failed")?
        {
            Ok(archive) => archive,
            Err(e) => {
                return Ok(FetchOutcome::Skipped(SkipReason::CorruptArchive(format!(
                    "{e:#}"
                ))))
            }
        };

        let mut items: BTreeMap<String, Item> = BTreeMap::new();
        for record in &records {
            let item = self
                .ensure_variable_item(record, timestep)
                .await
                .with_context(|| format!("recording variable {}", record.attribute_name))?;
            items.insert(record.attribute_name.clone(), item);
        }

        let file_names: Vec<String> = records.iter().map(|r| r.file_name.clone()).collect();
        let containers = tokio::task::spawn_blocking(move || {
            archive.decompose(file_names.iter().map(String::as_str))
        })
        .await
        .context("archive split task failed")??;

        for container in &containers {
            self.update_ranges(container, &items).await?;
        }

        self.upload_containers(timestep, containers, job.check_exists)
            .await
    }

    /// Ensures the variable item and its movie twin exist and records this
    /// timestep on the variable item.
    async fn ensure_variable_item(&self, record: &VariableRecord, timestep: u64) -> Result<Item> {
        let store = &self.ctx.store;
        let root = self.root_folder_id.as_str();

        let shot_folder = store.ensure_folders(root, &[self.run.shot.as_str()]).await?;
        let group_folder = store
            .ensure_folders(root, &self.run_path(&[record.group_name.as_str()]))
            .await?;
        let item = store
            .create_item(&group_folder.id, &record.attribute_name)
            .await?;

        let movie_folder = store
            .ensure_folders(root, &self.run_path(&[MOVIES_FOLDER, record.group_name.as_str()]))
            .await?;
        let movie_item = store
            .create_item(&movie_folder.id, &record.attribute_name)
            .await?;
        let mut movie_meta = Metadata::new();
        movie_meta.insert(meta_keys::ITEM_ID.to_string(), json!(item.id));
        store
            .set_metadata(
                ResourceType::Item,
                &movie_item.id,
                &movie_meta,
                Some(&self.variable_lock),
            )
            .await?;

        let run_folder_id = self.run_folder_id.clone();
        let movie_item_id = json!(movie_item.id);
        store
            .update_metadata(ResourceType::Item, &item.id, &self.variable_lock, |current| {
                let mut patch = Metadata::new();
                if !current.contains_key(meta_keys::RUN_FOLDER_ID) {
                    patch.insert(meta_keys::RUN_FOLDER_ID.to_string(), json!(run_folder_id));
                    patch.insert(meta_keys::SHOT_FOLDER_ID.to_string(), json!(shot_folder.id));
                }
                if let Some((timesteps, times)) = insert_timestep(current, timestep, record.time) {
                    patch.insert(meta_keys::TIMESTEPS.to_string(), Value::Array(timesteps));
                    patch.insert(meta_keys::TIME.to_string(), Value::Array(times));
                }
                if current.get(meta_keys::MOVIE_ITEM_ID) != Some(&movie_item_id) {
                    patch.insert(meta_keys::MOVIE_ITEM_ID.to_string(), movie_item_id.clone());
                }
                patch
            })
            .await?;
        Ok(item)
    }

    async fn update_ranges(
        &self,
        container: &ContainerArchive,
        items: &BTreeMap<String, Item>,
    ) -> Result<()> {
        let members = container.members.clone();
        let root = container.root.clone();
        let inspector = self.ctx.inspector.clone();
        let inspected = tokio::task::spawn_blocking(move || {
            let scratch = tempfile::tempdir().context("creating scratch dir")?;
            unpack_into(&members, scratch.path())?;
            inspector.inspect(&scratch.path().join(&root))
        })
        .await
        .context("container inspect task failed")?;

        let summary = match inspected {
            Ok(Some(summary)) => summary,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    event = "inspect_failed",
                    container = %container.file_name,
                    error = %format!("{e:#}"),
                    "container has unreadable range data"
                );
                return Ok(());
            }
        };

        for (variable, item) in items {
            if !summary.attributes.contains_key(variable) {
                continue;
            }
            self.ctx
                .store
                .update_metadata(
                    ResourceType::Item,
                    &item.id,
                    &self.variable_lock,
                    |current| range_patch(&summary, variable, current).unwrap_or_default(),
                )
                .await
                .with_context(|| format!("updating ranges of {variable}"))?;
        }
        Ok(())
    }

    async fn upload_containers(
        &self,
        timestep: u64,
        containers: Vec<ContainerArchive>,
        check_exists: bool,
    ) -> Result<FetchOutcome> {
        let store = self.ctx.store.clone();
        let folder = store
            .ensure_folders(&self.root_folder_id, &self.run_path(&[TIMESTEPS_FOLDER]))
            .await?;
        let item = store
            .create_item(&folder.id, &timestep_label(timestep))
            .await?;

        let mut uploads = JoinSet::new();
        for container in containers {
            let store = store.clone();
            let item = item.clone();
            let name = container.upload_name;
            let bytes = container.packed;
            uploads.spawn(
                async move {
                    if check_exists
                        && store
                            .file_exist(&item, &name)
                            .await
                            .with_context(|| format!("checking {name}"))?
                    {
                        tracing::info!(event = "upload_skipped", file = %name, "already uploaded");
                        return Ok(UploadResult::Existing);
                    }
                    let size = bytes.len() as u64;
                    tracing::info!(event = "upload", file = %name, size = size, "uploading container");
                    store
                        .upload_file(&item, &name, bytes)
                        .await
                        .with_context(|| format!("uploading {name}"))?;
                    Ok::<_, anyhow::Error>(UploadResult::Uploaded(size))
                }
                .in_current_span(),
            );
        }

        let mut files = 0usize;
        let mut skipped_existing = 0usize;
        let mut first_err: Option<anyhow::Error> = None;
        while let Some(res) = uploads.join_next().await {
            match res.context("upload task failed") {
                Ok(Ok(UploadResult::Uploaded(size))) => {
                    files += 1;
                    self.ctx.metrics.files_uploaded_total.inc();
                    self.ctx.metrics.bytes_uploaded_total.inc_by(size);
                }
                Ok(Ok(UploadResult::Existing)) => {
                    skipped_existing += 1;
                    self.ctx.metrics.files_skipped_existing_total.inc();
                }
                Ok(Err(e)) | Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(FetchOutcome::Uploaded {
            files,
            skipped_existing,
        })
    }

    /// Raises `highestTimestep` to `timestep`, and `currentTimestep` too
    /// unless this or an earlier timestep failed.
    async fn record_progress(&self, timestep: u64) -> Result<()> {
        let held = self.stalled_at().filter(|stalled| timestep >= *stalled);
        if let Some(stalled) = held {
            tracing::warn!(
                event = "progress_held",
                stalled_at = stalled,
                "not advancing progress past a failed timestep"
            );
        }
        self.ctx
            .store
            .update_metadata(
                ResourceType::Folder,
                &self.run_folder_id,
                &self.progress_lock,
                |current| {
                    let mut patch = Metadata::new();
                    if highest_timestep(current).map_or(true, |old| old < timestep) {
                        patch.insert(meta_keys::HIGHEST_TIMESTEP.to_string(), json!(timestep));
                    }
                    let advances = current_timestep(current).map_or(true, |old| old < timestep);
                    if held.is_none() && advances {
                        patch.insert(meta_keys::CURRENT_TIMESTEP.to_string(), json!(timestep));
                    }
                    patch
                },
            )
            .await
            .context("recording progress")?;
        Ok(())
    }

    async fn execute_inner(&self, job: FetchJob) -> Result<()> {
        let metrics = &self.ctx.metrics;
        let outcome = {
            let _timer = ScopedTimer::new(&metrics.timestep_duration);
            self.fetch_timestep(job).await
        };
        match outcome {
            Ok(FetchOutcome::Uploaded {
                files,
                skipped_existing,
            }) => {
                metrics.timesteps_fetched_total.inc();
                tracing::info!(
                    event = "timestep_done",
                    files = files,
                    skipped_existing = skipped_existing,
                    "timestep ingested"
                );
            }
            Ok(FetchOutcome::Skipped(reason)) => {
                metrics.timesteps_skipped_total.inc();
                tracing::warn!(
                    event = "timestep_skipped",
                    reason = %reason,
                    "skipping timestep"
                );
            }
            Err(err) => {
                metrics.timesteps_failed_total.inc();
                self.stall(job.timestep);
                // part of the timestep may be uploaded already
                if let Err(mark_err) = self.record_progress(job.timestep).await {
                    tracing::warn!(
                        event = "progress_write_failed",
                        error = %format!("{mark_err:#}"),
                        "could not record high-water mark"
                    );
                }
                return Err(err);
            }
        }
        self.record_progress(job.timestep).await
    }
}

#[async_trait]
impl FetchExecutor for RunFetcher {
    async fn execute(&self, job: FetchJob) -> Result<()> {
        let span = info_span!(
            "timestep",
            shot = %self.run.shot,
            run = %self.run.run,
            timestep = job.timestep,
            check_exists = job.check_exists
        );
        self.execute_inner(job).instrument(span).await
    }
}
