use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use simwatch_core::types::{meta_keys, Metadata, RunKey, ShotIndexEntry};
use simwatch_store::{MetadataLock, ResourceType};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::run_watcher::RunWatcher;
use crate::session::WatchContext;
use crate::source::fetch_typed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPoll {
    /// `shots/index.json` is not published yet.
    NotReady,
    Polled { new_runs: usize },
}

/// Discovers runs from `shots/index.json` and starts a [`RunWatcher`] for each.
pub struct IndexWatcher {
    ctx: Arc<WatchContext>,
    root_folder_id: String,
    cancel: CancellationToken,
    watched: HashSet<RunKey>,
    users: BTreeSet<String>,
    machines: BTreeSet<String>,
    index_lock: MetadataLock,
    runs: JoinSet<(RunKey, Result<()>)>,
}

fn string_set(meta: &Metadata, key: &str) -> BTreeSet<String> {
    meta.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl IndexWatcher {
    pub fn new(ctx: Arc<WatchContext>, root_folder_id: String, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            root_folder_id,
            cancel,
            watched: HashSet::new(),
            users: BTreeSet::new(),
            machines: BTreeSet::new(),
            index_lock: MetadataLock::new("shot-index"),
            runs: JoinSet::new(),
        }
    }

    /// Loads the user/machine lists already recorded on the top-level folder.
    pub async fn seeded(mut self) -> Result<Self> {
        let meta = self
            .ctx
            .store
            .get_metadata(ResourceType::Folder, &self.root_folder_id)
            .await
            .context("reading top-level folder metadata")?;
        self.users = string_set(&meta, meta_keys::USERS);
        self.machines = string_set(&meta, meta_keys::MACHINES);
        Ok(self)
    }

    pub fn watched(&self) -> Vec<RunKey> {
        let mut keys: Vec<RunKey> = self.watched.iter().cloned().collect();
        keys.sort();
        keys
    }

    fn spawn_run(&mut self, entry: ShotIndexEntry) {
        let key = entry.run_key();
        let span = info_span!("run", shot = %key.shot, run = %key.run);
        let watcher = RunWatcher::new(
            self.ctx.clone(),
            entry,
            self.root_folder_id.clone(),
            self.cancel.child_token(),
        );
        self.ctx.metrics.runs_discovered_total.inc();
        self.runs.spawn(
            async move {
                let res = watcher.run().await;
                (key, res)
            }
            .instrument(span),
        );
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.runs.try_join_next() {
            log_run_exit(joined);
        }
    }

    /// One pass over the shot index.
    pub async fn poll_once(&mut self) -> Result<IndexPoll> {
        self.ctx.metrics.index_polls_total.inc();
        self.reap_finished();

        let url = self.ctx.layout.index_url();
        let Some(index) = fetch_typed::<Vec<ShotIndexEntry>>(self.ctx.source.as_ref(), &url)
            .await
            .context("fetching shot index")?
        else {
            return Ok(IndexPoll::NotReady);
        };

        let mut new_runs = 0usize;
        for entry in index {
            if let Some(user) = &entry.username {
                self.users.insert(user.clone());
            }
            if let Some(machine) = &entry.machine_name {
                self.machines.insert(machine.clone());
            }
            if self.watched.insert(entry.run_key()) {
                tracing::info!(
                    event = "run_discovered",
                    shot = %entry.shot_name,
                    run = %entry.run_name,
                    "discovered run"
                );
                self.spawn_run(entry);
                new_runs += 1;
            }
        }

        let mut meta = Metadata::new();
        meta.insert(meta_keys::MACHINES.to_string(), json!(self.machines));
        meta.insert(meta_keys::USERS.to_string(), json!(self.users));
        self.ctx
            .store
            .set_metadata(
                ResourceType::Folder,
                &self.root_folder_id,
                &meta,
                Some(&self.index_lock),
            )
            .await
            .context("recording users and machines")?;

        Ok(IndexPoll::Polled { new_runs })
    }

    /// Polls until cancelled, then waits for every run watcher to stop.
    pub async fn run(mut self) -> Result<()> {
        let interval = self.ctx.config.shot_poll_interval;
        loop {
            match self.poll_once().await {
                Ok(IndexPoll::NotReady) => tracing::warn!(
                    event = "index_not_ready",
                    wait_ms = interval.as_millis() as u64,
                    "shots/index.json not available yet"
                ),
                Ok(IndexPoll::Polled { .. }) => {}
                Err(err) => tracing::warn!(
                    event = "index_poll_failed",
                    error = %format!("{err:#}"),
                    "shot index poll failed"
                ),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Cancels every run watcher and waits for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.runs.join_next().await {
            log_run_exit(joined);
        }
    }
}

fn log_run_exit(joined: Result<(RunKey, Result<()>), tokio::task::JoinError>) {
    match joined {
        Ok((key, Ok(()))) => {
            tracing::info!(event = "run_exited", run = %key, "run watcher finished");
        }
        Ok((key, Err(err))) => {
            tracing::error!(
                event = "run_failed",
                run = %key,
                error = %format!("{err:#}"),
                "run watcher failed"
            );
        }
        Err(err) if err.is_cancelled() => {}
        Err(err) => {
            tracing::error!(event = "run_panicked", error = %err, "run watcher panicked");
        }
    }
}
