use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use simwatch_core::types::{
    current_timestep, highest_timestep, meta_keys, Metadata, RunStatus, ShotIndexEntry,
};
use simwatch_store::{MetadataLock, ResourceType};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::fetch::RunFetcher;
use crate::movies::create_movies;
use crate::scheduler::{FetchJob, FetchScheduler};
use crate::session::WatchContext;
use crate::source::fetch_typed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Discovered,
    Active,
    Draining,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    /// Nothing new.
    Idle,
    /// The source reports an older timestep than already scheduled.
    Stale { current: u64 },
    Schedule(Vec<FetchJob>),
    /// Complete and caught up.
    Drain,
}

/// Turns successive `time.json` observations into fetch jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlanner {
    last_scheduled: u64,
    // timesteps up to here were attempted by an earlier session
    checked_through: u64,
}

impl RunPlanner {
    /// `last_processed` is the persisted `currentTimestep` (0 if none).
    pub fn new(last_processed: u64) -> Self {
        Self::resume(last_processed, last_processed)
    }

    /// Like [`RunPlanner::new`], but every timestep up to `highest_attempted`
    /// (the persisted `highestTimestep`) is existence-checked.
    pub fn resume(last_processed: u64, highest_attempted: u64) -> Self {
        Self {
            last_scheduled: last_processed,
            checked_through: highest_attempted,
        }
    }

    pub fn last_scheduled(&self) -> u64 {
        self.last_scheduled
    }

    pub fn plan(&mut self, status: RunStatus) -> PlanDecision {
        let last = self.last_scheduled;
        if status.complete && last >= status.current {
            return PlanDecision::Drain;
        }
        if status.current < last {
            return PlanDecision::Stale {
                current: status.current,
            };
        }
        if status.current == last {
            return PlanDecision::Idle;
        }

        let checked_through = self.checked_through;
        let jobs = if status.current == last + 1 {
            // First timestep may have been partially uploaded by an earlier session.
            vec![FetchJob::new(
                status.current,
                last == 0 || status.current <= checked_through,
            )]
        } else {
            std::iter::once(FetchJob::new(last + 1, true))
                .chain(
                    (last + 2..=status.current)
                        .map(|t| FetchJob::new(t, t <= checked_through)),
                )
                .collect()
        };
        self.last_scheduled = status.current;
        PlanDecision::Schedule(jobs)
    }
}

/// Follows one run from discovery to completion.
pub struct RunWatcher {
    ctx: Arc<WatchContext>,
    entry: ShotIndexEntry,
    root_folder_id: String,
    cancel: CancellationToken,
    phase: watch::Sender<RunPhase>,
}

impl RunWatcher {
    pub fn new(
        ctx: Arc<WatchContext>,
        entry: ShotIndexEntry,
        root_folder_id: String,
        cancel: CancellationToken,
    ) -> Self {
        let (phase, _) = watch::channel(RunPhase::Discovered);
        Self {
            ctx,
            entry,
            root_folder_id,
            cancel,
            phase,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
        tracing::info!(event = "run_phase", phase = ?phase, "run phase changed");
    }

    /// Sleeps for `dur`; `false` if cancelled first.
    async fn pause(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(dur) => true,
        }
    }

    pub async fn run(self) -> Result<()> {
        let key = self.entry.run_key();
        let store = self.ctx.store.clone();
        let metrics = self.ctx.metrics.clone();
        tracing::info!(event = "run_started", "starting to watch run");

        let run_folder = store
            .ensure_folders(&self.root_folder_id, &[key.shot.as_str(), key.run.as_str()])
            .await
            .context("creating run folder")?;
        let progress_lock = MetadataLock::new(format!("progress:{key}"));

        let mut owner = Metadata::new();
        if let Some(username) = &self.entry.username {
            owner.insert(meta_keys::USERNAME.to_string(), json!(username));
        }
        if let Some(machine) = &self.entry.machine_name {
            owner.insert(meta_keys::MACHINE.to_string(), json!(machine));
        }
        if !owner.is_empty() {
            store
                .set_metadata(
                    ResourceType::Folder,
                    &run_folder.id,
                    &owner,
                    Some(&progress_lock),
                )
                .await
                .context("recording run owner")?;
        }

        let meta = store
            .get_metadata(ResourceType::Folder, &run_folder.id)
            .await
            .context("reading run progress")?;
        let last = current_timestep(&meta);
        let highest = highest_timestep(&meta).unwrap_or(0);
        match last {
            Some(last) => tracing::info!(
                event = "run_resumed",
                last_timestep = last,
                highest_timestep = highest,
                "resuming run"
            ),
            None => tracing::info!(
                event = "run_fresh",
                highest_timestep = highest,
                "no timestep processed yet"
            ),
        }
        let mut planner = RunPlanner::resume(last.unwrap_or(0), highest);

        let fetcher = Arc::new(RunFetcher::new(
            self.ctx.clone(),
            key.clone(),
            self.root_folder_id.clone(),
            run_folder.id.clone(),
            progress_lock,
        ));
        let scheduler = FetchScheduler::spawn(fetcher, self.cancel.child_token());

        metrics.runs_active.inc();
        self.set_phase(RunPhase::Active);
        let time_url = self.ctx.layout.time_url(&key);
        let config = &self.ctx.config;
        let mut drained = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let status = match fetch_typed::<RunStatus>(self.ctx.source.as_ref(), &time_url).await
            {
                Ok(Some(status)) => status,
                Ok(None) => {
                    tracing::warn!(
                        event = "time_not_ready",
                        wait_ms = config.not_ready_interval.as_millis() as u64,
                        "time.json not available yet"
                    );
                    if !self.pause(config.not_ready_interval).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        event = "time_fetch_failed",
                        error = %format!("{err:#}"),
                        "unable to read time.json"
                    );
                    if !self.pause(config.not_ready_interval).await {
                        break;
                    }
                    continue;
                }
            };

            match planner.plan(status) {
                PlanDecision::Drain => {
                    drained = true;
                    break;
                }
                PlanDecision::Schedule(jobs) => {
                    tracing::info!(
                        event = "timesteps_scheduled",
                        from = jobs.first().map(|j| j.timestep).unwrap_or_default(),
                        to = planner.last_scheduled(),
                        "scheduling fetches"
                    );
                    for job in jobs {
                        scheduler.enqueue(job);
                    }
                }
                PlanDecision::Stale { current } => {
                    tracing::debug!(
                        event = "time_stale",
                        current = current,
                        last_scheduled = planner.last_scheduled(),
                        "source reports an older timestep"
                    );
                }
                PlanDecision::Idle => {}
            }

            if !self.pause(config.run_poll_interval).await {
                break;
            }
        }

        if !drained {
            scheduler.shutdown().await;
            metrics.runs_active.dec();
            tracing::info!(event = "run_cancelled", "stopped watching run");
            return Ok(());
        }

        self.set_phase(RunPhase::Draining);
        scheduler.join().await;
        scheduler.shutdown().await;
        metrics.runs_active.dec();
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        tracing::info!(event = "run_complete", "run is complete, generating movies");
        let requested = create_movies(&store, &run_folder, &config.movie_formats)
            .await
            .context("requesting movies")?;
        metrics.movies_requested_total.inc_by(requested as u64);
        metrics.runs_completed_total.inc();
        self.set_phase(RunPhase::Complete);
        Ok(())
    }
}
