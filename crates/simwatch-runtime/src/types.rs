use std::time::Duration;

use simwatch_core::retry::RetryPolicy;
use simwatch_observe::metrics::{Counter, DurationAgg, Gauge};

pub const DEFAULT_MOVIE_FORMATS: [&str; 2] = ["mp4", "mpg"];

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub shot_poll_interval: Duration,
    pub run_poll_interval: Duration,
    /// Wait before re-polling a run whose `time.json` is not published yet.
    pub not_ready_interval: Duration,
    pub movie_formats: Vec<String>,
    /// Periodic metrics log line; `None` disables it.
    pub metrics_snapshot_interval: Option<Duration>,
    pub source_retry: RetryPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            shot_poll_interval: Duration::from_secs(30),
            run_poll_interval: Duration::from_secs(30),
            not_ready_interval: Duration::from_secs(1),
            movie_formats: DEFAULT_MOVIE_FORMATS.iter().map(|s| s.to_string()).collect(),
            metrics_snapshot_interval: None,
            source_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WatchMetrics {
    pub index_polls_total: Counter,
    pub runs_discovered_total: Counter,
    pub runs_active: Gauge,
    pub runs_completed_total: Counter,
    pub timesteps_fetched_total: Counter,
    pub timesteps_skipped_total: Counter,
    pub timesteps_failed_total: Counter,
    pub files_uploaded_total: Counter,
    pub files_skipped_existing_total: Counter,
    pub bytes_uploaded_total: Counter,
    pub movies_requested_total: Counter,
    pub timestep_duration: DurationAgg,
}

impl WatchMetrics {
    pub fn emit_snapshot(&self) {
        let fetch = self.timestep_duration.snapshot();
        tracing::info!(
            target: "simwatch_metrics",
            index_polls_total = self.index_polls_total.get(),
            runs_discovered_total = self.runs_discovered_total.get(),
            runs_active = self.runs_active.get(),
            runs_completed_total = self.runs_completed_total.get(),
            timesteps_fetched_total = self.timesteps_fetched_total.get(),
            timesteps_skipped_total = self.timesteps_skipped_total.get(),
            timesteps_failed_total = self.timesteps_failed_total.get(),
            files_uploaded_total = self.files_uploaded_total.get(),
            files_skipped_existing_total = self.files_skipped_existing_total.get(),
            bytes_uploaded_total = self.bytes_uploaded_total.get(),
            movies_requested_total = self.movies_requested_total.get(),
            timestep_mean_ms = fetch.mean.as_millis() as u64,
            timestep_worst_ms = fetch.worst.as_millis() as u64,
            "metrics"
        );
    }
}
