#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use simwatch_core::upload_url::UploadUrl;
use simwatch_runtime::session::{run_watch, WatchContext};
use simwatch_runtime::source::{open_upload_source, SourceLayout};
use simwatch_runtime::types::WatchConfig;
use simwatch_store::http::{HttpStore, HttpStoreConfig};
use simwatch_store::StoreClient;

#[derive(Debug, Parser)]
#[command(name = "simwatch", about = "Ingest simulation output into the dashboard store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch an upload site and ingest every run it publishes.
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Store folder that receives the `shot/run` hierarchy.
    #[arg(long, env = "SIMWATCH_FOLDER_ID")]
    folder_id: String,

    /// Upload site root (`http://`, `https://` or `file://`).
    #[arg(long, env = "SIMWATCH_UPLOAD_URL")]
    upload_url: String,

    /// Store REST root, e.g. https://host/api/v1
    #[arg(long, env = "SIMWATCH_API_URL")]
    api_url: String,

    #[arg(long, env = "SIMWATCH_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Seconds between polls of `shots/index.json`.
    #[arg(long, env = "SIMWATCH_SHOT_POLL_INTERVAL", default_value_t = 30)]
    shot_poll_interval: u64,

    /// Seconds between polls of each run's `time.json`.
    #[arg(long, env = "SIMWATCH_RUN_POLL_INTERVAL", default_value_t = 30)]
    run_poll_interval: u64,

    /// Movie rendering service root; defaults to `--api-url`.
    #[arg(long, env = "SIMWATCH_MOVIE_API_URL")]
    movie_api_url: Option<String>,

    #[arg(long, env = "SIMWATCH_MAX_CONCURRENT_REQUESTS", default_value_t = 5)]
    max_concurrent_requests: usize,

    /// Emit a metrics log line this often; 0 disables.
    #[arg(long, env = "SIMWATCH_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 0)]
    metrics_snapshot_interval_ms: u64,
}

impl WatchArgs {
    fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            shot_poll_interval: Duration::from_secs(self.shot_poll_interval),
            run_poll_interval: Duration::from_secs(self.run_poll_interval),
            metrics_snapshot_interval: (self.metrics_snapshot_interval_ms > 0)
                .then(|| Duration::from_millis(self.metrics_snapshot_interval_ms)),
            ..WatchConfig::default()
        }
    }

    fn store_config(&self) -> HttpStoreConfig {
        let mut config = HttpStoreConfig::new(self.api_url.trim_end_matches('/'));
        config.movie_api_url = self
            .movie_api_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string());
        config.max_concurrent_requests = self.max_concurrent_requests.max(1);
        config
    }
}

async fn watch(args: WatchArgs) -> Result<()> {
    let upload_url = UploadUrl::parse(&args.upload_url)
        .with_context(|| format!("invalid --upload-url {}", args.upload_url))?;
    let config = args.watch_config();

    let backend = HttpStore::connect(args.store_config(), &args.api_key)
        .await
        .context("authenticating with the store")?;
    let store = Arc::new(StoreClient::new(Arc::new(backend)));
    let root = store
        .get_folder(&args.folder_id)
        .await
        .with_context(|| format!("top-level folder {} is not accessible", args.folder_id))?;
    info!(folder = %root.name, "ingesting into folder");

    let source = open_upload_source(&upload_url, config.source_retry)?;
    let ctx = Arc::new(WatchContext::new(
        source,
        SourceLayout::new(&upload_url),
        store,
        config,
    ));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        on_signal.cancel();
    });

    run_watch(ctx, root.id, cancel).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    simwatch_observe::logging::init_tracing();

    match Cli::parse().command {
        Command::Watch(args) => watch(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> WatchArgs {
        let mut argv = vec!["simwatch", "watch"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Watch(args) => args,
        }
    }

    #[test]
    fn watch_flags_map_to_configs() {
        let args = parse(&[
            "--folder-id",
            "f0",
            "--upload-url",
            "https://up.example.org/site/",
            "--api-url",
            "https://store.example.org/api/v1/",
            "--api-key",
            "k",
            "--shot-poll-interval",
            "5",
            "--run-poll-interval",
            "2",
            "--metrics-snapshot-interval-ms",
            "1500",
        ]);
        let watch = args.watch_config();
        assert_eq!(watch.shot_poll_interval, Duration::from_secs(5));
        assert_eq!(watch.run_poll_interval, Duration::from_secs(2));
        assert_eq!(
            watch.metrics_snapshot_interval,
            Some(Duration::from_millis(1500))
        );

        let store = args.store_config();
        assert_eq!(store.api_url, "https://store.example.org/api/v1");
        assert_eq!(store.movie_api_url, None);
        assert_eq!(store.max_concurrent_requests, 5);
    }

    #[test]
    fn metrics_snapshots_are_off_by_default() {
        let args = parse(&[
            "--folder-id",
            "f0",
            "--upload-url",
            "file:///data/upload",
            "--api-url",
            "http://localhost:8080/api/v1",
            "--api-key",
            "k",
            "--movie-api-url",
            "http://render:9000/",
        ]);
        assert_eq!(args.watch_config().metrics_snapshot_interval, None);
        assert_eq!(
            args.store_config().movie_api_url.as_deref(),
            Some("http://render:9000")
        );
    }

    #[test]
    fn required_flags_are_enforced() {
        assert!(Cli::try_parse_from(["simwatch", "watch", "--folder-id", "f0"]).is_err());
    }
}
