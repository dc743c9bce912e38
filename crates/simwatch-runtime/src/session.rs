use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use simwatch_store::StoreClient;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::container::{ContainerInspector, JsonStatsInspector};
use crate::index_watcher::IndexWatcher;
use crate::source::{SourceLayout, UploadSource};
use crate::types::{WatchConfig, WatchMetrics};

/// Everything one watch session shares between its tasks.
pub struct WatchContext {
    pub source: Arc<dyn UploadSource>,
    pub layout: SourceLayout,
    pub store: Arc<StoreClient>,
    pub inspector: Arc<dyn ContainerInspector>,
    pub config: WatchConfig,
    pub metrics: Arc<WatchMetrics>,
}

impl WatchContext {
    pub fn new(
        source: Arc<dyn UploadSource>,
        layout: SourceLayout,
        store: Arc<StoreClient>,
        config: WatchConfig,
    ) -> Self {
        Self {
            source,
            layout,
            store,
            inspector: Arc::new(JsonStatsInspector),
            config,
            metrics: Arc::new(WatchMetrics::default()),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ContainerInspector>) -> Self {
        self.inspector = inspector;
        self
    }
}

fn spawn_metrics_task(
    metrics: Arc<WatchMetrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => metrics.emit_snapshot(),
            }
        }
    })
}

/// Watches the upload site until `cancel` fires, ingesting into the folder
/// `root_folder_id`.
pub async fn run_watch(
    ctx: Arc<WatchContext>,
    root_folder_id: String,
    cancel: CancellationToken,
) -> Result<()> {
    let span = info_span!(
        "watch",
        upload_url = %ctx.layout.base(),
        folder_id = %root_folder_id
    );
    async move {
        tracing::info!(event = "watch_started", "watching upload site");
        let metrics_task = ctx
            .config
            .metrics_snapshot_interval
            .map(|every| spawn_metrics_task(ctx.metrics.clone(), every, cancel.child_token()));

        let res = async {
            let watcher = IndexWatcher::new(ctx.clone(), root_folder_id, cancel.clone())
                .seeded()
                .await?;
            watcher.run().await
        }
        .await;

        if let Some(task) = metrics_task {
            task.abort();
        }
        ctx.metrics.emit_snapshot();
        tracing::info!(event = "watch_stopped", "watch session ended");
        res
    }
    .instrument(span)
    .await
}
