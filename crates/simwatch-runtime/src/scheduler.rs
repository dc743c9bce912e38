use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchJob {
    pub timestep: u64,
    /// Skip files that already exist in the store (a previous attempt may
    /// have uploaded part of this timestep).
    pub check_exists: bool,
}

impl FetchJob {
    pub fn new(timestep: u64, check_exists: bool) -> Self {
        Self {
            timestep,
            check_exists,
        }
    }
}

#[async_trait]
pub trait FetchExecutor: Send + Sync + 'static {
    async fn execute(&self, job: FetchJob) -> Result<()>;
}

struct Shared {
    // timestep -> check_exists
    pending: Mutex<BTreeMap<u64, bool>>,
    wake: Notify,
    // pending + in flight
    outstanding: watch::Sender<usize>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, bool>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop_lowest(&self) -> Option<FetchJob> {
        self.pending()
            .pop_first()
            .map(|(timestep, check_exists)| FetchJob::new(timestep, check_exists))
    }
}

/// Runs fetch jobs for one run, one at a time, lowest timestep first.
pub struct FetchScheduler {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl FetchScheduler {
    /// Spawns the worker. It stops when `cancel` fires.
    pub fn spawn(executor: Arc<dyn FetchExecutor>, cancel: CancellationToken) -> Self {
        let (outstanding, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            pending: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            outstanding,
        });
        let worker = tokio::spawn(
            worker_loop(shared.clone(), executor, cancel.clone()).in_current_span(),
        );
        Self {
            shared,
            cancel,
            worker,
        }
    }

    /// Queues `job`. A timestep that is already pending is merged; the merged
    /// job checks existence if either request asked for it.
    pub fn enqueue(&self, job: FetchJob) {
        let inserted = {
            let mut pending = self.shared.pending();
            match pending.get_mut(&job.timestep) {
                Some(check) => {
                    *check |= job.check_exists;
                    false
                }
                None => {
                    pending.insert(job.timestep, job.check_exists);
                    true
                }
            }
        };
        if inserted {
            self.shared.outstanding.send_modify(|n| *n += 1);
            self.shared.wake.notify_one();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    /// Jobs queued or running.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Waits until nothing is pending or in flight, or the scheduler is cancelled.
    pub async fn join(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        tokio::select! {
            _ = rx.wait_for(|n| *n == 0) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Cancels the worker and waits for it to exit. Pending jobs are dropped.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.worker.await {
            if err.is_panic() {
                tracing::error!(error = %err, "fetch worker panicked");
            }
        }
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    executor: Arc<dyn FetchExecutor>,
    cancel: CancellationToken,
) {
    loop {
        let Some(job) = shared.pop_lowest() else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shared.wake.notified() => {}
            }
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = executor.execute(job) => {
                if let Err(err) = res {
                    tracing::warn!(
                        event = "fetch_failed",
                        timestep = job.timestep,
                        error = %format!("{err:#}"),
                        "fetch job failed"
                    );
                }
            }
        }
        shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
    tracing::debug!(event = "fetch_worker_stopped", "fetch worker stopped");
}
