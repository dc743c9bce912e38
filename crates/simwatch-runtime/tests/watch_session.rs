use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use simwatch_core::types::{
    current_timestep, highest_timestep, meta_keys, Metadata, RunKey, ShotIndexEntry,
};
use simwatch_core::upload_url::UploadUrl;
use simwatch_runtime::archive::{pack, ArchiveMember, MemberKind};
use simwatch_runtime::container::{ContainerInspector, ContainerSummary};
use simwatch_runtime::fetch::{FetchOutcome, RunFetcher, SkipReason};
use simwatch_runtime::index_watcher::{IndexPoll, IndexWatcher};
use simwatch_runtime::run_watcher::{RunPhase, RunWatcher};
use simwatch_runtime::scheduler::FetchJob;
use simwatch_runtime::session::{run_watch, WatchContext};
use simwatch_runtime::source::{FsUploadSource, SourceLayout};
use simwatch_runtime::types::WatchConfig;
use simwatch_store::memory::MemoryStore;
use simwatch_store::{MetadataLock, ResourceType, StoreClient};

struct Site {
    dir: tempfile::TempDir,
}

impl Site {
    fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    fn url(&self) -> Result<UploadUrl> {
        Ok(UploadUrl::parse(&format!("file://{}", self.dir.path().display()))?)
    }

    fn write(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn write_json(&self, rel: &str, value: Value) -> Result<()> {
        self.write(rel, &serde_json::to_vec(&value)?)
    }

    fn set_time(&self, run: &str, current: u64, complete: bool) -> Result<()> {
        self.write_json(
            &format!("shots/{run}/time.json"),
            json!({"current": current, "complete": complete}),
        )
    }

    /// Publishes one timestep holding a `fields.bp` container with a density
    /// variable whose colour quantity spans `[lo, hi]`.
    fn publish_timestep(&self, run: &str, timestep: u64, lo: f64, hi: f64) -> Result<()> {
        self.write_json(
            &format!("shots/{run}/{timestep}/variables.json"),
            json!([{
                "attribute_name": "density",
                "group_name": "fields",
                "file_name": "home/sim/fields.bp",
                "time": timestep as f64 * 0.5,
            }]),
        )?;
        let stats = json!({
            "attributes": {"density": {"type": "mesh-colormap", "color": "rho"}},
            "variables": {"rho": {"min": lo, "max": hi}},
        });
        let members = vec![
            dir_member("fields.bp"),
            file_member("fields.bp/data.0", format!("step {timestep}").as_bytes()),
            file_member("fields.bp/stats.json", &serde_json::to_vec(&stats)?),
        ];
        self.write(
            &format!("shots/{run}/{timestep}/images.tar.gz"),
            &pack(&members)?,
        )
    }
}

fn dir_member(path: &str) -> ArchiveMember {
    ArchiveMember {
        path: path.to_string(),
        kind: MemberKind::Dir,
        mode: 0o755,
        data: Vec::new(),
    }
}

fn file_member(path: &str, data: &[u8]) -> ArchiveMember {
    ArchiveMember {
        path: path.to_string(),
        kind: MemberKind::File,
        mode: 0o644,
        data: data.to_vec(),
    }
}

fn fast_config() -> WatchConfig {
    WatchConfig {
        shot_poll_interval: Duration::from_millis(20),
        run_poll_interval: Duration::from_millis(10),
        not_ready_interval: Duration::from_millis(10),
        ..WatchConfig::default()
    }
}

struct Harness {
    mem: Arc<MemoryStore>,
    store: Arc<StoreClient>,
    root: String,
    ctx: Arc<WatchContext>,
}

fn harness(site: &Site) -> Result<Harness> {
    let mem = Arc::new(MemoryStore::new());
    let root = mem.create_root_folder("dashboard");
    let store = Arc::new(StoreClient::new(mem.clone()));
    let ctx = Arc::new(WatchContext::new(
        Arc::new(FsUploadSource::new()),
        SourceLayout::new(&site.url()?),
        store.clone(),
        fast_config(),
    ));
    Ok(Harness {
        mem,
        store,
        root,
        ctx,
    })
}

fn entry(shot: &str, run: &str, user: &str, machine: &str) -> ShotIndexEntry {
    ShotIndexEntry {
        shot_name: shot.to_string(),
        run_name: run.to_string(),
        username: Some(user.to_string()),
        machine_name: Some(machine.to_string()),
        date: None,
    }
}

impl Harness {
    fn run_watcher(&self, shot: &str, run: &str) -> RunWatcher {
        RunWatcher::new(
            self.ctx.clone(),
            entry(shot, run, "alice", "summit"),
            self.root.clone(),
            CancellationToken::new(),
        )
    }

    async fn folder_meta(&self, path: &[&str]) -> Result<Metadata> {
        let folder = self
            .mem
            .find_folder(&self.root, path)
            .ok_or_else(|| anyhow::anyhow!("folder {path:?} missing"))?;
        Ok(self
            .store
            .get_metadata(ResourceType::Folder, &folder.id)
            .await?)
    }

    async fn item_meta(&self, path: &[&str], item: &str) -> Result<Metadata> {
        let folder = self
            .mem
            .find_folder(&self.root, path)
            .ok_or_else(|| anyhow::anyhow!("folder {path:?} missing"))?;
        let item = self
            .mem
            .find_item(&folder.id, item)
            .ok_or_else(|| anyhow::anyhow!("item {item} missing"))?;
        Ok(self.store.get_metadata(ResourceType::Item, &item.id).await?)
    }

    fn timestep_files(&self, shot: &str, run: &str, label: &str) -> Vec<String> {
        self.mem
            .find_folder(&self.root, &[shot, run, "timesteps"])
            .and_then(|f| self.mem.find_item(&f.id, label))
            .map(|item| self.mem.file_names(&item.id))
            .unwrap_or_default()
    }

    async fn progress(&self, shot: &str, run: &str) -> Option<u64> {
        let meta = self.folder_meta(&[shot, run]).await.ok()?;
        current_timestep(&meta)
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("timed out waiting for {what}")
}

#[tokio::test]
async fn completed_run_is_ingested_and_gets_movies() -> Result<()> {
    let site = Site::new()?;
    site.publish_timestep("s1/r1", 1, 0.0, 2.0)?;
    site.publish_timestep("s1/r1", 2, -1.0, 1.5)?;
    site.set_time("s1/r1", 2, true)?;
    let h = harness(&site)?;

    let watcher = h.run_watcher("s1", "r1");
    let phase = watcher.subscribe();
    tokio::time::timeout(Duration::from_secs(10), watcher.run()).await??;
    assert_eq!(*phase.borrow(), RunPhase::Complete);

    let run_meta = h.folder_meta(&["s1", "r1"]).await?;
    assert_eq!(current_timestep(&run_meta), Some(2));
    assert_eq!(run_meta[meta_keys::USERNAME], json!("alice"));
    assert_eq!(run_meta[meta_keys::MACHINE], json!("summit"));

    assert_eq!(h.timestep_files("s1", "r1", "0001"), vec!["fields.bp.tgz"]);
    assert_eq!(h.timestep_files("s1", "r1", "0002"), vec!["fields.bp.tgz"]);

    let density = h.item_meta(&["s1", "r1", "fields"], "density").await?;
    assert_eq!(density[meta_keys::TIMESTEPS], json!([1, 2]));
    assert_eq!(density[meta_keys::TIME], json!([0.5, 1.0]));
    assert_eq!(density[meta_keys::COLOR_RANGE], json!([-1.0, 2.0]));
    assert!(density.get(meta_keys::X_RANGE).is_none());
    let run_folder = h
        .mem
        .find_folder(&h.root, &["s1", "r1"])
        .ok_or_else(|| anyhow::anyhow!("run folder missing"))?;
    assert_eq!(density[meta_keys::RUN_FOLDER_ID], json!(run_folder.id));

    let variable = h
        .mem
        .find_folder(&h.root, &["s1", "r1", "fields"])
        .and_then(|f| h.mem.find_item(&f.id, "density"))
        .ok_or_else(|| anyhow::anyhow!("density item missing"))?;
    let movie_item = h
        .mem
        .find_folder(&h.root, &["s1", "r1", "movies", "fields"])
        .and_then(|f| h.mem.find_item(&f.id, "density"))
        .ok_or_else(|| anyhow::anyhow!("movie item missing"))?;
    let movie = h
        .item_meta(&["s1", "r1", "movies", "fields"], "density")
        .await?;
    assert_eq!(movie[meta_keys::ITEM_ID], json!(variable.id));
    assert_eq!(density[meta_keys::MOVIE_ITEM_ID], json!(movie_item.id));

    let formats: Vec<String> = h.mem.movie_requests().into_iter().map(|(_, f)| f).collect();
    assert_eq!(formats, vec!["mp4", "mpg"]);
    assert_eq!(h.ctx.metrics.timesteps_fetched_total.get(), 2);
    assert_eq!(h.ctx.metrics.runs_completed_total.get(), 1);
    assert_eq!(h.ctx.metrics.runs_active.get(), 0);
    Ok(())
}

#[tokio::test]
async fn completion_after_last_timestep_fetches_it_once() -> Result<()> {
    let site = Site::new()?;
    site.publish_timestep("s1/r1", 1, 0.0, 1.0)?;
    site.set_time("s1/r1", 1, false)?;
    let h = harness(&site)?;

    let watcher = h.run_watcher("s1", "r1");
    let phase = watcher.subscribe();
    let task = tokio::spawn(watcher.run());

    let hr = &h;
    eventually("timestep 1 progress", move || async move {
        hr.progress("s1", "r1").await == Some(1)
    })
    .await?;
    assert_eq!(*phase.borrow(), RunPhase::Active);

    site.set_time("s1/r1", 1, true)?;
    tokio::time::timeout(Duration::from_secs(10), task).await???;

    assert_eq!(*phase.borrow(), RunPhase::Complete);
    assert_eq!(h.mem.upload_calls(), 1);
    assert_eq!(h.ctx.metrics.timesteps_fetched_total.get(), 1);
    Ok(())
}

#[tokio::test]
async fn manifest_without_time_is_skipped_but_progress_advances() -> Result<()> {
    let site = Site::new()?;
    site.write_json(
        "shots/s1/r1/1/variables.json",
        json!([{"attribute_name": "density", "group_name": "fields", "file_name": "a/b/fields.bp"}]),
    )?;
    site.set_time("s1/r1", 1, true)?;
    let h = harness(&site)?;

    tokio::time::timeout(Duration::from_secs(10), h.run_watcher("s1", "r1").run()).await??;

    assert_eq!(h.progress("s1", "r1").await, Some(1));
    assert_eq!(h.mem.upload_calls(), 0);
    assert!(h.mem.find_folder(&h.root, &["s1", "r1", "fields"]).is_none());
    assert_eq!(h.ctx.metrics.timesteps_skipped_total.get(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_upload_holds_progress_until_a_later_session_recovers() -> Result<()> {
    let site = Site::new()?;
    site.publish_timestep("s1/r1", 1, 0.0, 1.0)?;
    site.publish_timestep("s1/r1", 2, 0.0, 1.0)?;
    site.set_time("s1/r1", 2, true)?;
    let h = harness(&site)?;
    h.mem.fail_uploads_to("0001");

    tokio::time::timeout(Duration::from_secs(10), h.run_watcher("s1", "r1").run()).await??;
    assert_eq!(h.progress("s1", "r1").await, None);
    assert_eq!(h.ctx.metrics.timesteps_failed_total.get(), 1);
    assert_eq!(h.timestep_files("s1", "r1", "0002"), vec!["fields.bp.tgz"]);
    // the failed attempt at 0001 plus 0002
    assert_eq!(h.mem.upload_calls(), 2);
    let run_meta = h.folder_meta(&["s1", "r1"]).await?;
    assert_eq!(highest_timestep(&run_meta), Some(2));

    h.mem.clear_upload_failures();
    tokio::time::timeout(Duration::from_secs(10), h.run_watcher("s1", "r1").run()).await??;
    assert_eq!(h.progress("s1", "r1").await, Some(2));
    assert_eq!(h.timestep_files("s1", "r1", "0001"), vec!["fields.bp.tgz"]);
    assert_eq!(h.timestep_files("s1", "r1", "0002"), vec!["fields.bp.tgz"]);
    assert_eq!(h.mem.upload_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn resumed_session_does_not_reupload_past_a_failure() -> Result<()> {
    let site = Site::new()?;
    for t in 1..=3 {
        site.publish_timestep("s1/r1", t, 0.0, 1.0)?;
    }
    site.set_time("s1/r1", 3, true)?;
    let h = harness(&site)?;
    h.mem.fail_uploads_to("0001");

    tokio::time::timeout(Duration::from_secs(10), h.run_watcher("s1", "r1").run()).await??;
    let first_session = h.mem.upload_calls();
    assert_eq!(first_session, 3);
    assert_eq!(h.progress("s1", "r1").await, None);

    h.mem.clear_upload_failures();
    tokio::time::timeout(Duration::from_secs(10), h.run_watcher("s1", "r1").run()).await??;
    assert_eq!(h.mem.upload_calls() - first_session, 1);
    assert_eq!(h.progress("s1", "r1").await, Some(3));
    for label in ["0001", "0002", "0003"] {
        assert_eq!(h.timestep_files("s1", "r1", label), vec!["fields.bp.tgz"]);
    }
    assert_eq!(h.ctx.metrics.files_skipped_existing_total.get(), 2);
    Ok(())
}

/// Reports a fixed x range for every container, whatever is in it.
struct FixedInspector {
    calls: AtomicUsize,
}

impl ContainerInspector for FixedInspector {
    fn inspect(&self, container_dir: &Path) -> Result<Option<ContainerSummary>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(container_dir.join("data.0").is_file());
        Ok(Some(serde_json::from_value(json!({
            "attributes": {"density": {"type": "line", "x": "r", "y": "ne"}},
            "variables": {"r": {"min": -3.0, "max": 4.0}},
        }))?))
    }
}

#[tokio::test]
async fn custom_inspector_drives_range_metadata() -> Result<()> {
    let site = Site::new()?;
    site.publish_timestep("s1/r1", 1, 0.0, 1.0)?;
    site.set_time("s1/r1", 1, true)?;
    let mut h = harness(&site)?;
    let inspector = Arc::new(FixedInspector {
        calls: AtomicUsize::new(0),
    });
    let ctx = WatchContext::new(
        Arc::new(FsUploadSource::new()),
        SourceLayout::new(&site.url()?),
        h.store.clone(),
        fast_config(),
    )
    .with_inspector(inspector.clone());
    h.ctx = Arc::new(ctx);

    tokio::time::timeout(Duration::from_secs(10), h.run_watcher("s1", "r1").run()).await??;

    assert_eq!(inspector.calls.load(Ordering::SeqCst), 1);
    let density = h.item_meta(&["s1", "r1", "fields"], "density").await?;
    assert_eq!(density[meta_keys::X_RANGE], json!([-3.0, 4.0]));
    // stats.json in the archive is ignored
    assert!(density.get(meta_keys::COLOR_RANGE).is_none());
    // y names a quantity the container lacks
    assert!(density.get(meta_keys::Y_RANGE).is_none());
    Ok(())
}

#[tokio::test]
async fn existence_check_makes_refetch_idempotent() -> Result<()> {
    let site = Site::new()?;
    site.publish_timestep("s1/r1", 3, 0.0, 1.0)?;
    let h = harness(&site)?;
    let run_folder = h.store.ensure_folders(&h.root, &["s1", "r1"]).await?;
    let fetcher = RunFetcher::new(
        h.ctx.clone(),
        RunKey::new("s1", "r1"),
        h.root.clone(),
        run_folder.id,
        MetadataLock::new("progress:s1/r1"),
    );

    let first = fetcher.fetch_timestep(FetchJob::new(3, true)).await?;
    assert_eq!(
        first,
        FetchOutcome::Uploaded {
            files: 1,
            skipped_existing: 0
        }
    );
    let again = fetcher.fetch_timestep(FetchJob::new(3, true)).await?;
    assert_eq!(
        again,
        FetchOutcome::Uploaded {
            files: 0,
            skipped_existing: 1
        }
    );
    assert_eq!(h.mem.upload_calls(), 1);

    let density = h.item_meta(&["s1", "r1", "fields"], "density").await?;
    assert_eq!(density[meta_keys::TIMESTEPS], json!([3]));

    let missing = fetcher.fetch_timestep(FetchJob::new(4, false)).await?;
    assert_eq!(missing, FetchOutcome::Skipped(SkipReason::MissingManifest));
    Ok(())
}

#[tokio::test]
async fn index_watcher_tracks_runs_users_and_machines() -> Result<()> {
    let site = Site::new()?;
    let h = harness(&site)?;
    let mut seed = Metadata::new();
    seed.insert(meta_keys::USERS.to_string(), json!(["carol"]));
    h.store
        .set_metadata(ResourceType::Folder, &h.root, &seed, None)
        .await?;

    let cancel = CancellationToken::new();
    let mut watcher = IndexWatcher::new(h.ctx.clone(), h.root.clone(), cancel.clone())
        .seeded()
        .await?;
    assert_eq!(watcher.poll_once().await?, IndexPoll::NotReady);

    site.write_json(
        "shots/index.json",
        json!([
            entry("s1", "r1", "bob", "summit"),
            entry("s1", "r2", "alice", "frontier"),
        ]),
    )?;
    assert_eq!(watcher.poll_once().await?, IndexPoll::Polled { new_runs: 2 });
    assert_eq!(watcher.poll_once().await?, IndexPoll::Polled { new_runs: 0 });
    assert_eq!(
        watcher.watched(),
        vec![RunKey::new("s1", "r1"), RunKey::new("s1", "r2")]
    );

    let root_meta = h.store.get_metadata(ResourceType::Folder, &h.root).await?;
    assert_eq!(root_meta[meta_keys::USERS], json!(["alice", "bob", "carol"]));
    assert_eq!(root_meta[meta_keys::MACHINES], json!(["frontier", "summit"]));
    assert_eq!(h.ctx.metrics.runs_discovered_total.get(), 2);

    tokio::time::timeout(Duration::from_secs(10), watcher.shutdown()).await?;
    assert!(cancel.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn watch_session_ingests_discovered_runs_until_cancelled() -> Result<()> {
    let site = Site::new()?;
    site.write_json("shots/index.json", json!([entry("s1", "r1", "bob", "summit")]))?;
    site.publish_timestep("s1/r1", 1, 0.0, 1.0)?;
    site.set_time("s1/r1", 1, true)?;
    let h = harness(&site)?;

    let cancel = CancellationToken::new();
    let session = tokio::spawn(run_watch(h.ctx.clone(), h.root.clone(), cancel.clone()));

    let mem = h.mem.clone();
    eventually("movies for s1/r1", move || {
        let requested = mem.movie_requests().len();
        async move { requested == 2 }
    })
    .await?;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), session).await???;

    assert_eq!(h.progress("s1", "r1").await, Some(1));
    assert_eq!(h.ctx.metrics.runs_completed_total.get(), 1);
    Ok(())
}

#[tokio::test]
async fn cancelled_run_stops_without_movies() -> Result<()> {
    let site = Site::new()?;
    let h = harness(&site)?;
    let cancel = CancellationToken::new();
    let watcher = RunWatcher::new(
        h.ctx.clone(),
        entry("s9", "r9", "dana", "summit"),
        h.root.clone(),
        cancel.clone(),
    );
    let phase = watcher.subscribe();
    let task = tokio::spawn(watcher.run());

    let mut active = phase.clone();
    tokio::time::timeout(
        Duration::from_secs(10),
        active.wait_for(|p| *p == RunPhase::Active),
    )
    .await??;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(10), task).await???;

    assert_eq!(*phase.borrow(), RunPhase::Active);
    assert!(h.mem.movie_requests().is_empty());
    assert!(h.mem.find_folder(&h.root, &["s9", "r9"]).is_some());
    Ok(())
}
