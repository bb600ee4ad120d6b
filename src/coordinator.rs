//! Cache-then-fetch coordination.
//!
//! [`DownloadCoordinator`] owns the artifact store, the fetch plan and the
//! table of in-flight fetches. At most one fetch task exists per content id;
//! every caller interested in that id subscribes to the task's watch channel.
//! Synchronous callers wait for a bounded time and get
//! [`Obtained::StillProcessing`] when the window elapses; the fetch itself is
//! never cancelled by a caller giving up.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    artifact::{ArtifactStore, CachedArtifact, SweepReport},
    config::Settings,
    credentials::{CredentialPlanner, FetchStrategy},
    error::{CoordinatorError, CoordinatorResult},
    fetcher::{FetchRequest, MediaFetcher, YtDlpFetcher},
    security::ContentId,
    tasks::{TaskBoard, TaskRecord, TaskState},
};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Upper bound on fetches running at the same time across all ids.
    pub worker_pool_size: usize,
    /// How long a synchronous caller waits before `StillProcessing`.
    pub wait_timeout: Duration,
    pub max_retries: u32,
    /// Hard limit for a single fetcher invocation.
    pub attempt_timeout: Duration,
    pub retention: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            wait_timeout: Duration::from_secs(120),
            max_retries: 3,
            attempt_timeout: Duration::from_secs(900),
            retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Obtained {
    Ready(CachedArtifact),
    StillProcessing,
}

/// Result of one fetch attempt with one credential bundle.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Valid(CachedArtifact),
    /// The fetcher reported success but left nothing usable behind.
    InvalidOutput,
    InvocationError(String),
}

#[derive(Debug, Clone)]
enum FetchState {
    Queued,
    Running,
    Ready(CachedArtifact),
    Failed { attempts: usize },
}

impl FetchState {
    fn is_finished(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failed { .. })
    }
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: ArtifactStore,
    fetcher: Arc<dyn MediaFetcher>,
    planner: CredentialPlanner,
    settings: CoordinatorSettings,
    workers: Semaphore,
    inflight: Mutex<HashMap<ContentId, watch::Receiver<FetchState>>>,
    tasks: TaskBoard,
}

/// Removes the in-flight entry when the fetch task ends, however it ends.
/// A task that ends without a terminal record is marked failed.
struct InflightRelease {
    inner: Arc<CoordinatorInner>,
    id: ContentId,
}

impl Drop for InflightRelease {
    fn drop(&mut self) {
        let mut inflight = self.inner.inflight.lock();
        if self.inner.tasks.fail_unfinished(&self.id, "Fetch interrupted") {
            warn!(id = %self.id, "fetch task ended without a result");
        }
        inflight.remove(&self.id);
    }
}

impl DownloadCoordinator {
    pub fn new(
        store: ArtifactStore,
        fetcher: Arc<dyn MediaFetcher>,
        planner: CredentialPlanner,
        settings: CoordinatorSettings,
    ) -> Self {
        let workers = Semaphore::new(settings.worker_pool_size.max(1));
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                fetcher,
                planner,
                settings,
                workers,
                inflight: Mutex::new(HashMap::new()),
                tasks: TaskBoard::new(),
            }),
        }
    }

    /// Wires the production store, cookie planner and yt-dlp fetcher from
    /// resolved settings.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let store = ArtifactStore::new(&settings.download_dir, settings.min_file_size);
        store
            .prepare()
            .with_context(|| format!("creating {}", settings.download_dir.display()))?;
        let mut planner = CredentialPlanner::discover(
            &settings.cookies_path,
            settings.credential_order,
            settings.credential_seed,
        )?;
        if let Some(clients) = &settings.player_clients {
            planner = planner.with_player_clients(clients.clone());
        }
        info!(
            bundles = planner.bundles().len(),
            order = ?planner.order(),
            "credential plan ready"
        );
        let fetcher = Arc::new(YtDlpFetcher::new(&settings.ytdlp_bin));
        Ok(Self::new(store, fetcher, planner, settings.coordinator()))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    pub fn in_flight(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    /// Returns a valid cached artifact for `raw`, fetching it first when
    /// needed. Waits at most `wait_timeout` for a fetch to finish.
    pub async fn obtain(&self, raw: &str) -> CoordinatorResult<Obtained> {
        let id = ContentId::parse(raw)?;
        if let Some(artifact) = self.inner.store.find_valid(&id)? {
            debug!(id = %id, "cache hit");
            return Ok(Obtained::Ready(artifact));
        }

        let mut updates = self.join_or_spawn(&id);
        let waited = time::timeout(
            self.inner.settings.wait_timeout,
            updates.wait_for(FetchState::is_finished),
        )
        .await;
        let state = match waited {
            Err(_) => {
                debug!(id = %id, "wait window elapsed, fetch continues in background");
                return Ok(Obtained::StillProcessing);
            }
            Ok(Err(_)) => return Err(CoordinatorError::FetchInterrupted(id.to_string())),
            Ok(Ok(state)) => state.clone(),
        };
        self.settle(&id, state)
    }

    /// Starts a fetch if needed and returns immediately with the task
    /// record. A cache hit yields a finished record.
    pub fn enqueue(&self, raw: &str) -> CoordinatorResult<TaskRecord> {
        let id = ContentId::parse(raw)?;
        if let Some(artifact) = self.inner.store.find_valid(&id)? {
            return Ok(self.inner.tasks.mark_cached(&id, artifact.file_name()));
        }
        self.join_or_spawn(&id);
        Ok(self
            .inner
            .tasks
            .get(&id)
            .unwrap_or_else(|| TaskRecord::pending(&id)))
    }

    /// Current task record. A record that claims success is only returned
    /// while its artifact is still valid on disk.
    pub fn task(&self, raw: &str) -> CoordinatorResult<Option<TaskRecord>> {
        let id = ContentId::parse(raw)?;
        let cached = self.inner.store.find_valid(&id)?;
        match (self.inner.tasks.get(&id), cached) {
            (Some(record), Some(_)) => Ok(Some(record)),
            (Some(record), None) if record.state != TaskState::Succeeded => Ok(Some(record)),
            (_, Some(artifact)) => Ok(Some(TaskRecord::ready(&id, artifact.file_name()))),
            _ => Ok(None),
        }
    }

    /// Serve-only lookup; never starts a fetch.
    pub fn lookup(&self, raw: &str) -> CoordinatorResult<CachedArtifact> {
        let id = ContentId::parse(raw)?;
        self.inner
            .store
            .find_valid(&id)?
            .ok_or_else(|| CoordinatorError::ArtifactNotFound(id.to_string()))
    }

    /// One eviction pass over the store plus pruning of old task records.
    pub fn sweep(&self) -> SweepReport {
        let busy: HashSet<String> = self
            .inner
            .inflight
            .lock()
            .keys()
            .map(ToString::to_string)
            .collect();
        let retention = self.inner.settings.retention;
        let report = self
            .inner
            .store
            .sweep(SystemTime::now(), retention, |name| busy.contains(name));
        let pruned = self.inner.tasks.prune(retention);
        if report.removed() > 0 || report.errors > 0 || pruned > 0 {
            info!(
                expired = report.expired,
                undersized = report.undersized,
                stale_staging = report.stale_staging,
                errors = report.errors,
                pruned_tasks = pruned,
                "eviction sweep finished"
            );
        }
        report
    }

    /// Runs [`Self::sweep`] on the blocking pool every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let worker = coordinator.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || worker.sweep()).await {
                    warn!("eviction sweep crashed: {err}");
                }
            }
        })
    }

    fn settle(&self, id: &ContentId, state: FetchState) -> CoordinatorResult<Obtained> {
        match state {
            FetchState::Ready(artifact) if self.inner.store.is_valid(&artifact) => {
                Ok(Obtained::Ready(artifact))
            }
            // Evicted or replaced between the fetch finishing and this caller
            // waking up.
            FetchState::Ready(_) => self
                .inner
                .store
                .find_valid(id)?
                .map(Obtained::Ready)
                .ok_or_else(|| CoordinatorError::ArtifactNotFound(id.to_string())),
            FetchState::Failed { attempts } => Err(CoordinatorError::FetchExhausted {
                id: id.to_string(),
                attempts,
            }),
            FetchState::Queued | FetchState::Running => Ok(Obtained::StillProcessing),
        }
    }

    fn join_or_spawn(&self, id: &ContentId) -> watch::Receiver<FetchState> {
        let mut inflight = self.inner.inflight.lock();
        if let Some(updates) = inflight.get(id) {
            debug!(id = %id, "joining in-flight fetch");
            return updates.clone();
        }
        let (tx, rx) = watch::channel(FetchState::Queued);
        inflight.insert(id.clone(), rx.clone());
        self.inner.tasks.mark_pending(id);
        drop(inflight);

        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        tokio::spawn(async move {
            let _release = InflightRelease {
                inner: Arc::clone(&inner),
                id: id.clone(),
            };
            let state = run_fetch(&inner, &id, &tx).await;
            tx.send_replace(state);
        });
        rx
    }
}

async fn run_fetch(
    inner: &Arc<CoordinatorInner>,
    id: &ContentId,
    tx: &watch::Sender<FetchState>,
) -> FetchState {
    let Ok(_permit) = inner.workers.acquire().await else {
        inner.tasks.mark_failed(id, "Worker pool closed");
        return FetchState::Failed { attempts: 0 };
    };
    tx.send_replace(FetchState::Running);
    inner.tasks.mark_running(id);

    // Another fetch may have finished between the caller's cache check and
    // this task taking the lock.
    match inner.store.find_valid(id) {
        Ok(Some(artifact)) => {
            inner.tasks.mark_succeeded(id, artifact.file_name());
            return FetchState::Ready(artifact);
        }
        Ok(None) => {}
        Err(err) => warn!(id = %id, "cache re-check failed: {err}"),
    }

    let plan = inner.planner.plan();
    let total = plan.len();
    for (index, strategy) in plan.into_iter().enumerate() {
        let bundle = strategy.bundle.name.clone();
        inner.tasks.record_attempt(id, &bundle);
        match run_attempt(inner, id, strategy).await {
            AttemptOutcome::Valid(artifact) => {
                info!(
                    id = %id,
                    bundle = %bundle,
                    attempt = index + 1,
                    size = artifact.size,
                    "fetched {}",
                    artifact.file_name()
                );
                inner.tasks.mark_succeeded(id, artifact.file_name());
                return FetchState::Ready(artifact);
            }
            AttemptOutcome::InvalidOutput => {
                warn!(id = %id, bundle = %bundle, attempt = index + 1, "attempt left no valid artifact");
            }
            AttemptOutcome::InvocationError(err) => {
                warn!(id = %id, bundle = %bundle, attempt = index + 1, "attempt failed: {err}");
            }
        }
    }

    warn!(id = %id, attempts = total, "fetch exhausted");
    inner
        .tasks
        .mark_failed(id, &format!("All {total} attempts failed"));
    FetchState::Failed { attempts: total }
}

async fn run_attempt(
    inner: &Arc<CoordinatorInner>,
    id: &ContentId,
    strategy: FetchStrategy,
) -> AttemptOutcome {
    let worker = Arc::clone(inner);
    let id = id.clone();
    tokio::task::spawn_blocking(move || worker.attempt_blocking(&id, strategy))
        .await
        .unwrap_or_else(|err| AttemptOutcome::InvocationError(format!("fetch worker crashed: {err}")))
}

impl CoordinatorInner {
    fn attempt_blocking(&self, id: &ContentId, strategy: FetchStrategy) -> AttemptOutcome {
        let staging = match self.store.reset_staging(id) {
            Ok(dir) => dir,
            Err(err) => return AttemptOutcome::InvocationError(format!("preparing staging: {err}")),
        };
        let request = FetchRequest::new(
            id.clone(),
            &staging,
            strategy,
            self.settings.max_retries,
            self.settings.attempt_timeout,
        );
        match self.fetcher.fetch(&request) {
            Ok(()) => match self.store.promote(id) {
                Ok(Some(artifact)) => AttemptOutcome::Valid(artifact),
                Ok(None) => AttemptOutcome::InvalidOutput,
                Err(err) => AttemptOutcome::InvocationError(format!("promoting output: {err}")),
            },
            Err(err) => {
                self.store.discard_staging(id);
                AttemptOutcome::InvocationError(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialBundle, CredentialOrder, NO_CREDENTIALS};
    use crate::fetcher::FetchError;
    use std::{
        fs,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tempfile::tempdir;
    use tokio::task::JoinSet;

    const MIN_SIZE: u64 = 1024;

    #[derive(Clone, Copy)]
    enum Behavior {
        Valid,
        Tiny,
        Fail,
        /// Writes a full-size file, then reports failure.
        WriteThenFail,
        /// Reports success without writing anything.
        Silent,
    }

    type Script = Box<dyn Fn(&FetchRequest) -> Behavior + Send + Sync>;

    /// Test double that records every invocation as `(id, bundle)`.
    struct ScriptedFetcher {
        calls: Mutex<Vec<(String, String)>>,
        script: Script,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(delay: Duration, script: impl Fn(&FetchRequest) -> Behavior + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                script: Box::new(script),
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn always(behavior: Behavior) -> Arc<Self> {
            Self::new(Duration::ZERO, move |_| behavior)
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }

        fn bundles(&self) -> Vec<String> {
            self.calls().into_iter().map(|(_, bundle)| bundle).collect()
        }
    }

    impl MediaFetcher for ScriptedFetcher {
        fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
            self.calls.lock().push((
                request.content_id.to_string(),
                request.strategy.bundle.name.clone(),
            ));
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);

            match (self.script)(request) {
                Behavior::Valid => {
                    fs::write(request.output_path("m4a"), vec![7u8; 4096]).unwrap();
                    Ok(())
                }
                Behavior::Tiny => {
                    fs::write(request.output_path("m4a"), b"<html>error</html>").unwrap();
                    Ok(())
                }
                Behavior::Fail => Err(FetchError::Launch {
                    program: "fake-yt-dlp".into(),
                    source: std::io::Error::other("HTTP Error 403: Forbidden"),
                }),
                Behavior::WriteThenFail => {
                    fs::write(request.output_path("m4a"), vec![7u8; 4096]).unwrap();
                    Err(FetchError::Launch {
                        program: "fake-yt-dlp".into(),
                        source: std::io::Error::other("connection reset mid-transfer"),
                    })
                }
                Behavior::Silent => Ok(()),
            }
        }
    }

    fn settings(wait_timeout: Duration, worker_pool_size: usize) -> CoordinatorSettings {
        CoordinatorSettings {
            worker_pool_size,
            wait_timeout,
            max_retries: 1,
            attempt_timeout: Duration::from_secs(5),
            retention: Duration::from_secs(3600),
        }
    }

    fn coordinator(
        root: &Path,
        fetcher: Arc<ScriptedFetcher>,
        bundles: &[&str],
        settings: CoordinatorSettings,
    ) -> DownloadCoordinator {
        let store = ArtifactStore::new(root, MIN_SIZE);
        store.prepare().unwrap();
        let bundles = bundles
            .iter()
            .map(|name| CredentialBundle::cookie_file(root.join(format!("{name}.txt"))))
            .collect();
        let planner = CredentialPlanner::new(bundles, CredentialOrder::Fixed, Some(7));
        DownloadCoordinator::new(store, fetcher, planner, settings)
    }

    fn artifact_files(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root)
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_type().unwrap().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn expect_ready(obtained: Obtained) -> CachedArtifact {
        match obtained {
            Obtained::Ready(artifact) => artifact,
            Obtained::StillProcessing => panic!("expected a ready artifact"),
        }
    }

    #[tokio::test]
    async fn cache_hit_never_invokes_fetcher() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::always(Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher.clone(), &["main"], settings(Duration::from_secs(5), 2));
        fs::write(temp.path().join("dQw4w9WgXcQ.mp3"), vec![1u8; 2048]).unwrap();

        let artifact = expect_ready(coord.obtain("dQw4w9WgXcQ").await.unwrap());
        assert_eq!(artifact.path, temp.path().join("dQw4w9WgXcQ.mp3"));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_id_is_rejected_before_any_io() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::always(Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher.clone(), &[], settings(Duration::from_secs(5), 2));

        let err = coord.obtain("bad id").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidIdentifier(_)));
        assert!(matches!(
            coord.enqueue("../../../x").unwrap_err(),
            CoordinatorError::InvalidIdentifier(_)
        ));
        assert!(fetcher.calls().is_empty());
        assert_eq!(coord.in_flight(), 0);
    }

    #[tokio::test]
    async fn falls_back_through_bundles_until_anonymous_succeeds() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Duration::ZERO, |request| {
            if request.strategy.bundle.is_anonymous() {
                Behavior::Valid
            } else {
                Behavior::Fail
            }
        });
        let coord = coordinator(temp.path(), fetcher.clone(), &["first", "second"], settings(Duration::from_secs(5), 2));

        let artifact = expect_ready(coord.obtain("AAAAAAAAAAA").await.unwrap());

        assert_eq!(fetcher.bundles(), ["first", "second", NO_CREDENTIALS]);
        assert_eq!(artifact_files(temp.path()), ["AAAAAAAAAAA.m4a"]);
        assert_eq!(artifact.size, 4096);
        let task = coord.task("AAAAAAAAAAA").unwrap().expect("task record");
        assert_eq!(task.state.status_label(), "ready");
        assert_eq!(task.attempts, 3);
    }

    #[tokio::test]
    async fn stops_at_first_bundle_that_yields_a_valid_artifact() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Duration::ZERO, |request| {
            if request.strategy.bundle.name == "c" {
                Behavior::Valid
            } else {
                Behavior::Fail
            }
        });
        let coord = coordinator(temp.path(), fetcher.clone(), &["a", "b", "c", "d"], settings(Duration::from_secs(5), 2));

        expect_ready(coord.obtain("BBBBBBBBBBB").await.unwrap());
        assert_eq!(fetcher.bundles(), ["a", "b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_a_single_fetch() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Duration::from_millis(300), |_| Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher.clone(), &[], settings(Duration::from_secs(10), 4));

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let coord = coord.clone();
            set.spawn(async move { coord.obtain("CCCCCCCCCCC").await });
        }
        let mut paths = Vec::new();
        while let Some(joined) = set.join_next().await {
            paths.push(expect_ready(joined.unwrap().unwrap()).path);
        }

        assert_eq!(paths.len(), 8);
        assert!(paths.iter().all(|path| path == &paths[0]));
        assert_eq!(fetcher.calls().len(), 1);
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_bounds_parallel_fetches() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Duration::from_millis(150), |_| Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher.clone(), &[], settings(Duration::from_secs(10), 2));

        let mut set = JoinSet::new();
        for index in 0..6 {
            let coord = coord.clone();
            set.spawn(async move { coord.obtain(&format!("idnumber{index:03}")).await });
        }
        while let Some(joined) = set.join_next().await {
            expect_ready(joined.unwrap().unwrap());
        }

        assert_eq!(fetcher.calls().len(), 6);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn undersized_outputs_exhaust_and_release_the_lock() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::always(Behavior::Tiny);
        let coord = coordinator(temp.path(), fetcher.clone(), &["main"], settings(Duration::from_secs(5), 2));

        let err = coord.obtain("DDDDDDDDDDD").await.unwrap_err();
        match err {
            CoordinatorError::FetchExhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(artifact_files(temp.path()).is_empty());
        assert!(!temp.path().join(".staging").join("DDDDDDDDDDD").exists());

        let task = coord.task("DDDDDDDDDDD").unwrap().expect("failed task");
        assert_eq!(task.state.status_label(), "error");

        // The id is free again, so a later request retries from scratch.
        assert_eq!(coord.in_flight(), 0);
        assert!(coord.obtain("DDDDDDDDDDD").await.is_err());
        assert_eq!(fetcher.calls().len(), 4);
    }

    #[tokio::test]
    async fn failed_attempt_output_never_reaches_the_next_attempt() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Duration::ZERO, |request| {
            if request.strategy.bundle.is_anonymous() {
                Behavior::Silent
            } else {
                Behavior::WriteThenFail
            }
        });
        let coord = coordinator(temp.path(), fetcher.clone(), &["main"], settings(Duration::from_secs(5), 1));

        let err = coord.obtain("KKKKKKKKKKK").await.unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::FetchExhausted { attempts: 2, .. }
        ));
        assert_eq!(fetcher.bundles(), ["main", NO_CREDENTIALS]);
        assert!(artifact_files(temp.path()).is_empty());
        assert!(!temp.path().join(".staging").join("KKKKKKKKKKK").exists());
    }

    #[tokio::test]
    async fn release_fails_a_task_left_unfinished() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::always(Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher, &[], settings(Duration::from_secs(5), 1));
        let id = ContentId::parse("LLLLLLLLLLL").unwrap();
        let (_tx, rx) = watch::channel(FetchState::Running);
        coord.inner.inflight.lock().insert(id.clone(), rx);
        coord.inner.tasks.mark_running(&id);

        drop(InflightRelease {
            inner: Arc::clone(&coord.inner),
            id: id.clone(),
        });

        assert_eq!(coord.in_flight(), 0);
        let task = coord.task("LLLLLLLLLLL").unwrap().expect("failed task");
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.state.status_label(), "error");
        assert_eq!(coord.inner.tasks.prune(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn undersized_cache_entry_is_replaced_by_a_fresh_fetch() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::always(Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher.clone(), &[], settings(Duration::from_secs(5), 2));
        fs::write(temp.path().join("EEEEEEEEEEE.webm"), b"truncated").unwrap();

        let artifact = expect_ready(coord.obtain("EEEEEEEEEEE").await.unwrap());

        assert_eq!(artifact.extension(), Some("m4a"));
        assert!(!temp.path().join("EEEEEEEEEEE.webm").exists());
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_fetch_reports_still_processing_and_keeps_running() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Duration::from_millis(400), |_| Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher.clone(), &[], settings(Duration::from_millis(50), 2));

        assert_eq!(coord.obtain("FFFFFFFFFFF").await.unwrap(), Obtained::StillProcessing);
        let task = coord.task("FFFFFFFFFFF").unwrap().expect("running task");
        assert!(!task.state.is_finished());

        time::sleep(Duration::from_millis(700)).await;
        let artifact = expect_ready(coord.obtain("FFFFFFFFFFF").await.unwrap());
        assert!(artifact.path.exists());
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enqueue_reports_progress_then_ready() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Duration::from_millis(200), |_| Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher.clone(), &[], settings(Duration::from_secs(5), 2));

        assert!(matches!(
            coord.lookup("GGGGGGGGGGG").unwrap_err(),
            CoordinatorError::ArtifactNotFound(_)
        ));

        let first = coord.enqueue("GGGGGGGGGGG").unwrap();
        assert!(matches!(first.state, TaskState::Pending | TaskState::Running));
        let second = coord.enqueue("GGGGGGGGGGG").unwrap();
        assert!(!second.state.is_finished());

        time::sleep(Duration::from_millis(600)).await;
        let done = coord.task("GGGGGGGGGGG").unwrap().unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.file_name.as_deref(), Some("GGGGGGGGGGG.m4a"));
        assert!(coord.lookup("GGGGGGGGGGG").is_ok());
        assert_eq!(fetcher.calls().len(), 1);

        let cached = coord.enqueue("GGGGGGGGGGG").unwrap();
        assert_eq!(cached.state, TaskState::Succeeded);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn task_never_reports_ready_for_an_evicted_file() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::always(Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher, &[], settings(Duration::from_secs(5), 1));

        let artifact = expect_ready(coord.obtain("HHHHHHHHHHH").await.unwrap());
        fs::remove_file(&artifact.path).unwrap();

        assert!(coord.task("HHHHHHHHHHH").unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_through_the_coordinator() {
        let temp = tempdir().unwrap();
        let fetcher = ScriptedFetcher::always(Behavior::Valid);
        let coord = coordinator(temp.path(), fetcher, &[], settings(Duration::from_secs(5), 1));
        fs::write(temp.path().join("IIIIIIIIIII.m4a"), b"tiny").unwrap();
        fs::write(temp.path().join("JJJJJJJJJJJ.m4a"), vec![0u8; 2048]).unwrap();

        let report = coord.sweep();

        assert_eq!(report.undersized, 1);
        assert_eq!(artifact_files(temp.path()), ["JJJJJJJJJJJ.m4a"]);
    }
}
