//! Worker process supervision.
//!
//! The supervisor owns the map of live workers. Everything else asks it to
//! launch, tear down or reconcile; nobody touches the map directly.

pub mod log_buffer;
pub mod process;

use anyhow::Context;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::events::EventBus;
use crate::paths::{Paths, RESERVED_DATA_DIRS};
use crate::registry::{BridgeKind, Registry};
use crate::rpc::{Peer, Router, WorkerEvent, DEFAULT_TIMEOUT};
use crate::settings::HubSettings;

pub use log_buffer::LogBuffer;
pub use process::{LaunchSpec, WorkerFlags, WorkerSpec};

/// Time a worker gets between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Shortest pause between two relaunch attempts that failed to spawn.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch: LaunchSpec,
    pub request_timeout: Duration,
    /// Pause before relaunching a crashed worker. Zero relaunches at once.
    pub restart_delay: Duration,
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            request_timeout: DEFAULT_TIMEOUT,
            restart_delay: Duration::ZERO,
            stop_grace: STOP_GRACE,
        }
    }

    pub fn from_settings(launch: LaunchSpec, settings: &HubSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            restart_delay: settings.restart_delay(),
            ..Self::new(launch)
        }
    }
}

struct WorkerRuntime {
    spec: WorkerSpec,
    pid: Option<u32>,
    peer: Option<Arc<Peer>>,
    started_at: Instant,
    restarts: u32,
    generation: u64,
    exited: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl WorkerRuntime {
    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    fn to_info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.spec.id.clone(),
            display: self.spec.display.clone(),
            port: self.spec.port,
            pid: self.pid,
            running: self.is_alive(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            restarts: self.restarts,
            connected: self.peer.as_ref().is_some_and(|p| p.is_alive()),
        }
    }
}

/// Snapshot of one supervised worker.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: String,
    pub display: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub running: bool,
    pub uptime_secs: u64,
    pub restarts: u32,
    pub connected: bool,
}

/// What one reconciliation pass changed.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub stopped: Vec<String>,
    pub removed: Vec<String>,
    pub launched: Vec<String>,
}

pub struct Supervisor {
    paths: Paths,
    config: SupervisorConfig,
    registry: Arc<AsyncMutex<Registry>>,
    bus: Arc<EventBus>,
    logs: Arc<LogBuffer>,
    workers: Mutex<HashMap<String, WorkerRuntime>>,
    next_generation: AtomicU64,
}

impl Supervisor {
    pub fn new(
        paths: Paths,
        config: SupervisorConfig,
        registry: Arc<AsyncMutex<Registry>>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            config,
            registry,
            bus,
            logs: Arc::new(LogBuffer::default()),
            workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<AsyncMutex<Registry>> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<String, WorkerRuntime>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a worker unless one is already running under `id`.
    ///
    /// The worker is relaunched with the same arguments every time it exits
    /// until it is torn down.
    pub async fn launch(self: &Arc<Self>, id: &str, port: u16, display: &str) -> anyhow::Result<()> {
        let restarts = {
            let workers = self.lock_workers();
            match workers.get(id) {
                Some(runtime) if runtime.is_alive() => {
                    debug!(bridge = id, "Worker already running");
                    return Ok(());
                }
                Some(runtime) => runtime.restarts,
                None => 0,
            }
        };

        let spec = WorkerSpec {
            id: id.to_string(),
            port,
            display: display.to_string(),
        };
        self.spawn_worker(spec, restarts, None).await
    }

    /// Spawn the process and register it. With `replaces`, the entry is
    /// only taken over if it still belongs to that generation.
    async fn spawn_worker(
        self: &Arc<Self>,
        spec: WorkerSpec,
        restarts: u32,
        replaces: Option<u64>,
    ) -> anyhow::Result<()> {
        let dir = self.paths.bridge_dir(&spec.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut cmd = process::command(&self.config.launch, &spec, &self.paths);

        #[cfg(unix)]
        let channel = crate::rpc::forked::ChannelPair::new()
            .context("Failed to create worker channel")?;
        #[cfg(unix)]
        channel.inherit(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start worker '{}'", spec.id))?;
        let pid = child.id();
        process::spawn_log_readers(&spec.id, &mut child, &self.logs, &self.bus);

        #[cfg(unix)]
        let peer = match pid {
            Some(pid) => match channel.attach(
                pid,
                spec.id.clone(),
                Router::new(),
                self.bus.sink_for(&spec.id),
                self.config.request_timeout,
            ) {
                Ok(peer) => Some(peer),
                Err(e) => {
                    warn!(bridge = %spec.id, "Worker started without a channel: {}", e);
                    None
                }
            },
            None => None,
        };
        #[cfg(not(unix))]
        let peer: Option<Arc<Peer>> = None;

        let id = spec.id.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let exited = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();

        let previous = {
            let mut workers = self.lock_workers();
            if let Some(expected) = replaces {
                if workers.get(&id).map(|r| r.generation) != Some(expected) {
                    drop(workers);
                    debug!(bridge = %id, "Worker torn down during relaunch, discarding");
                    if let Some(peer) = peer {
                        peer.close();
                    }
                    // kill_on_drop reaps the fresh child
                    return Ok(());
                }
            }

            let watcher = tokio::spawn(Arc::clone(self).watch(
                spec.clone(),
                child,
                generation,
                Arc::clone(&exited),
                stop_rx,
            ));
            workers.insert(
                id.clone(),
                WorkerRuntime {
                    spec,
                    pid,
                    peer,
                    started_at: Instant::now(),
                    restarts,
                    generation,
                    exited,
                    stop: Some(stop_tx),
                    watcher: Some(watcher),
                },
            )
        };

        if let Some(peer) = previous.and_then(|p| p.peer) {
            peer.close();
        }
        info!(bridge = %id, pid = ?pid, restarts, "Worker launched");
        Ok(())
    }

    /// Owns the child: relaunches on exit, terminates on stop.
    ///
    /// Boxed because relaunching spawns another watcher.
    fn watch(
        self: Arc<Self>,
        spec: WorkerSpec,
        mut child: Child,
        generation: u64,
        exited: Arc<AtomicBool>,
        stop: oneshot::Receiver<()>,
    ) -> BoxFuture<'static, ()> {
        async move {
            tokio::select! {
                status = child.wait() => {
                    exited.store(true, Ordering::SeqCst);
                    match status {
                        Ok(status) => warn!(bridge = %spec.id, %status, "Worker exited"),
                        Err(e) => warn!(bridge = %spec.id, "Lost track of worker: {}", e),
                    }
                    self.relaunch(spec, generation).await;
                }
                _ = stop => {
                    process::terminate(&spec.id, &mut child, self.config.stop_grace).await;
                    exited.store(true, Ordering::SeqCst);
                }
            }
        }
        .boxed()
    }

    /// Keep trying until a new process is up or the worker is torn down.
    async fn relaunch(self: &Arc<Self>, spec: WorkerSpec, generation: u64) {
        let Some(mut restarts) = self.restarts_of(&spec.id, generation) else {
            trace!(bridge = %spec.id, "Worker was torn down, not relaunching");
            return;
        };

        if !self.config.restart_delay.is_zero() {
            tokio::time::sleep(self.config.restart_delay).await;
        }

        loop {
            restarts += 1;
            info!(bridge = %spec.id, attempt = restarts, "Relaunching worker");
            match self.spawn_worker(spec.clone(), restarts, Some(generation)).await {
                Ok(()) => return,
                Err(e) => error!(bridge = %spec.id, "Failed to relaunch worker: {:#}", e),
            }

            {
                let mut workers = self.lock_workers();
                match workers.get_mut(&spec.id) {
                    Some(runtime) if runtime.generation == generation => {
                        runtime.restarts = restarts;
                    }
                    _ => return,
                }
            }
            tokio::time::sleep(self.config.restart_delay.max(RETRY_INTERVAL)).await;
        }
    }

    fn restarts_of(&self, id: &str, generation: u64) -> Option<u32> {
        self.lock_workers()
            .get(id)
            .filter(|runtime| runtime.generation == generation)
            .map(|runtime| runtime.restarts)
    }

    /// Stop a worker and wait for the OS to confirm it is gone. Unknown ids
    /// return at once.
    pub async fn teardown(&self, id: &str) {
        let runtime = self.lock_workers().remove(id);
        let Some(mut runtime) = runtime else {
            trace!(bridge = id, "Nothing to tear down");
            return;
        };

        info!(bridge = id, pid = ?runtime.pid, "Tearing down worker");
        if let Some(stop) = runtime.stop.take() {
            let _ = stop.send(());
        }
        if let Some(watcher) = runtime.watcher.take() {
            if let Err(e) = watcher.await {
                warn!(bridge = id, "Worker watcher failed: {}", e);
            }
        }
        if let Some(peer) = runtime.peer.take() {
            peer.close();
        }
    }

    pub async fn teardown_all(&self) {
        let ids: Vec<String> = self.lock_workers().keys().cloned().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Stopping all workers");
        }
        join_all(ids.iter().map(|id| self.teardown(id))).await;
    }

    /// Align live processes with the registry.
    pub async fn sync(self: &Arc<Self>) -> SyncReport {
        let (desired, known) = {
            let registry = self.registry.lock().await;
            (registry.list(), registry.ids())
        };
        let desired_ids: HashSet<&str> = desired.iter().map(|r| r.id.as_str()).collect();
        let mut report = SyncReport::default();

        report.stopped = self
            .lock_workers()
            .keys()
            .filter(|id| !desired_ids.contains(id.as_str()))
            .cloned()
            .collect();
        join_all(report.stopped.iter().map(|id| self.teardown(id))).await;

        let data_dir = self.paths.data_dir();
        report.removed = tokio::task::spawn_blocking(move || collect_orphans(&data_dir, &known))
            .await
            .unwrap_or_else(|e| {
                warn!("Orphan collection failed: {}", e);
                Vec::new()
            });

        for record in desired.iter().filter(|r| r.kind == BridgeKind::Bridge) {
            if self.is_running(&record.id) {
                continue;
            }
            match self.launch(&record.id, record.port, &record.display).await {
                Ok(()) => report.launched.push(record.id.clone()),
                Err(e) => error!(bridge = %record.id, "{:#}", e),
            }
        }

        debug!(
            stopped = report.stopped.len(),
            removed = report.removed.len(),
            launched = report.launched.len(),
            "Sync complete"
        );
        report
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock_workers().get(id).is_some_and(WorkerRuntime::is_alive)
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.lock_workers().get(id).and_then(|r| r.pid)
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .lock_workers()
            .values()
            .map(WorkerRuntime::to_info)
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.lock_workers().get(id).and_then(|r| r.peer.clone())
    }

    /// Call a route on a worker. `None` when it is unknown, down or silent.
    pub async fn fetch(
        &self,
        id: &str,
        path: &str,
        params: Option<Value>,
        body: Option<Value>,
    ) -> Option<Value> {
        let Some(peer) = self.peer(id) else {
            trace!(bridge = id, path, "No worker to fetch from");
            return None;
        };
        peer.fetch(path, params, body).await
    }

    pub fn emit(&self, id: &str, event: WorkerEvent) -> bool {
        self.peer(id).is_some_and(|peer| peer.emit(event))
    }
}

/// Delete state directories under `data_dir` no record owns.
fn collect_orphans(data_dir: &Path, keep: &[String]) -> Vec<String> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %data_dir.display(), "Cannot scan state directories: {}", e);
            return Vec::new();
        }
    };

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if RESERVED_DATA_DIRS.contains(&name.as_str()) || keep.contains(&name) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                info!(dir = %name, "Removed orphaned state directory");
                removed.push(name);
            }
            Err(e) => warn!(dir = %name, "Failed to remove orphaned state: {}", e),
        }
    }
    removed.sort();
    removed
}
