//! Worker mode: one bridge engine instance behind an RPC route table.
//!
//! A worker the hub spawned talks to it over the inherited channel. Started
//! on its own, it serves its well-known local socket instead.

pub mod engine;

use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clienv;
use crate::monitor::{WorkerStatus, STATUS_ROUTE};
use crate::paths::Paths;
use crate::registry::{BridgeRecord, Registry};
use crate::rpc::socket::bridge_socket;
use crate::rpc::{
    discard_events, AccessoryChange, LogLevel, Notification, Peer, Router, RpcRequest,
    SocketServer, WorkerEvent, DEFAULT_TIMEOUT,
};
use crate::shutdown;
use engine::EngineClient;

pub const STATUS_RUNNING: &str = "running";

/// The worker launch contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    pub bridge: String,
    pub port: u16,
    pub debug: bool,
    pub verbose: bool,
    pub container: bool,
    pub orphans: bool,
}

/// Where events go: the hub over the forked channel, or every socket client.
enum Upstream {
    Hub(Arc<Peer>),
    Socket(Arc<SocketServer>),
}

impl Upstream {
    fn emit(&self, event: WorkerEvent) -> bool {
        match self {
            Upstream::Hub(peer) => peer.emit(event),
            Upstream::Socket(server) => server.emit(&event),
        }
    }
}

pub struct Worker {
    options: WorkerOptions,
    paths: Paths,
    record: Option<BridgeRecord>,
    engine: EngineClient,
    started_at: Instant,
    upstream: OnceLock<Upstream>,
}

impl Worker {
    pub fn new(options: WorkerOptions, paths: Paths, dev_mode: bool) -> anyhow::Result<Arc<Self>> {
        let record = Registry::load(paths.clone(), dev_mode)
            .get(&options.bridge)
            .cloned();
        if record.is_none() {
            warn!(bridge = %options.bridge, "Bridge is not in the registry");
        }
        let engine = EngineClient::new(options.port)?;
        Ok(Self::from_parts(options, paths, record, engine))
    }

    pub fn from_parts(
        options: WorkerOptions,
        paths: Paths,
        record: Option<BridgeRecord>,
        engine: EngineClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            paths,
            record,
            engine,
            started_at: Instant::now(),
            upstream: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.options.bridge
    }

    fn display(&self) -> String {
        self.record
            .as_ref()
            .map(|r| r.display.clone())
            .unwrap_or_else(|| self.options.bridge.clone())
    }

    /// Self-report; `engine` is whatever the engine said about itself.
    pub fn status(&self, engine: Option<&Value>) -> WorkerStatus {
        let engine_str = |key: &str| {
            engine
                .and_then(|e| e.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        WorkerStatus {
            id: self.options.bridge.clone(),
            display: self.display(),
            running: true,
            status: engine_str("status").unwrap_or_else(|| STATUS_RUNNING.to_string()),
            uptime: self.started_at.elapsed().as_secs(),
            bridge_name: Some(self.display()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            node_version: engine_str("node_version"),
            username: self.record.as_ref().map(|r| r.username.clone()),
            bridge_port: Some(self.options.port),
            setup_pin: self.record.as_ref().map(|r| r.pin.clone()),
            setup_id: engine_str("setup_id"),
            storage_path: Some(
                self.paths
                    .bridge_dir(&self.options.bridge)
                    .display()
                    .to_string(),
            ),
        }
    }

    /// Push an event upstream; `false` before connecting or when nobody listens.
    pub fn emit(&self, event: WorkerEvent) -> bool {
        self.upstream.get().is_some_and(|u| u.emit(event))
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let router = Router::new();

        let worker = Arc::clone(self);
        router.route(STATUS_ROUTE, move |_| {
            let worker = Arc::clone(&worker);
            async move {
                let engine = worker.engine.status().await;
                serde_json::to_value(worker.status(engine.as_ref())).ok()
            }
        });

        let worker = Arc::clone(self);
        router.route("accessories:list", move |_| {
            let worker = Arc::clone(&worker);
            async move { worker.engine.accessories().await }
        });

        let worker = Arc::clone(self);
        router.route("accessory:get", move |req: RpcRequest| {
            let worker = Arc::clone(&worker);
            async move {
                let id = req.param("id")?;
                worker.engine.accessory(id).await
            }
        });

        let worker = Arc::clone(self);
        router.route("accessory:set", move |req: RpcRequest| {
            let worker = Arc::clone(&worker);
            async move { worker.set_accessory(req).await }
        });

        router
    }

    async fn set_accessory(&self, req: RpcRequest) -> Option<Value> {
        let id = req.param("id")?.to_string();
        let body = req.body?;
        let state = self.engine.set(&id, &body).await?;

        let mut changed = match (&state, &body) {
            (Value::Object(map), _) | (_, Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        changed.remove("accessory_identifier");
        let delivered = self.emit(WorkerEvent::AccessoryChange(AccessoryChange {
            accessory_identifier: id.clone(),
            state: changed,
        }));
        debug!(accessory = %id, delivered, "Accessory updated");
        Some(state)
    }

    fn startup_notification(&self) -> WorkerEvent {
        WorkerEvent::Notification(Notification {
            title: format!("{} started", self.display()),
            description: format!("Bridge listening on port {}", self.options.port),
            level: LogLevel::Info,
        })
    }

    /// Serve until SIGTERM/SIGINT, or until the hub goes away.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let router = self.router();
        let (_trigger, mut stop) = shutdown::on_signal();
        info!(bridge = %self.id(), port = self.options.port, "Worker starting");

        match clienv::channel_fd() {
            #[cfg(unix)]
            Some(fd) => {
                let peer = crate::rpc::forked::connect_parent(
                    fd,
                    format!("{}->hub", self.id()),
                    router,
                    discard_events(),
                    DEFAULT_TIMEOUT,
                )?;
                let _ = self.upstream.set(Upstream::Hub(Arc::clone(&peer)));
                self.emit(self.startup_notification());

                let mut check = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = shutdown::wait(&mut stop) => break,
                        _ = check.tick() => {
                            if !peer.is_alive() {
                                warn!(bridge = %self.id(), "Hub went away, exiting");
                                break;
                            }
                        }
                    }
                }
                peer.close();
            }
            _ => {
                let server = SocketServer::new(
                    bridge_socket(self.id()),
                    router,
                    discard_events(),
                    DEFAULT_TIMEOUT,
                );
                let _ = self.upstream.set(Upstream::Socket(Arc::clone(&server)));
                let serving = tokio::spawn(Arc::clone(&server).run(stop));
                self.emit(self.startup_notification());
                serving.await??;
            }
        }

        info!(bridge = %self.id(), "Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::engine::tests::fake_engine;
    use super::*;
    use serde_json::json;

    fn request(path: &str, params: Option<Value>, body: Option<Value>) -> RpcRequest {
        RpcRequest {
            path: path.into(),
            session: "s1".into(),
            params,
            body,
        }
    }

    fn worker(base: String, dir: &std::path::Path) -> Arc<Worker> {
        let paths = Paths::new(dir);
        let mut registry = Registry::load(paths.clone(), false);
        let record = registry
            .create("Kitchen", 51828, "031-45-154", None, "bonjour")
            .unwrap();
        let options = WorkerOptions {
            bridge: "kitchen".into(),
            port: 51828,
            ..Default::default()
        };
        Worker::from_parts(
            options,
            paths,
            Some(record),
            EngineClient::with_base(base).unwrap(),
        )
    }

    #[tokio::test]
    async fn status_reports_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _requests) = fake_engine(json!({"node_version": "v20.11.0"})).await;
        let router = worker(base, dir.path()).router();

        let status: WorkerStatus =
            serde_json::from_value(router.dispatch(request(STATUS_ROUTE, None, None)).await)
                .unwrap();
        assert_eq!(status.id, "kitchen");
        assert_eq!(status.display, "Kitchen");
        assert!(status.running);
        assert_eq!(status.status, STATUS_RUNNING);
        assert_eq!(status.bridge_port, Some(51828));
        assert_eq!(status.setup_pin.as_deref(), Some("031-45-154"));
        assert_eq!(status.node_version.as_deref(), Some("v20.11.0"));
    }

    #[tokio::test]
    async fn accessory_routes_front_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (base, mut requests) = fake_engine(json!({"on": true})).await;
        let router = worker(base, dir.path()).router();

        let got = router
            .dispatch(request("accessory:get", Some(json!({"id": "lamp-1"})), None))
            .await;
        assert_eq!(got, json!({"on": true}));
        assert!(requests
            .recv()
            .await
            .unwrap()
            .starts_with("GET /api/accessory/lamp-1"));

        let set = router
            .dispatch(request(
                "accessory:set",
                Some(json!({"id": "lamp-1"})),
                Some(json!({"on": true})),
            ))
            .await;
        assert_eq!(set, json!({"on": true}));
        assert!(requests
            .recv()
            .await
            .unwrap()
            .starts_with("PUT /api/accessory/lamp-1"));

        // missing id answers null without touching the engine
        let missing = router.dispatch(request("accessory:get", None, None)).await;
        assert_eq!(missing, Value::Null);
    }

    #[tokio::test]
    async fn emit_before_connecting_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _requests) = fake_engine(json!({})).await;
        let worker = worker(base, dir.path());
        assert!(!worker.emit(worker.startup_notification()));
    }
}
