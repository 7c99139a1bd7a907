//! The hub: registry owner, worker supervisor and control-plane server.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::archive;
use crate::error::{HubError, Result};
use crate::events::{EventBus, HubEvent, LayoutStore};
use crate::monitor::Monitor;
use crate::paths::Paths;
use crate::registry::{BridgeInfo, Registry, DEFAULT_ADVERTISER};
use crate::rpc::socket::probe;
use crate::rpc::{discard_events, Router, RpcRequest, SocketServer, HUB_SOCKET};
use crate::settings::HubSettings;
use crate::shutdown;
use crate::supervisor::{LaunchSpec, Supervisor, SupervisorConfig};

pub const DEFAULT_HUB_PORT: u16 = 51826;
pub const DEFAULT_PIN: &str = "031-45-154";
const DEFAULT_LOG_LINES: usize = 100;

#[derive(Deserialize, Debug)]
struct CreateBody {
    name: String,
    port: u16,
    #[serde(default)]
    pin: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    advertiser: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct InfoBody {
    display: Option<String>,
    pin: Option<String>,
    autostart: Option<u32>,
    advertiser: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PortsBody {
    start: u16,
    end: u16,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct FetchBody {
    params: Option<Value>,
    body: Option<Value>,
}

#[derive(Serialize, Debug)]
struct HubStatus {
    version: &'static str,
    uptime: u64,
    bridges: usize,
    workers: Vec<crate::supervisor::WorkerInfo>,
}

pub struct Hub {
    paths: Paths,
    settings: HubSettings,
    supervisor: Arc<Supervisor>,
    monitor: Arc<Monitor>,
    started_at: Instant,
}

impl Hub {
    pub fn new(paths: Paths, dev_mode: bool, launch: LaunchSpec) -> Arc<Self> {
        let settings = HubSettings::load(&paths.settings_file());
        let registry = Arc::new(AsyncMutex::new(Registry::load(paths.clone(), dev_mode)));
        let bus = Arc::new(EventBus::new(LayoutStore::load(paths.layout_file())));
        let supervisor = Supervisor::new(
            paths.clone(),
            SupervisorConfig::from_settings(launch, &settings),
            registry,
            bus,
        );
        let monitor = Arc::new(Monitor::new(
            Arc::clone(&supervisor),
            paths.settings_file(),
        ));

        Arc::new(Self {
            paths,
            settings,
            supervisor,
            monitor,
            started_at: Instant::now(),
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn run(self: Arc<Self>, port: u16, pin: &str) -> anyhow::Result<()> {
        info!(root = %self.paths.root().display(), "Hub starting");

        if probe(HUB_SOCKET).await {
            anyhow::bail!("A hub is already running");
        }

        let pin = pin.to_string();
        self.with_registry(move |registry, _| registry.ensure_hub(port, &pin))
            .await
            .context("Failed to register the hub")?;

        let report = self.supervisor.sync().await;
        info!(launched = report.launched.len(), "Initial sync complete");

        let (_trigger, stop) = shutdown::on_signal();

        let monitor = Arc::clone(&self.monitor);
        let monitor_stop = stop.clone();
        let monitor_task = tokio::spawn(async move { monitor.run(monitor_stop).await });

        let server = SocketServer::with_heartbeat(
            HUB_SOCKET,
            self.router(),
            discard_events(),
            self.settings.request_timeout(),
            self.settings.heartbeat_interval(),
        );
        let relay = tokio::spawn(relay_events(
            self.supervisor.bus().subscribe(),
            Arc::clone(&server),
            stop.clone(),
        ));

        info!("Hub ready");
        let served = Arc::clone(&server).run(stop).await;

        info!("Stopping all workers...");
        self.supervisor.teardown_all().await;
        relay.abort();
        if let Err(e) = monitor_task.await {
            warn!("Health monitor task failed: {}", e);
        }

        served.context("Control-plane socket failed")?;
        info!("Hub stopped");
        Ok(())
    }

    fn handle<F, Fut>(self: &Arc<Self>, router: &Router, path: &str, handler: F)
    where
        F: Fn(Arc<Hub>, RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let hub = Arc::clone(self);
        router.route(path, move |req| handler(Arc::clone(&hub), req));
    }

    /// Control-plane routes.
    pub fn router(self: &Arc<Self>) -> Router {
        let router = Router::new();

        self.handle(&router, "status:get", |hub, _| async move {
            serde_json::to_value(hub.status().await).ok()
        });
        self.handle(&router, "bridges:list", |hub, _| async move {
            reply(hub.list_bridges().await)
        });
        self.handle(&router, "bridges:create", |hub, req| async move {
            reply(hub.create_bridge(&req).await)
        });
        self.handle(&router, "bridges:info", |hub, req| async move {
            reply(hub.update_info(&req).await)
        });
        self.handle(&router, "bridges:ports", |hub, req| async move {
            reply(hub.update_ports(&req).await)
        });
        self.handle(&router, "bridges:uninstall", |hub, req| async move {
            reply(hub.uninstall_bridge(&req).await)
        });
        self.handle(&router, "bridges:sync", |hub, _| async move {
            serde_json::to_value(hub.supervisor.sync().await).ok()
        });
        self.handle(&router, "bridge:fetch", |hub, req| async move {
            hub.fetch_bridge(req).await
        });
        self.handle(&router, "health:get", |hub, _| async move {
            let report = match hub.monitor.latest() {
                Some(report) => report,
                None => hub.monitor.poll_once().await,
            };
            serde_json::to_value(report).ok()
        });
        self.handle(&router, "logs:tail", |hub, req| async move {
            let id = req.param("id")?;
            let lines = req
                .params
                .as_ref()
                .and_then(|p| p.get("lines"))
                .and_then(Value::as_u64)
                .map_or(DEFAULT_LOG_LINES, |n| n as usize);
            serde_json::to_value(hub.supervisor.logs().tail(id, lines)).ok()
        });
        self.handle(&router, "archive:export", |hub, req| async move {
            reply(hub.export_bridge(&req).await)
        });

        router
    }

    async fn status(&self) -> HubStatus {
        let bridges = self.supervisor.registry().lock().await.list().len();
        HubStatus {
            version: env!("CARGO_PKG_VERSION"),
            uptime: self.started_at.elapsed().as_secs(),
            bridges,
            workers: self.supervisor.workers(),
        }
    }

    /// Run `op` on the blocking pool; registry mutations rewrite the file and
    /// uninstall deletes whole directory trees.
    async fn with_registry<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Registry, &Paths) -> Result<T> + Send + 'static,
    {
        let registry = Arc::clone(self.supervisor.registry());
        let paths = self.paths.clone();
        tokio::task::spawn_blocking(move || op(&mut registry.blocking_lock(), &paths))
            .await
            .map_err(|e| HubError::Other(format!("registry task failed: {e}")))?
    }

    async fn list_bridges(&self) -> Result<Vec<BridgeInfo>> {
        self.with_registry(|registry, paths| {
            Ok(registry.list().iter().map(|r| r.describe(paths)).collect())
        })
        .await
    }

    async fn create_bridge(&self, req: &RpcRequest) -> Result<BridgeInfo> {
        let body: CreateBody = parse_body(req)?;
        let info = self
            .with_registry(move |registry, paths| {
                let record = registry.create(
                    &body.name,
                    body.port,
                    body.pin.as_deref().unwrap_or(DEFAULT_PIN),
                    body.username.as_deref(),
                    body.advertiser.as_deref().unwrap_or(DEFAULT_ADVERTISER),
                )?;
                Ok(record.describe(paths))
            })
            .await?;
        self.supervisor.sync().await;
        Ok(info)
    }

    async fn update_info(&self, req: &RpcRequest) -> Result<BridgeInfo> {
        let id = required_id(req)?.to_string();
        let body: InfoBody = parse_body(req)?;
        let info = self
            .with_registry(move |registry, paths| {
                let record = registry.update(&id)?.info(
                    body.display.as_deref(),
                    body.pin.as_deref(),
                    body.autostart,
                    body.advertiser.as_deref(),
                )?;
                Ok(record.describe(paths))
            })
            .await?;
        self.supervisor.sync().await;
        Ok(info)
    }

    async fn update_ports(&self, req: &RpcRequest) -> Result<BridgeInfo> {
        let id = required_id(req)?.to_string();
        let body: PortsBody = parse_body(req)?;
        let info = self
            .with_registry(move |registry, paths| {
                let record = registry.update(&id)?.ports(body.start, body.end)?;
                Ok(record.describe(paths))
            })
            .await?;
        self.supervisor.sync().await;
        Ok(info)
    }

    async fn uninstall_bridge(&self, req: &RpcRequest) -> Result<Value> {
        let id = required_id(req)?.to_string();
        // stop first so the worker is not writing into artifacts being removed
        self.supervisor.teardown(&id).await;
        let target = id.clone();
        let removed = self
            .with_registry(move |registry, _| registry.uninstall(&target))
            .await?;
        if removed {
            self.supervisor.logs().clear(&id);
        }
        self.supervisor.sync().await;
        Ok(json!({ "removed": removed }))
    }

    async fn fetch_bridge(&self, req: RpcRequest) -> Option<Value> {
        let id = req.param("id")?;
        let path = req.param("path")?;
        let forwarded: FetchBody = req
            .body
            .clone()
            .and_then(|b| serde_json::from_value(b).ok())
            .unwrap_or_default();
        debug!(bridge = id, path, "Forwarding call to worker");
        self.supervisor
            .fetch(id, path, forwarded.params, forwarded.body)
            .await
    }

    async fn export_bridge(&self, req: &RpcRequest) -> Result<Value> {
        let id = required_id(req)?;
        let record = self
            .supervisor
            .registry()
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(id.to_string()))?;

        let out = match req.param("out") {
            Some(out) => PathBuf::from(out),
            None => self.paths.backups_dir().join(format!(
                "{}-{}.zip",
                record.id,
                chrono::Utc::now().format("%Y%m%d%H%M%S")
            )),
        };

        let paths = self.paths.clone();
        let target = out.clone();
        let files = tokio::task::spawn_blocking(move || {
            archive::export_bridge(&paths, &record, &target)
        })
        .await
        .map_err(|e| HubError::Other(format!("export task failed: {e}")))??;

        Ok(json!({ "path": out.display().to_string(), "files": files }))
    }
}

/// Forward bus traffic to every control-plane client.
async fn relay_events(
    mut events: broadcast::Receiver<HubEvent>,
    server: Arc<SocketServer>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown::wait(&mut stop) => break,
            event = events.recv() => match event {
                Ok(event) => {
                    server.emit(&event.to_wire());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event relay lagging, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn reply<T: Serialize>(result: Result<T>) -> Option<Value> {
    match result {
        Ok(value) => serde_json::to_value(value).ok(),
        Err(e) => {
            if e.is_contract_violation() {
                debug!(error = %e, "Control-plane request rejected");
            } else {
                warn!(error = %e, "Control-plane request failed");
            }
            Some(json!({ "error": e.slug(), "message": e.to_string() }))
        }
    }
}

fn required_id(req: &RpcRequest) -> Result<&str> {
    req.param("id")
        .ok_or_else(|| HubError::Other("missing parameter 'id'".to_string()))
}

fn parse_body<T: DeserializeOwned>(req: &RpcRequest) -> Result<T> {
    let body = req.body.clone().unwrap_or_else(|| json!({}));
    Ok(serde_json::from_value(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::WorkerFlags;

    fn hub(dir: &std::path::Path) -> Arc<Hub> {
        let launch = LaunchSpec {
            program: "/bin/sh".into(),
            prefix_args: vec!["-c".into(), "exec sleep 30".into()],
            flags: WorkerFlags::default(),
        };
        Hub::new(Paths::new(dir), false, launch)
    }

    fn request(path: &str, params: Value, body: Option<Value>) -> RpcRequest {
        RpcRequest {
            path: path.into(),
            session: "s".into(),
            params: Some(params),
            body,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_list_uninstall_through_routes() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        let router = hub.router();

        let created = router
            .dispatch(request(
                "bridges:create",
                json!({}),
                Some(json!({"name": "Kitchen", "port": 51828})),
            ))
            .await;
        assert_eq!(created["id"], "kitchen");
        assert_eq!(created["pin"], DEFAULT_PIN);
        assert!(hub.supervisor().is_running("kitchen"));

        let duplicate = router
            .dispatch(request(
                "bridges:create",
                json!({}),
                Some(json!({"name": "kitchen", "port": 51900})),
            ))
            .await;
        assert_eq!(duplicate["error"], "duplicate-id");

        let listed = router.dispatch(request("bridges:list", json!({}), None)).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let status = router.dispatch(request("status:get", json!({}), None)).await;
        assert_eq!(status["workers"][0]["id"], "kitchen");

        hub.supervisor().logs().push(
            "kitchen",
            crate::rpc::LogLine {
                level: crate::rpc::LogLevel::Info,
                message: "paired".into(),
                timestamp: None,
            },
        );
        let removed = router
            .dispatch(request("bridges:uninstall", json!({"id": "kitchen"}), None))
            .await;
        assert_eq!(removed["removed"], true);
        assert!(!hub.supervisor().is_running("kitchen"));
        assert!(hub.supervisor().logs().tail("kitchen", 10).is_empty());

        let again = router
            .dispatch(request("bridges:uninstall", json!({"id": "kitchen"}), None))
            .await;
        assert_eq!(again["removed"], false);
    }

    #[tokio::test]
    async fn contract_violations_come_back_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let router = hub(dir.path()).router();

        let missing = router
            .dispatch(request("bridges:info", json!({"id": "nobody"}), Some(json!({}))))
            .await;
        assert_eq!(missing["error"], "not-found");

        let no_id = router
            .dispatch(request("bridges:ports", json!({}), Some(json!({"start": 1, "end": 2}))))
            .await;
        assert_eq!(no_id["error"], "other");

        let unknown = router.dispatch(request("no:such", json!({}), None)).await;
        assert_eq!(unknown, Value::Null);
    }

    #[tokio::test]
    async fn fetch_to_missing_worker_is_null() {
        let dir = tempfile::tempdir().unwrap();
        let router = hub(dir.path()).router();
        let answer = router
            .dispatch(request(
                "bridge:fetch",
                json!({"id": "ghost", "path": "status:get"}),
                None,
            ))
            .await;
        assert_eq!(answer, Value::Null);
    }

    #[tokio::test]
    async fn health_reports_registered_bridges() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path());
        hub.supervisor()
            .registry()
            .lock()
            .await
            .create("Garage", 51829, DEFAULT_PIN, None, DEFAULT_ADVERTISER)
            .unwrap();

        let health = hub
            .router()
            .dispatch(request("health:get", json!({}), None))
            .await;
        assert_eq!(health["bridges"][0]["id"], "garage");
        assert_eq!(health["bridges"][0]["status"], "unavailable");
    }
}
