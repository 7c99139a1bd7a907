//! Periodic health aggregation.
//!
//! Every cycle polls each non-hub worker for its self-report, adds host
//! metrics and publishes the lot as one event. The next cycle is scheduled
//! only after the current one finished, so a slow worker delays the loop
//! instead of stacking cycles.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::registry::BridgeRecord;
use crate::settings::HubSettings;
use crate::supervisor::Supervisor;

pub const STATUS_ROUTE: &str = "status:get";
pub const STATUS_UNAVAILABLE: &str = "unavailable";

/// A worker's self-report, as answered on `status:get`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct WorkerStatus {
    pub id: String,
    pub display: String,
    pub running: bool,
    pub status: String,
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_pin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
}

impl WorkerStatus {
    /// Stand-in for a worker that did not answer.
    pub fn unavailable(record: &BridgeRecord) -> Self {
        Self {
            id: record.id.clone(),
            display: record.display.clone(),
            running: false,
            status: STATUS_UNAVAILABLE.to_string(),
            uptime: 0,
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CpuLoad {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MemoryUsage {
    pub total_kb: u64,
    pub available_kb: u64,
}

/// Host figures; each is absent where the platform does not expose it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HostMetrics {
    pub cpu: Option<CpuLoad>,
    pub memory: Option<MemoryUsage>,
    /// Degrees Celsius
    pub temperature: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HealthReport {
    pub bridges: Vec<WorkerStatus>,
    pub host: HostMetrics,
    pub timestamp: String,
}

pub struct Monitor {
    supervisor: Arc<Supervisor>,
    settings_file: PathBuf,
    latest: watch::Sender<Option<HealthReport>>,
}

impl Monitor {
    pub fn new(supervisor: Arc<Supervisor>, settings_file: impl Into<PathBuf>) -> Self {
        Self {
            supervisor,
            settings_file: settings_file.into(),
            latest: watch::Sender::new(None),
        }
    }

    /// Most recent report, if a cycle has completed.
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.borrow().clone()
    }

    /// Run cycles until `shutdown` flips to `true`.
    ///
    /// Settings are re-read each cycle so an interval change applies on the
    /// next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Health monitor started");
        loop {
            let report = self.poll_once().await;
            let delivered = self.supervisor.bus().publish_health(report.clone());
            trace!(subscribers = delivered, "Health report published");
            self.latest.send_replace(Some(report));

            let interval = self.reload_files().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        info!("Health monitor stopped");
    }

    /// Pick up edits to the settings and layout files; returns the next interval.
    async fn reload_files(&self) -> Duration {
        let bus = Arc::clone(self.supervisor.bus());
        let settings_file = self.settings_file.clone();
        tokio::task::spawn_blocking(move || {
            bus.layout().reload();
            HubSettings::load(&settings_file).monitor_interval()
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Failed to reload settings: {}", e);
            HubSettings::default().monitor_interval()
        })
    }

    /// One cycle: ask every worker, synthesise entries for the silent ones.
    pub async fn poll_once(&self) -> HealthReport {
        let records: Vec<BridgeRecord> = self
            .supervisor
            .registry()
            .lock()
            .await
            .list()
            .into_iter()
            .filter(|r| !r.is_hub())
            .collect();

        let polls = records.iter().map(|record| async move {
            let answer = self
                .supervisor
                .fetch(&record.id, STATUS_ROUTE, None, None)
                .await;
            match answer.map(serde_json::from_value::<WorkerStatus>) {
                Some(Ok(status)) => status,
                Some(Err(e)) => {
                    debug!(bridge = %record.id, "Unreadable status report: {}", e);
                    WorkerStatus::unavailable(record)
                }
                None => WorkerStatus::unavailable(record),
            }
        });
        let bridges = futures::future::join_all(polls).await;
        let host = tokio::task::spawn_blocking(host_metrics)
            .await
            .unwrap_or_default();

        HealthReport {
            bridges,
            host,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn host_metrics() -> HostMetrics {
    HostMetrics {
        cpu: read_to_string("/proc/loadavg").and_then(|s| parse_loadavg(&s)),
        memory: read_to_string("/proc/meminfo").and_then(|s| parse_meminfo(&s)),
        temperature: read_to_string("/sys/class/thermal/thermal_zone0/temp")
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|milli| milli / 1000.0),
    }
}

fn read_to_string(path: impl AsRef<Path>) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn parse_loadavg(content: &str) -> Option<CpuLoad> {
    let mut fields = content.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some(CpuLoad {
        load1: fields.next()??,
        load5: fields.next()??,
        load15: fields.next()??,
    })
}

fn parse_meminfo(content: &str) -> Option<MemoryUsage> {
    let field = |name: &str| {
        content
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
    };
    Some(MemoryUsage {
        total_kb: field("MemTotal")?,
        available_kb: field("MemAvailable").or_else(|| field("MemFree"))?,
    })
}
