use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::log_buffer::LogBuffer;
use crate::clienv::EnvVar;
use crate::events::EventBus;
use crate::paths::Paths;
use crate::rpc::{LogLevel, LogLine, WorkerEvent};

/// Flags passed through to every worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerFlags {
    pub debug: bool,
    pub verbose: bool,
    pub container: bool,
    pub orphans: bool,
}

/// How to start a worker: program, leading arguments, then the worker contract.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
    pub flags: WorkerFlags,
}

impl LaunchSpec {
    /// Re-run the current executable in worker mode.
    pub fn current_exe(flags: WorkerFlags) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            prefix_args: Vec::new(),
            flags,
        })
    }
}

/// Identity a worker is launched (and relaunched) with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub id: String,
    pub port: u16,
    pub display: String,
}

/// `worker --bridge <id> --port <n> [--debug] [--verbose] [--container] [--orphans]`
pub fn worker_args(id: &str, port: u16, flags: WorkerFlags) -> Vec<String> {
    let mut args = vec![
        "worker".to_string(),
        "--bridge".to_string(),
        id.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];
    for (set, flag) in [
        (flags.debug, "--debug"),
        (flags.verbose, "--verbose"),
        (flags.container, "--container"),
        (flags.orphans, "--orphans"),
    ] {
        if set {
            args.push(flag.to_string());
        }
    }
    args
}

pub fn command(launch: &LaunchSpec, spec: &WorkerSpec, paths: &Paths) -> Command {
    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.prefix_args);
    cmd.args(worker_args(&spec.id, spec.port, launch.flags));
    cmd.env(EnvVar::BridgehubRoot.as_str(), paths.root());

    let dir = paths.bridge_dir(&spec.id);
    if dir.is_dir() {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Forward stdout (info) and stderr (error) line by line into the log stream.
pub fn spawn_log_readers(
    bridge: &str,
    child: &mut Child,
    logs: &Arc<LogBuffer>,
    bus: &Arc<EventBus>,
) {
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(bridge, stdout, LogLevel::Info, logs, bus);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(bridge, stderr, LogLevel::Error, logs, bus);
    }
}

fn spawn_reader<R>(
    bridge: &str,
    stream: R,
    level: LogLevel,
    logs: &Arc<LogBuffer>,
    bus: &Arc<EventBus>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let logs = Arc::clone(logs);
    let bus = Arc::clone(bus);
    let bridge = bridge.to_string();

    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(message)) = lines.next_line().await {
            match level {
                LogLevel::Error => error!(target: "bridgehub::worker", bridge = %bridge, "{}", message),
                LogLevel::Warn => warn!(target: "bridgehub::worker", bridge = %bridge, "{}", message),
                LogLevel::Debug => debug!(target: "bridgehub::worker", bridge = %bridge, "{}", message),
                LogLevel::Info => info!(target: "bridgehub::worker", bridge = %bridge, "{}", message),
            }

            let line = LogLine {
                level,
                message,
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            };
            logs.push(&bridge, line.clone());
            bus.publish_worker(&bridge, WorkerEvent::Log(line));
        }
    });
}

/// Graceful stop: SIGTERM, then SIGKILL if the process outlives `grace`.
/// Returns once the OS reports the process gone.
pub async fn terminate(bridge: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
            // SAFETY: plain signal delivery to our own child.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => debug!(bridge, ?status, "Worker stopped"),
        Err(_) => {
            warn!(bridge, "Worker did not stop in time, force killing");
            if let Err(e) = child.kill().await {
                warn!(bridge, "Force kill failed: {}", e);
            }
        }
    }
}
