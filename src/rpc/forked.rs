//! Forked-channel binding: a socketpair shared between the hub and a worker
//! it spawned itself. The worker inherits its end on [`CHANNEL_FD`].

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::debug;

use super::channel::{spawn_reader, LineWriter};
use super::envelope::Message;
use super::peer::{EventSink, Link, Peer};
use super::router::Router;
use crate::clienv::{EnvVar, CHANNEL_FD};

/// Liveness of the remote end is the liveness of its process.
struct ForkedLink {
    writer: LineWriter,
    pid: u32,
}

impl Link for ForkedLink {
    fn is_alive(&self) -> bool {
        !self.writer.is_closed() && process_alive(self.pid)
    }

    fn send(&self, message: &Message) -> bool {
        self.writer.send(message)
    }

    fn close(&self) {
        self.writer.close();
    }
}

/// Zero-signal probe: succeeds while `pid` exists, without disturbing it.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Hub side of a fresh channel, plus the end to hand to the child.
pub struct ChannelPair {
    parent: StdUnixStream,
    child: OwnedFd,
}

impl ChannelPair {
    pub fn new() -> io::Result<Self> {
        let (parent, child) = StdUnixStream::pair()?;
        Ok(Self {
            parent,
            child: OwnedFd::from(child),
        })
    }

    /// Arrange for the child end to appear as [`CHANNEL_FD`] in the spawned process.
    pub fn inherit(&self, cmd: &mut Command) {
        let raw = self.child.as_raw_fd();
        cmd.env(EnvVar::BridgehubChannelFd.as_str(), CHANNEL_FD.to_string());

        // SAFETY: the closure only calls async-signal-safe libc functions.
        unsafe {
            cmd.pre_exec(move || {
                if raw == CHANNEL_FD {
                    let flags = libc::fcntl(raw, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(raw, CHANNEL_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    /// Bind the hub end to the spawned process. Drops the child end.
    pub fn attach(
        self,
        pid: u32,
        label: impl Into<String>,
        router: Router,
        events: EventSink,
        timeout: Duration,
    ) -> io::Result<Arc<Peer>> {
        drop(self.child);
        peer_over(self.parent, pid, label.into(), router, events, timeout)
    }
}

/// Worker side: adopt the inherited fd and talk to the parent process.
pub fn connect_parent(
    fd: i32,
    label: impl Into<String>,
    router: Router,
    events: EventSink,
    timeout: Duration,
) -> io::Result<Arc<Peer>> {
    // SAFETY: the fd was handed to us by the hub and is owned by nobody else.
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
    let parent = std::os::unix::process::parent_id();
    peer_over(stream, parent, label.into(), router, events, timeout)
}

fn peer_over(
    stream: StdUnixStream,
    pid: u32,
    label: String,
    router: Router,
    events: EventSink,
    timeout: Duration,
) -> io::Result<Arc<Peer>> {
    stream.set_nonblocking(true)?;
    let stream = UnixStream::from_std(stream)?;
    let (read, write) = stream.into_split();

    let link = ForkedLink {
        writer: LineWriter::spawn(write, label.clone()),
        pid,
    };
    let peer = Peer::new(label, Box::new(link), router, events, timeout);
    peer.set_reader(spawn_reader(read, Arc::clone(&peer)));
    debug!(peer = %peer.label(), pid, "Forked channel attached");
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::peer::discard_events;
    use serde_json::json;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn pair_carries_requests_both_ways() {
        let (a, b) = StdUnixStream::pair().unwrap();
        let me = std::process::id();

        let worker_router = Router::new();
        worker_router.route("status:get", |_| async { Some(json!({"status": "running"})) });
        let hub_router = Router::new();
        hub_router.route("hub:version", |_| async { Some(json!("1.0")) });

        let hub = peer_over(a, me, "hub".into(), hub_router, discard_events(), Duration::from_secs(5)).unwrap();
        let worker = peer_over(b, me, "worker".into(), worker_router, discard_events(), Duration::from_secs(5)).unwrap();

        assert!(hub.is_alive());
        assert_eq!(
            hub.fetch("status:get", None, None).await,
            Some(json!({"status": "running"}))
        );
        assert_eq!(worker.fetch("hub:version", None, None).await, Some(json!("1.0")));
    }

    #[tokio::test]
    async fn exited_process_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let (a, _b) = StdUnixStream::pair().unwrap();
        let peer = peer_over(a, pid, "gone".into(), Router::new(), discard_events(), Duration::from_secs(10)).unwrap();

        let started = std::time::Instant::now();
        assert!(!peer.is_alive());
        assert_eq!(peer.fetch("status:get", None, None).await, None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
