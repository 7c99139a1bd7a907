//! Socket binding: local domain socket / named pipe between processes that
//! did not fork one another.

use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
use interprocess::local_socket::{
    GenericFilePath, GenericNamespaced, ListenerOptions, Name, NameType, ToFsName, ToNsName,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::channel::{read_frames, spawn_reader, LineWriter};
use super::envelope::{Message, WorkerEvent};
use super::peer::{discard_events, EventSink, Link, Peer};
use super::router::Router;

/// Well-known name of the hub control plane.
pub const HUB_SOCKET: &str = "bridgehub.hub";

/// How long one heartbeat probe waits for connect and `pong`.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Socket name for a standalone worker.
pub fn bridge_socket(id: &str) -> String {
    format!("bridgehub.bridge.{id}")
}

fn socket_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.sock"))
}

/// Resolve a well-known name: abstract namespace where the platform has one,
/// a file in the temp directory otherwise.
pub fn socket_name(name: &str) -> io::Result<Name<'static>> {
    if GenericNamespaced::is_supported() {
        format!("{name}.sock").to_ns_name::<GenericNamespaced>()
    } else {
        socket_file(name).to_fs_name::<GenericFilePath>()
    }
}

struct SocketLink {
    writer: LineWriter,
}

impl Link for SocketLink {
    fn is_alive(&self) -> bool {
        !self.writer.is_closed()
    }

    fn send(&self, message: &Message) -> bool {
        self.writer.send(message)
    }

    fn close(&self) {
        self.writer.close();
    }
}

fn peer_over(
    stream: Stream,
    label: String,
    router: Router,
    events: EventSink,
    timeout: Duration,
) -> (Arc<Peer>, impl tokio::io::AsyncRead + Unpin + Send + 'static) {
    let (recv, send) = stream.split();
    let link = SocketLink {
        writer: LineWriter::spawn(send, label.clone()),
    };
    (Peer::new(label, Box::new(link), router, events, timeout), recv)
}

/// Connect to the server registered under `name`.
pub async fn connect(
    name: &str,
    router: Router,
    events: EventSink,
    timeout: Duration,
) -> io::Result<Arc<Peer>> {
    let socket = socket_name(name)?;
    let stream = tokio::time::timeout(PROBE_TIMEOUT, Stream::connect(socket))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    let (peer, recv) = peer_over(stream, name.to_string(), router, events, timeout);
    peer.set_reader(spawn_reader(recv, Arc::clone(&peer)));
    trace!(name, "Connected to local socket");
    Ok(peer)
}

/// One liveness probe: connect, `ping`, await `pong`. No retries.
pub async fn probe(name: &str) -> bool {
    match connect(name, Router::new(), discard_events(), PROBE_TIMEOUT).await {
        Ok(peer) => {
            let alive = peer.ping(PROBE_TIMEOUT).await;
            peer.close();
            alive
        }
        Err(e) => {
            trace!(name, "Probe connect failed: {}", e);
            false
        }
    }
}

/// Local socket server that accepts any number of peers sharing one route table.
pub struct SocketServer {
    name: String,
    router: Router,
    events: EventSink,
    timeout: Duration,
    heartbeat: Duration,
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    next_conn: AtomicU64,
    restarts: AtomicU32,
    #[cfg(test)]
    fail_probes: AtomicU32,
}

enum Exit {
    Shutdown,
    ProbeFailed,
}

impl SocketServer {
    pub fn new(name: impl Into<String>, router: Router, events: EventSink, timeout: Duration) -> Arc<Self> {
        Self::with_heartbeat(name, router, events, timeout, DEFAULT_HEARTBEAT)
    }

    pub fn with_heartbeat(
        name: impl Into<String>,
        router: Router,
        events: EventSink,
        timeout: Duration,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            router,
            events,
            timeout,
            heartbeat,
            peers: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
            #[cfg(test)]
            fail_probes: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// How often a failed heartbeat made the server start over.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Broadcast to every connected peer; `true` if at least one was reachable.
    pub fn emit(&self, event: &WorkerEvent) -> bool {
        let peers: Vec<Arc<Peer>> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        peers
            .iter()
            .fold(false, |reached, peer| peer.emit(event.clone()) || reached)
    }

    /// Serve until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A heartbeat probes the server from the outside; when a probe fails the
    /// listener and all connections are torn down and the server starts over.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut generation = 0u32;

        loop {
            let listener = match self.bind() {
                Ok(listener) => listener,
                Err(e) if generation == 0 => return Err(e),
                Err(e) => {
                    error!(name = %self.name, "Failed to rebind IPC server: {}", e);
                    tokio::time::sleep(self.heartbeat).await;
                    continue;
                }
            };
            info!(name = %self.name, generation, "IPC server listening");

            let accept = tokio::spawn(Arc::clone(&self).accept_loop(listener));
            let exit = tokio::select! {
                _ = crate::shutdown::wait(&mut shutdown) => Exit::Shutdown,
                _ = self.heartbeat_until_failure() => Exit::ProbeFailed,
            };

            // the listener must be gone before the name can be bound again
            accept.abort();
            let _ = accept.await;
            self.drop_peers();

            match exit {
                Exit::Shutdown => break,
                Exit::ProbeFailed => {
                    warn!(name = %self.name, "Heartbeat failed, restarting IPC server");
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                    generation += 1;
                }
            }
        }

        self.cleanup();
        info!(name = %self.name, "IPC server stopped");
        Ok(())
    }

    fn bind(&self) -> io::Result<Listener> {
        if !GenericNamespaced::is_supported() {
            let path = socket_file(&self.name);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        ListenerOptions::new()
            .name(socket_name(&self.name)?)
            .create_tokio()
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    let id = self.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
                    let label = format!("{}#{}", self.name, id);
                    let (peer, recv) = peer_over(
                        stream,
                        label,
                        self.router.clone(),
                        Arc::clone(&self.events),
                        self.timeout,
                    );
                    self.peers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(id, Arc::clone(&peer));

                    let server = Arc::clone(&self);
                    let reader_peer = Arc::clone(&peer);
                    let reader = tokio::spawn(async move {
                        read_frames(recv, &reader_peer).await;
                        server
                            .peers
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&id);
                        trace!(conn = id, "Connection closed");
                    });
                    peer.set_reader(reader);
                }
                Err(e) => {
                    warn!(name = %self.name, "Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Probe now, then again every `heartbeat`, until a probe fails.
    async fn heartbeat_until_failure(&self) {
        loop {
            if !self.probe_once().await {
                return;
            }
            debug!(name = %self.name, "Heartbeat ok");
            tokio::time::sleep(self.heartbeat).await;
        }
    }

    async fn probe_once(&self) -> bool {
        !self.forced_failure() && probe(&self.name).await
    }

    #[cfg(test)]
    fn forced_failure(&self) -> bool {
        self.fail_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    fn forced_failure(&self) -> bool {
        false
    }

    fn drop_peers(&self) {
        let peers: Vec<Arc<Peer>> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        for peer in peers {
            peer.close();
        }
    }

    fn cleanup(&self) {
        if !GenericNamespaced::is_supported() {
            let _ = std::fs::remove_file(socket_file(&self.name));
        }
    }
}
