use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::envelope::{Message, RpcRequest, RpcResponse, WorkerEvent};
use super::router::Router;
use super::session::Correlator;

/// Default time a `fetch` waits for an answer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives asynchronous events pushed by the remote side.
pub type EventSink = Arc<dyn Fn(WorkerEvent) + Send + Sync>;

pub fn discard_events() -> EventSink {
    Arc::new(|_| {})
}

/// The binding-specific half of a transport: how frames leave this process
/// and how to tell whether anyone is listening.
pub trait Link: Send + Sync {
    /// Cheap liveness probe that needs no round trip.
    fn is_alive(&self) -> bool;

    /// Queue a frame. `false` if the link is already known to be down.
    fn send(&self, message: &Message) -> bool;

    fn close(&self);
}

/// One end of an RPC conversation, independent of the binding underneath.
///
/// Owns request correlation, the inbound route table and the event sink, so
/// the forked-channel and socket bindings differ only in their [`Link`].
pub struct Peer {
    label: String,
    link: Box<dyn Link>,
    correlator: Correlator,
    router: Router,
    events: EventSink,
    pong: Notify,
    timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(
        label: impl Into<String>,
        link: Box<dyn Link>,
        router: Router,
        events: EventSink,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            link,
            correlator: Correlator::new(),
            router,
            events,
            pong: Notify::new(),
            timeout,
            reader: Mutex::new(None),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn is_alive(&self) -> bool {
        self.link.is_alive()
    }

    pub fn in_flight(&self) -> usize {
        self.correlator.in_flight()
    }

    pub(crate) fn set_reader(&self, handle: JoinHandle<()>) {
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Register a handler the remote side can call.
    pub fn route<F, Fut>(&self, path: impl Into<String>, handler: F)
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Value>> + Send + 'static,
    {
        self.router.route(path, handler);
    }

    /// Call `path` on the remote side.
    ///
    /// Resolves to `None` right away when the peer is down, or after the
    /// timeout when it never answers. A `null` answer is also `None`.
    pub async fn fetch(
        &self,
        path: &str,
        params: Option<Value>,
        body: Option<Value>,
    ) -> Option<Value> {
        self.fetch_within(path, params, body, self.timeout).await
    }

    pub async fn fetch_within(
        &self,
        path: &str,
        params: Option<Value>,
        body: Option<Value>,
        timeout: Duration,
    ) -> Option<Value> {
        if !self.link.is_alive() {
            trace!(peer = %self.label, path, "Peer down, skipping fetch");
            return None;
        }

        let (session, answer) = self.correlator.register();
        let request = Message::Request(RpcRequest {
            path: path.to_string(),
            session: session.clone(),
            params,
            body,
        });

        if !self.link.send(&request) {
            self.correlator.cancel(&session);
            return None;
        }
        debug!(peer = %self.label, path, session = %session, "Request sent");

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(Value::Null)) => None,
            Ok(Ok(data)) => Some(data),
            Ok(Err(_)) => {
                debug!(peer = %self.label, path, "Peer went away before answering");
                None
            }
            Err(_) => {
                self.correlator.cancel(&session);
                warn!(peer = %self.label, path, "Request timed out after {:?}", timeout);
                None
            }
        }
    }

    /// Fire-and-forget event; `true` if the peer was reachable when queued.
    pub fn emit(&self, event: WorkerEvent) -> bool {
        self.link.is_alive() && self.link.send(&Message::Event(event))
    }

    /// Send `ping` and wait for `pong`.
    pub async fn ping(&self, wait: Duration) -> bool {
        // only a pong that arrives after this point counts
        let pong = self.pong.notified();
        if !self.link.send(&Message::Ping) {
            return false;
        }
        tokio::time::timeout(wait, pong).await.is_ok()
    }

    /// Entry point for every inbound frame.
    pub(crate) fn handle_frame(self: &Arc<Self>, frame: &str) {
        let Some(message) = Message::decode(frame) else {
            trace!(peer = %self.label, "Dropping malformed frame");
            return;
        };

        match message {
            Message::Request(req) => {
                let peer = Arc::clone(self);
                tokio::spawn(async move {
                    let session = req.session.clone();
                    trace!(peer = %peer.label, path = %req.path, "Handling request");
                    let data = peer.router.dispatch(req).await;
                    peer.link
                        .send(&Message::Response(RpcResponse { session, data }));
                });
            }
            Message::Response(resp) => {
                self.correlator.complete(&resp.session, resp.data);
            }
            Message::Ping => {
                self.link.send(&Message::Pong);
            }
            Message::Pong => self.pong.notify_waiters(),
            Message::Event(event) => (self.events)(event),
        }
    }

    /// Called by the reader once the inbound side is gone.
    pub(crate) fn disconnected(&self) {
        debug!(peer = %self.label, "Channel closed");
        self.link.close();
        self.correlator.clear();
    }

    /// Tear the channel down from this side.
    pub fn close(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
        self.disconnected();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::rpc::channel::{spawn_reader, LineWriter};
    use serde_json::json;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    struct TestLink(LineWriter);

    impl Link for TestLink {
        fn is_alive(&self) -> bool {
            !self.0.is_closed()
        }
        fn send(&self, message: &Message) -> bool {
            self.0.send(message)
        }
        fn close(&self) {
            self.0.close()
        }
    }

    fn peer_on(stream: UnixStream, router: Router, timeout: Duration) -> Arc<Peer> {
        let (read, write) = stream.into_split();
        let link = TestLink(LineWriter::spawn(write, "test".into()));
        let peer = Peer::new("test", Box::new(link), router, discard_events(), timeout);
        peer.set_reader(spawn_reader(read, Arc::clone(&peer)));
        peer
    }

    #[tokio::test]
    async fn fetch_reaches_remote_route() {
        let (a, b) = UnixStream::pair().unwrap();
        let remote_router = Router::new();
        remote_router.route("status:get", |_| async { Some(json!({"running": true})) });

        let hub = peer_on(a, Router::new(), DEFAULT_TIMEOUT);
        let _worker = peer_on(b, remote_router, DEFAULT_TIMEOUT);

        let answer = hub.fetch("status:get", None, None).await;
        assert_eq!(answer, Some(json!({"running": true})));
        assert_eq!(hub.fetch("no:such:route", None, None).await, None);
        assert_eq!(hub.in_flight(), 0);
    }

    #[tokio::test]
    async fn responses_are_matched_by_session_not_order() {
        let (a, b) = UnixStream::pair().unwrap();
        let hub = peer_on(a, Router::new(), DEFAULT_TIMEOUT);

        // hand-rolled remote that answers the two requests in reverse order
        let remote = tokio::spawn(async move {
            let (read, mut write) = b.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut requests = Vec::new();
            while requests.len() < 2 {
                let line = lines.next_line().await.unwrap().unwrap();
                if let Some(Message::Request(req)) = Message::decode(&line) {
                    requests.push(req);
                }
            }
            for req in requests.into_iter().rev() {
                let reply = Message::Response(RpcResponse {
                    session: req.session,
                    data: json!(format!("answer for {}", req.path)),
                });
                write.write_all(reply.encode().unwrap().as_bytes()).await.unwrap();
            }
            write
        });

        let (first, second) = tokio::join!(
            hub.fetch("first:call", None, None),
            hub.fetch("second:call", None, None)
        );
        assert_eq!(first, Some(json!("answer for first:call")));
        assert_eq!(second, Some(json!("answer for second:call")));
        drop(remote.await.unwrap());
    }

    #[tokio::test]
    async fn silent_peer_times_out_not_earlier() {
        let (a, _b) = UnixStream::pair().unwrap();
        let timeout = Duration::from_millis(300);
        let hub = peer_on(a, Router::new(), timeout);

        let started = Instant::now();
        assert_eq!(hub.fetch("status:get", None, None).await, None);
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout, "resolved after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_secs(2));
        assert_eq!(hub.in_flight(), 0);
    }

    #[tokio::test]
    async fn dead_peer_resolves_immediately() {
        let (a, b) = UnixStream::pair().unwrap();
        let hub = peer_on(a, Router::new(), DEFAULT_TIMEOUT);
        drop(b);

        // give the reader a moment to observe EOF
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!hub.is_alive());

        let started = Instant::now();
        assert_eq!(hub.fetch("status:get", None, None).await, None);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!hub.emit(WorkerEvent::Other {
            event: "x".into(),
            data: json!(null)
        }));
    }

    #[tokio::test]
    async fn stray_pong_does_not_answer_a_later_ping() {
        let (a, b) = UnixStream::pair().unwrap();
        let hub = peer_on(a, Router::new(), DEFAULT_TIMEOUT);

        // a raw remote that sends one unsolicited pong and never answers pings
        let (_read, mut write) = b.into_split();
        write
            .write_all(Message::Pong.encode().unwrap().as_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!hub.ping(Duration::from_millis(200)).await);
        assert!(hub.is_alive());
    }

    #[tokio::test]
    async fn ping_pong_and_events() {
        let (a, b) = UnixStream::pair().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });

        let hub = {
            let (read, write) = a.into_split();
            let link = TestLink(LineWriter::spawn(write, "hub".into()));
            let peer = Peer::new("hub", Box::new(link), Router::new(), sink, DEFAULT_TIMEOUT);
            peer.set_reader(spawn_reader(read, Arc::clone(&peer)));
            peer
        };
        let worker = peer_on(b, Router::new(), DEFAULT_TIMEOUT);

        assert!(hub.ping(Duration::from_secs(2)).await);

        let event = WorkerEvent::Other {
            event: "plugin:install".into(),
            data: json!({"step": 1}),
        };
        assert!(worker.emit(event.clone()));
        assert_eq!(rx.recv().await, Some(event));
    }
}
