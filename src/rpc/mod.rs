//! Inter-process RPC: request/response calls and fire-and-forget events
//! multiplexed over one bidirectional channel.
//!
//! ```text
//!  caller ── fetch(path) ──► Peer ── Link ──► frames ──► Peer ── Router ──► handler
//!     ▲                       │                              │
//!     └──── answer by session ◄──────────── response ◄───────┘
//! ```
//!
//! Two bindings provide the [`Link`]: a socketpair inherited by workers the
//! hub forks itself ([`forked`], unix only) and a local socket for processes
//! started independently ([`socket`]). Correlation, routing and event
//! delivery live in [`Peer`] and are shared by both.

pub mod channel;
pub mod envelope;
#[cfg(unix)]
pub mod forked;
pub mod peer;
pub mod router;
pub mod session;
pub mod socket;

pub use envelope::{
    AccessoryChange, Envelope, LogLevel, LogLine, Message, Notification, Progress, RpcRequest,
    RpcResponse, WorkerEvent,
};
pub use peer::{discard_events, EventSink, Link, Peer, DEFAULT_TIMEOUT};
pub use router::Router;
pub use socket::{SocketServer, HUB_SOCKET};
