//! Newline-delimited frame plumbing shared by both bindings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::envelope::Message;
use super::peer::Peer;

/// Upper bound for a single frame; longer lines are discarded.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Frames queued for a peer before further sends are refused.
pub const WRITE_QUEUE_FRAMES: usize = 1024;

/// Queue feeding a background task that owns the write half.
///
/// `send` never waits on the socket, so a slow or dead peer cannot stall
/// the caller. A peer that stops reading fills the queue and loses frames.
pub struct LineWriter {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    closed: Arc<AtomicBool>,
}

impl LineWriter {
    pub fn spawn<W>(writer: W, label: String) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_capacity(writer, label, WRITE_QUEUE_FRAMES)
    }

    pub fn with_capacity<W>(mut writer: W, label: String, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let written = async {
                    writer.write_all(frame.as_bytes()).await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    debug!(peer = %label, "Write failed, closing channel: {}", e);
                    break;
                }
            }
            flag.store(true, Ordering::SeqCst);
            let _ = writer.shutdown().await;
            trace!(peer = %label, "Writer finished");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            closed,
        }
    }

    pub fn send(&self, message: &Message) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Failed to encode frame: {}", e);
                return false;
            }
        };

        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Peer is not reading, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting frames; the writer task drains what is queued and exits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Feed every frame from `reader` into `peer` until EOF or a read error.
///
/// At most [`MAX_FRAME_BYTES`] of a line are buffered; the rest of an
/// oversized line is skipped up to its newline.
pub async fn read_frames<R>(reader: R, peer: &Arc<Peer>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();
    let mut oversized = false;

    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(peer = %peer.label(), "Read failed: {}", e);
                break;
            }
        };

        let newline = chunk.iter().position(|&b| b == b'\n');
        let used = newline.map_or(chunk.len(), |i| i + 1);
        if !oversized {
            frame.extend_from_slice(&chunk[..used]);
            if frame.len() > MAX_FRAME_BYTES {
                debug!(peer = %peer.label(), "Dropping oversized frame");
                oversized = true;
                frame = Vec::new();
            }
        }
        reader.consume(used);

        if newline.is_some() {
            if !oversized {
                dispatch(&frame, peer);
            }
            oversized = false;
            frame.clear();
        }
    }

    peer.disconnected();
}

fn dispatch(frame: &[u8], peer: &Arc<Peer>) {
    match std::str::from_utf8(frame) {
        Ok(frame) if !frame.trim().is_empty() => peer.handle_frame(frame),
        Ok(_) => {}
        Err(_) => trace!(peer = %peer.label(), "Dropping non UTF-8 frame"),
    }
}

pub fn spawn_reader<R>(reader: R, peer: Arc<Peer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move { read_frames(reader, &peer).await })
}
