//! One connection's serve loop.
//!
//! A [`ServeConn`] owns one accepted socket and runs three cooperating
//! activities: a reader task (demultiplexing frames into the stream table
//! and posting opening frames), a writer task (serializing outbound
//! frames), and the dispatcher (invoking handlers for opening frames).
//! All three share one cancellation token; teardown is gated exactly once
//! by the server-side untrack.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::MuxwireError;
use crate::handler::RequestFrame;
use crate::protocol::Frame;
use crate::reader::FrameReader;
use crate::server::binding::ServerStream;
use crate::server::ServerInner;
use crate::stream::{ConnStreams, Stream};
use crate::writer::{spawn_writer_task, FrameWriter, WriteFrameRequest, WRITE_CH_SIZE};

/// Identity and addressing info for one connection.
pub struct ConnectionInfo {
    idx: usize,
    remote_addr: Option<SocketAddr>,
    id: RwLock<String>,
}

impl ConnectionInfo {
    fn new(idx: usize, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            idx,
            remote_addr,
            id: RwLock::new(String::new()),
        }
    }

    /// Index of the binding the connection was accepted on.
    pub fn binding_index(&self) -> usize {
        self.idx
    }

    /// Peer address, when the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The bound identity; empty until [`RequestFrame::bind_id`] succeeds.
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: &str) {
        *self.id.write() = id.to_string();
    }
}

/// Server side of one accepted connection.
pub struct ServeConn {
    pub(crate) conn_id: u64,
    pub(crate) idx: usize,
    server: Arc<ServerInner>,
    info: Arc<ConnectionInfo>,
    streams: Arc<ConnStreams>,
    write_tx: mpsc::Sender<WriteFrameRequest>,
    write_rx: Mutex<Option<mpsc::Receiver<WriteFrameRequest>>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) untracked: AtomicBool,
    untracked_tx: watch::Sender<bool>,
    rw_done_tx: watch::Sender<bool>,
}

impl ServeConn {
    pub(crate) fn new(
        server: Arc<ServerInner>,
        idx: usize,
        conn_id: u64,
        remote_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(WRITE_CH_SIZE);
        let (untracked_tx, _) = watch::channel(false);
        let (rw_done_tx, _) = watch::channel(false);
        Arc::new(Self {
            conn_id,
            idx,
            server,
            info: Arc::new(ConnectionInfo::new(idx, remote_addr)),
            streams: Arc::new(ConnStreams::new()),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            cancel,
            untracked: AtomicBool::new(false),
            untracked_tx,
            rw_done_tx,
        })
    }

    /// Info about this connection.
    pub fn info(&self) -> Arc<ConnectionInfo> {
        self.info.clone()
    }

    pub(crate) fn streams(&self) -> &Arc<ConnStreams> {
        &self.streams
    }

    /// A fresh frame writer funneling into this connection's writer task.
    pub(crate) fn writer(&self) -> FrameWriter {
        FrameWriter::new(self.write_tx.clone(), self.streams.clone())
    }

    pub(crate) async fn bind_id(self: &Arc<Self>, id: &str) -> (bool, u64) {
        self.server.bind_id(self, id).await
    }

    pub(crate) fn untracked_rx(&self) -> watch::Receiver<bool> {
        self.untracked_tx.subscribe()
    }

    pub(crate) fn mark_untracked(&self) {
        let _ = self.untracked_tx.send(true);
    }

    /// Run the connection: reader task, writer task, and the dispatcher
    /// loop. Returns once the connection is fully torn down.
    ///
    /// `_drain_guard` keeps the server's shutdown drain open while the
    /// serve task (and any inline handler) is still running.
    pub(crate) async fn serve(
        self: Arc<Self>,
        stream: Box<dyn ServerStream>,
        _drain_guard: mpsc::Sender<()>,
    ) {
        let binding = &self.server.bindings[self.idx];
        let (read_half, write_half) = tokio::io::split(stream);

        let write_rx = self
            .write_rx
            .lock()
            .take()
            .expect("muxwire: serve called twice on one connection");
        let writer_task = spawn_writer_task(write_half, write_rx, self.cancel.clone());

        let ch_size = binding.read_frame_ch_size.max(1);
        let (read_tx, mut read_rx) = mpsc::channel(ch_size);
        let reader_task = tokio::spawn(read_loop(
            read_half,
            read_tx,
            self.streams.clone(),
            self.cancel.clone(),
            binding.max_frame_size,
            binding.default_read_timeout,
        ));

        // Both socket halves are dropped once these two tasks end, which
        // is the moment the socket is actually closed; close_untracked
        // waits on this signal rather than on handler completion.
        let rw_done_tx = self.rw_done_tx.clone();
        tokio::spawn(async move {
            let _ = reader_task.await;
            let _ = writer_task.await;
            let _ = rw_done_tx.send(true);
        });

        let handler = binding.handler.clone();
        loop {
            let (frame, stream) = tokio::select! {
                biased;
                next = read_rx.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let request = RequestFrame::new(frame, stream, self.clone());
            // Inline dispatch: per-stream ordering is preserved and a
            // running handler is never forcibly cancelled.
            handler.serve(self.writer(), request).await;
        }

        self.cancel.cancel();
        self.server.untrack(&self, false).await;
        self.wait_rw_done().await;
        self.streams.release_all();
        debug!(conn_id = self.conn_id, "connection torn down");
    }

    /// Close the socket, wait for the reader and writer to terminate, and
    /// drain the stream table (every stream transitions to `Closed`).
    ///
    /// The dispatcher is deliberately not awaited here: handlers are never
    /// forcibly cancelled, and a preemptor must not block on the victim's
    /// in-flight handler. The serve task still awaits its own dispatcher
    /// before releasing the shutdown drain.
    ///
    /// Safe to call from any path; the once-only untrack gate makes the
    /// surrounding teardown idempotent.
    pub(crate) async fn close_untracked(&self) {
        self.cancel.cancel();
        self.wait_rw_done().await;
        self.streams.release_all();
    }

    async fn wait_rw_done(&self) {
        let mut rx = self.rw_done_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Reader activity: demultiplex frames until error or cancellation, then
/// reset every open stream and cancel the connection.
async fn read_loop(
    read_half: tokio::io::ReadHalf<Box<dyn ServerStream>>,
    tx: mpsc::Sender<(Frame, Arc<Stream>)>,
    streams: Arc<ConnStreams>,
    cancel: CancellationToken,
    max_frame_size: u32,
    read_timeout: Option<Duration>,
) {
    let mut reader = FrameReader::with_read_timeout(read_half, max_frame_size, read_timeout);
    loop {
        let result = tokio::select! {
            biased;
            res = reader.read_request(&streams) => res,
            _ = cancel.cancelled() => break,
        };
        match result {
            Ok(request) => {
                if tx.send(request).await.is_err() {
                    break;
                }
            }
            Err(MuxwireError::ConnectionClosed) => {
                debug!("peer closed connection");
                break;
            }
            Err(e) => {
                error!("read frames failed: {}", e);
                break;
            }
        }
    }
    streams.reset_all();
    cancel.cancel();
}
