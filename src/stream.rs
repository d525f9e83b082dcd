//! Per-connection streams and the stream table.
//!
//! A [`Stream`] is the state machine for one `(connection, request_id)`:
//! it is created on the first frame carrying that id, bound to a handler
//! consumer exactly once, fed continuation frames in wire order, and torn
//! down by end-of-stream, reset or connection teardown.
//!
//! [`ConnStreams`] is the per-connection table mapping request ids to
//! streams, split into peer-initiated and push-initiated halves so a push
//! from this side never collides with a peer request using the same id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::protocol::{Frame, FrameFlags};

/// Lifecycle of a stream. Transitions are monotonic toward `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Created on first frame; may receive more frames.
    Open,
    /// `STREAM_END` seen; no more inbound.
    HalfClosed,
    /// Peer or local side reset the stream.
    Reset,
    /// Terminal; the stream is being removed from the table.
    Closed,
}

struct StreamInner {
    state: StreamState,
    /// Sender feeding the handler's inbound queue. Dropped on half-close,
    /// reset and close so a blocked consumer wakes with `None`.
    in_tx: Option<mpsc::UnboundedSender<Frame>>,
    /// Receiver side, taken once by the request frame.
    in_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    /// Sticky reset marker; stays set through `Closed`.
    reset: bool,
}

/// State machine for one request stream on one connection.
pub struct Stream {
    request_id: u64,
    flags: FrameFlags,
    bound: AtomicBool,
    inner: Mutex<StreamInner>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Stream {
    fn new(request_id: u64, flags: FrameFlags) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let (state, in_tx, in_rx) = if flags.is_stream() {
            let (tx, rx) = mpsc::unbounded_channel();
            (StreamState::Open, Some(tx), Some(rx))
        } else {
            // Single-frame request: created and half-closed in one step.
            let (_, rx) = mpsc::unbounded_channel();
            (StreamState::HalfClosed, None, Some(rx))
        };
        Self {
            request_id,
            flags,
            bound: AtomicBool::new(false),
            inner: Mutex::new(StreamInner {
                state,
                in_tx,
                in_rx,
                reset: false,
            }),
            done_tx,
            done_rx,
        }
    }

    /// Request id this stream carries.
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Flags the stream was created with.
    #[inline]
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Try to make `frame` the opening frame of this stream.
    ///
    /// At-most-once: the first caller wins and should deliver the frame as a
    /// new request; later callers get `false` and must treat the frame as a
    /// continuation instead.
    pub fn try_bind(&self, frame: &Frame) -> bool {
        if self.bound.swap(true, Ordering::AcqRel) {
            return false;
        }
        if frame.is_done() && frame.is_stream() {
            // Opened and ended by the same frame.
            self.half_close_in();
        }
        true
    }

    /// Enqueue a continuation frame onto the inbound queue.
    ///
    /// Returns `false` once the stream no longer accepts inbound frames
    /// (half-closed, reset or closed); the caller then waits on [`done`]
    /// and drops the frame.
    ///
    /// [`done`]: Stream::done
    pub fn add_in_frame(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Open {
            return false;
        }
        let ends = frame.is_stream_end();
        let Some(tx) = &inner.in_tx else {
            return false;
        };
        if tx.send(frame).is_err() {
            return false;
        }
        if ends {
            inner.state = StreamState::HalfClosed;
            inner.in_tx = None;
        }
        true
    }

    /// Peer sent `RST` for this stream. Idempotent.
    ///
    /// Blocked consumers wake with the reset sentinel (their pull yields
    /// `None` after any already-queued frames, and [`is_reset`] is true).
    ///
    /// [`is_reset`]: Stream::is_reset
    pub fn reset_by_peer(&self) {
        self.reset_inner();
    }

    /// Locally originated reset (writer side). Idempotent.
    pub(crate) fn reset_local(&self) {
        self.reset_inner();
    }

    fn reset_inner(&self) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, StreamState::Reset | StreamState::Closed) {
                return;
            }
            inner.state = StreamState::Reset;
            inner.reset = true;
            inner.in_tx = None;
        }
        let _ = self.done_tx.send(true);
    }

    /// Terminal transition; the stream stops accepting anything.
    pub(crate) fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == StreamState::Closed {
                return;
            }
            inner.state = StreamState::Closed;
            inner.in_tx = None;
        }
        let _ = self.done_tx.send(true);
    }

    fn half_close_in(&self) {
        let mut inner = self.inner.lock();
        if inner.state == StreamState::Open {
            inner.state = StreamState::HalfClosed;
            inner.in_tx = None;
        }
    }

    /// Whether the stream was reset (by either side).
    pub fn is_reset(&self) -> bool {
        self.inner.lock().reset
    }

    /// Whether the stream reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == StreamState::Closed
    }

    /// Wait until the stream reaches `Reset` or `Closed`.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Take the inbound queue receiver; only the first caller gets it.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.inner.lock().in_rx.take()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Stream")
            .field("request_id", &self.request_id)
            .field("state", &inner.state)
            .field("reset", &inner.reset)
            .finish()
    }
}

/// Per-connection stream table: `request_id -> Stream`.
///
/// Peer-initiated and push-initiated streams live in separate tables,
/// selected by the `PUSH` flag.
#[derive(Default)]
pub struct ConnStreams {
    streams: DashMap<u64, Arc<Stream>>,
    push_streams: DashMap<u64, Arc<Stream>>,
}

impl ConnStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, flags: FrameFlags) -> &DashMap<u64, Arc<Stream>> {
        if flags.is_push() {
            &self.push_streams
        } else {
            &self.streams
        }
    }

    /// Get the stream for `request_id`, creating it if absent.
    ///
    /// Returns `(stream, loaded)` where `loaded` is true when the stream
    /// already existed. Idempotent for the same id while the stream exists.
    pub fn create_or_get(&self, request_id: u64, flags: FrameFlags) -> (Arc<Stream>, bool) {
        match self.table(flags).entry(request_id) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), true),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let stream = Arc::new(Stream::new(request_id, flags));
                v.insert(stream.clone());
                (stream, false)
            }
        }
    }

    /// Look up the stream for `request_id`, if any.
    pub fn get(&self, request_id: u64, flags: FrameFlags) -> Option<Arc<Stream>> {
        self.table(flags).get(&request_id).map(|s| s.clone())
    }

    /// Close the stream and drop it from the table.
    pub fn release(&self, request_id: u64, flags: FrameFlags) {
        if let Some((_, stream)) = self.table(flags).remove(&request_id) {
            stream.close();
        }
    }

    /// Record a locally allocated push id so `reset_frame` recognises it.
    pub(crate) fn register_push(&self, request_id: u64) -> Arc<Stream> {
        let (stream, _) = self.create_or_get(request_id, FrameFlags::PUSH);
        stream
    }

    /// Reset every live stream; used when the transport fails.
    pub(crate) fn reset_all(&self) {
        for entry in self.streams.iter() {
            entry.value().reset_by_peer();
        }
        for entry in self.push_streams.iter() {
            entry.value().reset_by_peer();
        }
    }

    /// Close every stream and empty both tables; used on final teardown.
    pub(crate) fn release_all(&self) {
        for entry in self.streams.iter() {
            entry.value().close();
        }
        for entry in self.push_streams.iter() {
            entry.value().close();
        }
        self.streams.clear();
        self.push_streams.clear();
    }

    /// Number of live streams across both tables.
    pub fn active_count(&self) -> usize {
        self.streams.len() + self.push_streams.len()
    }
}
