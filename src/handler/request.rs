//! Request frames as seen by handlers.
//!
//! A [`RequestFrame`] is the frame that opened a request stream, plus a
//! handle on that stream: handlers pull continuation frames from it, detect
//! peer reset, and release the stream when done. Dropping the request frame
//! releases the stream, so a handler that simply returns cleans up after
//! itself.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::server::{ConnectionInfo, ServeConn};
use crate::stream::Stream;

/// The first frame of a request, bound to its stream and connection.
pub struct RequestFrame {
    frame: Frame,
    stream: Arc<Stream>,
    rx: Option<mpsc::UnboundedReceiver<Frame>>,
    conn: Arc<ServeConn>,
    released: bool,
}

impl RequestFrame {
    pub(crate) fn new(frame: Frame, stream: Arc<Stream>, conn: Arc<ServeConn>) -> Self {
        let rx = stream.take_receiver();
        Self {
            frame,
            stream,
            rx,
            conn,
            released: false,
        }
    }

    /// The opening frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Pull the next continuation frame, in wire order.
    ///
    /// Returns `None` once the stream ended or was reset; use
    /// [`is_reset`] to tell the two apart.
    ///
    /// [`is_reset`]: RequestFrame::is_reset
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.as_mut()?.recv().await
    }

    /// Whether the peer (or the local side) reset this stream.
    pub fn is_reset(&self) -> bool {
        self.stream.is_reset()
    }

    /// Release the stream, allowing the request id to be reused.
    ///
    /// Dropping the request frame has the same effect.
    pub fn close(mut self) {
        self.release();
    }

    /// Bind `id` exclusively to this request's connection, preempting any
    /// previous holder ("kick"). Returns whether a holder was kicked and
    /// the process-wide kick order.
    pub async fn bind_id(&self, id: &str) -> (bool, u64) {
        self.conn.bind_id(id).await
    }

    /// Info about the connection this request arrived on.
    pub fn connection_info(&self) -> Arc<ConnectionInfo> {
        self.conn.info()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.conn
                .streams()
                .release(self.stream.request_id(), self.stream.flags());
        }
    }
}

impl Deref for RequestFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for RequestFrame {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFrame")
            .field("frame", &self.frame)
            .field("released", &self.released)
            .finish()
    }
}
