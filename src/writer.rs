//! Dedicated writer task and the frame writer handle.
//!
//! Each connection owns one writer task fed through an mpsc channel. Every
//! submitted frame carries a oneshot acknowledgment that resolves once the
//! frame reached the socket (or the write failed), which is what makes
//! [`FrameWriter::end_write`] block until scheduled. Because a single task
//! drains the queue and writes whole frames, frames from concurrent writers
//! never interleave on the wire.
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<WriteFrameRequest> ─► Writer Task ─► Socket
//! Handler N ─┘            (ack: oneshot)
//! ```

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MuxwireError, Result};
use crate::protocol::{Cmd, Frame, FrameFlags, Header, HEADER_SIZE};
use crate::stream::ConnStreams;

/// Capacity of the per-connection write queue.
pub(crate) const WRITE_CH_SIZE: usize = 128;

/// Maximum frames coalesced before one flush.
const MAX_BATCH_SIZE: usize = 64;

/// A fully encoded frame queued for the writer task.
pub(crate) struct WriteFrameRequest {
    /// Complete on-wire bytes (header + payload).
    pub bytes: Bytes,
    /// Resolved once the frame was written or the write failed.
    pub ack: oneshot::Sender<Result<()>>,
}

/// Spawn the writer task for one connection.
///
/// The task exits when the channel closes or `cancel` fires; either way it
/// fails all still-queued requests with `WriteAfterCloseSelf` and cancels
/// the token so the rest of the connection tears down.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    rx: mpsc::Receiver<WriteFrameRequest>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(writer_loop(writer, rx, cancel))
}

async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriteFrameRequest>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    'outer: loop {
        let first = tokio::select! {
            biased;
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        // Collect additional ready frames without blocking.
        let mut batch = Vec::with_capacity(8);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }

        let mut pending_acks = Vec::with_capacity(batch.len());
        let mut iter = batch.into_iter();
        let mut write_failed = false;
        while let Some(req) = iter.next() {
            match writer.write_all(&req.bytes).await {
                Ok(()) => pending_acks.push(req.ack),
                Err(e) => {
                    debug!("frame write failed: {}", e);
                    let _ = req.ack.send(Err(MuxwireError::Io(e)));
                    write_failed = true;
                    break;
                }
            }
        }
        if write_failed {
            for ack in pending_acks {
                let _ = ack.send(Err(MuxwireError::WriteAfterCloseSelf));
            }
            for rest in iter {
                let _ = rest.ack.send(Err(MuxwireError::WriteAfterCloseSelf));
            }
            break 'outer;
        }

        match writer.flush().await {
            Ok(()) => {
                for ack in pending_acks {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                debug!("frame flush failed: {}", e);
                let mut err = Some(MuxwireError::Io(e));
                for ack in pending_acks {
                    let _ = ack.send(Err(err
                        .take()
                        .unwrap_or(MuxwireError::WriteAfterCloseSelf)));
                }
                break;
            }
        }
    }

    // Teardown: every pending and future request observes close-self.
    rx.close();
    while let Some(req) = rx.recv().await {
        let _ = req.ack.send(Err(MuxwireError::WriteAfterCloseSelf));
    }
    cancel.cancel();
}

/// Handle for composing and submitting frames on one connection.
///
/// Cheaply cloneable; every handler invocation, kick callback and
/// connection walk gets its own instance while all of them funnel into the
/// connection's single writer task.
pub struct FrameWriter {
    tx: mpsc::Sender<WriteFrameRequest>,
    streams: Arc<ConnStreams>,
    header: Option<(u64, Cmd, FrameFlags)>,
    wbuf: BytesMut,
}

impl FrameWriter {
    pub(crate) fn new(tx: mpsc::Sender<WriteFrameRequest>, streams: Arc<ConnStreams>) -> Self {
        Self {
            tx,
            streams,
            header: None,
            wbuf: BytesMut::new(),
        }
    }

    /// Begin composing a frame; header fields are captured here.
    pub fn start_write(&mut self, request_id: u64, cmd: Cmd, flags: FrameFlags) {
        self.header = Some((request_id, cmd, flags));
        self.wbuf.clear();
    }

    /// Append payload bytes. `v` is copied so callers may reuse the buffer.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.wbuf.extend_from_slice(v);
    }

    /// Submit the composed frame and block until it was written out
    /// (or the writer reported an error).
    ///
    /// # Panics
    ///
    /// Panics when called without a preceding [`start_write`]; that is a
    /// programming error, like a duplicate handler registration.
    ///
    /// [`start_write`]: FrameWriter::start_write
    pub async fn end_write(&mut self) -> Result<()> {
        let (request_id, cmd, flags) = self
            .header
            .take()
            .expect("muxwire: end_write without start_write");

        if flags.is_push() {
            // Track the push id so reset_frame recognises it as open.
            self.streams.register_push(request_id);
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.wbuf.len());
        buf.put_slice(&Header::new(request_id, cmd, flags, self.wbuf.len() as u32).encode());
        buf.put_slice(&self.wbuf);
        self.wbuf.clear();

        self.submit(buf.freeze()).await
    }

    /// Submit an `RST` frame for `request_id`.
    ///
    /// The local stream transitions immediately, without waiting for the
    /// peer. Fails with `RstNonExistingStream` when no local stream is open
    /// (locally allocated push ids count as open).
    pub async fn reset_frame(&mut self, request_id: u64, reason: Cmd) -> Result<()> {
        let mut flags = FrameFlags::RST;
        if let Some(stream) = self.streams.get(request_id, FrameFlags::empty()) {
            stream.reset_local();
        } else if let Some(stream) = self.streams.get(request_id, FrameFlags::PUSH) {
            flags |= FrameFlags::PUSH;
            stream.reset_local();
        } else {
            return Err(MuxwireError::RstNonExistingStream);
        }

        let frame = Frame::new(request_id, reason, flags, Bytes::new());
        self.submit(frame.encode()).await
    }

    async fn submit(&self, bytes: Bytes) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteFrameRequest {
                bytes,
                ack: ack_tx,
            })
            .await
            .map_err(|_| MuxwireError::WriteAfterCloseSelf)?;
        ack_rx.await.map_err(|_| MuxwireError::WriteAfterCloseSelf)?
    }
}

impl Clone for FrameWriter {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            streams: self.streams.clone(),
            header: None,
            wbuf: BytesMut::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    use crate::protocol::FrameBuffer;

    fn writer_pair(
        buf_size: usize,
    ) -> (
        FrameWriter,
        tokio::io::DuplexStream,
        CancellationToken,
        JoinHandle<()>,
    ) {
        let (local, remote) = duplex(buf_size);
        let (tx, rx) = mpsc::channel(WRITE_CH_SIZE);
        let cancel = CancellationToken::new();
        let task = spawn_writer_task(local, rx, cancel.clone());
        let writer = FrameWriter::new(tx, Arc::new(ConnStreams::new()));
        (writer, remote, cancel, task)
    }

    async fn read_one_frame(remote: &mut tokio::io::DuplexStream) -> Frame {
        let mut buffer = FrameBuffer::new();
        let mut scratch = [0u8; 1024];
        loop {
            if let Some(frame) = buffer.next_frame().unwrap() {
                return frame;
            }
            let n = remote.read(&mut scratch).await.unwrap();
            assert_ne!(n, 0, "remote closed before a full frame arrived");
            buffer.extend(&scratch[..n]);
        }
    }

    #[tokio::test]
    async fn test_end_write_blocks_until_written() {
        let (mut writer, mut remote, _cancel, _task) = writer_pair(4096);

        writer.start_write(1, Cmd(2), FrameFlags::empty());
        writer.write_bytes(b"\xAB\xCD");
        writer.end_write().await.unwrap();

        let frame = read_one_frame(&mut remote).await;
        assert_eq!(frame.request_id, 1);
        assert_eq!(frame.cmd, Cmd(2));
        assert_eq!(frame.payload(), b"\xAB\xCD");
    }

    #[tokio::test]
    async fn test_write_bytes_copies_input() {
        let (mut writer, mut remote, _cancel, _task) = writer_pair(4096);

        let mut scratch = b"hello".to_vec();
        writer.start_write(1, Cmd(1), FrameFlags::empty());
        writer.write_bytes(&scratch);
        scratch.fill(0);
        writer.end_write().await.unwrap();

        let frame = read_one_frame(&mut remote).await;
        assert_eq!(frame.payload(), b"hello");
    }

    #[tokio::test]
    async fn test_frames_emitted_in_submission_order() {
        let (mut writer, mut remote, _cancel, _task) = writer_pair(1 << 16);

        for i in 0u64..20 {
            writer.start_write(i, Cmd(1), FrameFlags::empty());
            writer.write_bytes(&i.to_be_bytes());
            writer.end_write().await.unwrap();
        }

        for i in 0u64..20 {
            let frame = read_one_frame(&mut remote).await;
            assert_eq!(frame.request_id, i);
            assert_eq!(frame.payload(), &i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_end_write_after_cancel_fails() {
        let (mut writer, _remote, cancel, task) = writer_pair(4096);

        cancel.cancel();
        task.await.unwrap();

        writer.start_write(1, Cmd(1), FrameFlags::empty());
        let result = writer.end_write().await;
        assert!(matches!(result, Err(MuxwireError::WriteAfterCloseSelf)));
    }

    #[tokio::test]
    async fn test_reset_frame_unknown_stream() {
        let (mut writer, _remote, _cancel, _task) = writer_pair(4096);

        let result = writer.reset_frame(42, Cmd(0)).await;
        assert!(matches!(result, Err(MuxwireError::RstNonExistingStream)));
    }

    #[tokio::test]
    async fn test_reset_frame_emits_rst_and_resets_locally() {
        let (local, mut remote) = duplex(4096);
        let (tx, rx) = mpsc::channel(WRITE_CH_SIZE);
        let cancel = CancellationToken::new();
        let _task = spawn_writer_task(local, rx, cancel.clone());

        let streams = Arc::new(ConnStreams::new());
        let (stream, _) = streams.create_or_get(7, FrameFlags::STREAM);
        let mut writer = FrameWriter::new(tx, streams);

        writer.reset_frame(7, Cmd(3)).await.unwrap();

        let frame = read_one_frame(&mut remote).await;
        assert!(frame.is_rst());
        assert_eq!(frame.request_id, 7);
        assert_eq!(frame.cmd, Cmd(3));
        assert!(stream.is_reset());
    }

    #[tokio::test]
    async fn test_reset_frame_for_push_id() {
        let (local, mut remote) = duplex(4096);
        let (tx, rx) = mpsc::channel(WRITE_CH_SIZE);
        let cancel = CancellationToken::new();
        let _task = spawn_writer_task(local, rx, cancel.clone());

        let streams = Arc::new(ConnStreams::new());
        let mut writer = FrameWriter::new(tx, streams);

        // A push write allocates the id locally.
        writer.start_write(1001, Cmd(9), FrameFlags::PUSH);
        writer.write_bytes(b"push");
        writer.end_write().await.unwrap();
        let _ = read_one_frame(&mut remote).await;

        writer.reset_frame(1001, Cmd(0)).await.unwrap();
        let rst = read_one_frame(&mut remote).await;
        assert!(rst.is_rst());
        assert!(rst.is_push());
    }

    #[tokio::test]
    async fn test_writer_fails_queue_on_io_error() {
        let (local, remote) = duplex(64);
        let (tx, rx) = mpsc::channel(WRITE_CH_SIZE);
        let cancel = CancellationToken::new();
        let _task = spawn_writer_task(local, rx, cancel.clone());
        let mut writer = FrameWriter::new(tx, Arc::new(ConnStreams::new()));

        // Remote side gone: writes fail once the duplex buffer is closed.
        drop(remote);

        writer.start_write(1, Cmd(1), FrameFlags::empty());
        writer.write_bytes(b"payload");
        assert!(writer.end_write().await.is_err());

        // The error path cancels the token for connection teardown.
        cancel.cancelled().await;
    }
}
