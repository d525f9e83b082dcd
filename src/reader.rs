//! Frame reading with stream demultiplexing.
//!
//! [`FrameReader`] owns the read half of one connection plus a
//! [`FrameBuffer`]. `read_frame` yields raw wire frames; `read_request`
//! is the multiplex-aware read used by the serve loop: it folds reset
//! frames and continuations into the stream table and only returns frames
//! that open a new request.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{MuxwireError, Result};
use crate::protocol::{Frame, FrameBuffer};
use crate::stream::{ConnStreams, Stream};

/// Reads frames from one connection. Create one instance per connection.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    read_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a frame reader enforcing `max_frame_size` (0 = no limit).
    pub fn new(reader: R, max_frame_size: u32) -> Self {
        Self::with_read_timeout(reader, max_frame_size, None)
    }

    /// Create a frame reader that also applies a per-read deadline.
    pub fn with_read_timeout(
        reader: R,
        max_frame_size: u32,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_max_frame_size(max_frame_size),
            read_timeout,
        }
    }

    /// Read the next raw frame off the wire.
    ///
    /// Fails with `ConnectionClosed` on a clean peer close, or the
    /// underlying I/O error on a close mid-frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(frame);
            }

            let read = self.reader.read_buf(self.buffer.read_target());
            let n = match self.read_timeout {
                Some(timeout) => tokio::time::timeout(timeout, read)
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??,
                None => read.await?,
            };

            if n == 0 {
                return if self.buffer.mid_frame() {
                    Err(MuxwireError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection reset by peer",
                    )))
                } else {
                    Err(MuxwireError::ConnectionClosed)
                };
            }
        }
    }

    /// Read the next frame that opens a request stream.
    ///
    /// Reset frames mark their stream and are consumed here; continuation
    /// frames are routed onto their stream's inbound queue. When a
    /// continuation targets a stream that no longer accepts input, the
    /// frame is dropped after the stream's terminal signal.
    pub async fn read_request(&mut self, streams: &ConnStreams) -> Result<(Frame, Arc<Stream>)> {
        loop {
            let frame = self.read_frame().await?;

            if frame.is_rst() {
                if let Some(stream) = streams.get(frame.request_id, frame.flags) {
                    stream.reset_by_peer();
                }
                continue;
            }

            let (stream, loaded) = streams.create_or_get(frame.request_id, frame.flags);
            if !loaded {
                debug!(request_id = frame.request_id, cmd = %frame.cmd, "new inbound stream");
            }

            if stream.try_bind(&frame) {
                return Ok((frame, stream));
            }
            if !stream.add_in_frame(frame) {
                stream.done().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncWriteExt};

    use crate::protocol::{Cmd, FrameFlags};

    fn frame(id: u64, cmd: u32, flags: FrameFlags, payload: &'static [u8]) -> Frame {
        Frame::new(id, Cmd(cmd), flags, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_read_frame_roundtrip() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);

        let sent = frame(1, 2, FrameFlags::empty(), b"\xAB\xCD");
        client.write_all(&sent.encode()).await.unwrap();

        let got = reader.read_frame().await.unwrap();
        assert_eq!(got.request_id, 1);
        assert_eq!(got.cmd, Cmd(2));
        assert_eq!(got.payload(), b"\xAB\xCD");
    }

    #[tokio::test]
    async fn test_read_frame_clean_close() {
        let (client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);
        drop(client);

        assert!(matches!(
            reader.read_frame().await,
            Err(MuxwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_close_mid_frame() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);

        let bytes = frame(1, 1, FrameFlags::empty(), b"payload").encode();
        client.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        drop(client);

        assert!(matches!(reader.read_frame().await, Err(MuxwireError::Io(_))));
    }

    #[tokio::test]
    async fn test_read_frame_too_large() {
        let (mut client, server) = duplex(8192);
        let mut reader = FrameReader::new(server, 1024);

        let big = vec![0u8; 4096 - 12];
        let sent = Frame::new(1, Cmd(1), FrameFlags::empty(), Bytes::from(big));
        client.write_all(&sent.encode()).await.unwrap();

        assert!(matches!(
            reader.read_frame().await,
            Err(MuxwireError::FrameTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_read_request_returns_opening_frames() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);
        let streams = ConnStreams::new();

        client
            .write_all(&frame(1, 7, FrameFlags::empty(), b"a").encode())
            .await
            .unwrap();
        client
            .write_all(&frame(2, 7, FrameFlags::empty(), b"b").encode())
            .await
            .unwrap();

        let (first, _) = reader.read_request(&streams).await.unwrap();
        let (second, _) = reader.read_request(&streams).await.unwrap();
        assert_eq!(first.request_id, 1);
        assert_eq!(second.request_id, 2);
        assert_eq!(streams.active_count(), 2);
    }

    #[tokio::test]
    async fn test_read_request_routes_continuations() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);
        let streams = ConnStreams::new();

        client
            .write_all(&frame(7, 1, FrameFlags::STREAM, b"open").encode())
            .await
            .unwrap();
        client
            .write_all(&frame(7, 1, FrameFlags::STREAM, b"cont").encode())
            .await
            .unwrap();
        // Another request so read_request returns a second time.
        client
            .write_all(&frame(8, 1, FrameFlags::empty(), b"next").encode())
            .await
            .unwrap();

        let (open, stream) = reader.read_request(&streams).await.unwrap();
        assert_eq!(open.payload(), b"open");
        let mut rx = stream.take_receiver().unwrap();

        let (next, _) = reader.read_request(&streams).await.unwrap();
        assert_eq!(next.request_id, 8);

        // The continuation landed on the stream queue in between.
        assert_eq!(rx.recv().await.unwrap().payload(), b"cont");
    }

    #[tokio::test]
    async fn test_read_request_consumes_rst() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);
        let streams = ConnStreams::new();

        client
            .write_all(&frame(7, 1, FrameFlags::STREAM, b"open").encode())
            .await
            .unwrap();
        let (_, stream) = reader.read_request(&streams).await.unwrap();

        client
            .write_all(&frame(7, 0, FrameFlags::RST, b"").encode())
            .await
            .unwrap();
        client
            .write_all(&frame(9, 1, FrameFlags::empty(), b"next").encode())
            .await
            .unwrap();

        // The RST is swallowed; the next delivered request is id 9.
        let (next, _) = reader.read_request(&streams).await.unwrap();
        assert_eq!(next.request_id, 9);
        assert!(stream.is_reset());
    }

    #[tokio::test]
    async fn test_rst_for_unknown_stream_is_ignored() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);
        let streams = ConnStreams::new();

        client
            .write_all(&frame(99, 0, FrameFlags::RST, b"").encode())
            .await
            .unwrap();
        client
            .write_all(&frame(1, 1, FrameFlags::empty(), b"req").encode())
            .await
            .unwrap();

        let (next, _) = reader.read_request(&streams).await.unwrap();
        assert_eq!(next.request_id, 1);
        assert_eq!(streams.active_count(), 1);
    }

    #[tokio::test]
    async fn test_continuation_after_reset_is_dropped() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server, 0);
        let streams = ConnStreams::new();

        client
            .write_all(&frame(7, 1, FrameFlags::STREAM, b"open").encode())
            .await
            .unwrap();
        let (_, stream) = reader.read_request(&streams).await.unwrap();
        stream.reset_by_peer();

        // Continuation for the reset stream, then a fresh request.
        client
            .write_all(&frame(7, 1, FrameFlags::STREAM, b"late").encode())
            .await
            .unwrap();
        client
            .write_all(&frame(8, 1, FrameFlags::empty(), b"req").encode())
            .await
            .unwrap();

        let (next, _) = reader.read_request(&streams).await.unwrap();
        assert_eq!(next.request_id, 8);
    }
}
