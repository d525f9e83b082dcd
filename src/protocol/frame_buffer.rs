//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` and a two-state machine for fragmented frames:
//! - `WaitingForHeader`: need at least 16 bytes
//! - `WaitingForPayload`: header parsed, need `size - 12` more bytes
//!
//! Size bounds (`InvalidFrameSize`, `FrameTooLarge`) are enforced at header
//! time, before any payload is buffered or allocated.

use bytes::{Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{Header, HEADER_SIZE};
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header (need 16 bytes).
    WaitingForHeader,
    /// Header parsed and validated, waiting for payload bytes.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame size; 0 means no limit.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with no frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(0)
    }

    /// Create a new frame buffer enforcing `max_frame_size` (0 = no limit).
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForHeader,
            max_frame_size,
        }
    }

    /// Append raw bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The internal buffer, for direct `read_buf` style fills.
    pub(crate) fn read_target(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a size violation; no payload was allocated and no
    ///   bytes were consumed past the offending header
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = Header::decode(&self.buffer[..HEADER_SIZE])
                        .expect("buffer has enough bytes");
                    header.validate(self.max_frame_size)?;

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForPayload { header };
                }

                State::WaitingForPayload { header } => {
                    let want = header.payload_len();
                    if self.buffer.len() < want {
                        self.buffer.reserve(want - self.buffer.len());
                        return Ok(None);
                    }

                    let payload = if want == 0 {
                        Bytes::new()
                    } else {
                        self.buffer.split_to(want).freeze()
                    };
                    let header = *header;
                    self.state = State::WaitingForHeader;

                    return Ok(Some(Frame::new(
                        header.request_id,
                        header.cmd,
                        header.flags,
                        payload,
                    )));
                }
            }
        }
    }

    /// Whether a partial frame is pending.
    ///
    /// Used to tell a clean peer close from a close mid-frame.
    pub fn mid_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForPayload { .. })
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
