//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header fields and payload.
//! Uses `bytes::Bytes` for the payload so frames can be moved between the
//! reader, the stream table and handlers without copying.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Cmd, FrameFlags, Header, HEADER_SIZE, MIN_FRAME_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Request identifier the frame belongs to.
    pub request_id: u64,
    /// Command code.
    pub cmd: Cmd,
    /// Flags byte.
    pub flags: FrameFlags,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header fields and payload.
    pub fn new(request_id: u64, cmd: Cmd, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            request_id,
            cmd,
            flags,
            payload,
        }
    }

    /// The header this frame encodes to.
    pub fn header(&self) -> Header {
        Header::new(self.request_id, self.cmd, self.flags, self.payload.len() as u32)
    }

    /// Value of the wire `size` field for this frame.
    #[inline]
    pub fn size(&self) -> u32 {
        MIN_FRAME_SIZE + self.payload.len() as u32
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check if this frame belongs to a multi-frame stream.
    #[inline]
    pub fn is_stream(&self) -> bool {
        self.flags.is_stream()
    }

    /// Check if this is the final frame of its stream.
    #[inline]
    pub fn is_stream_end(&self) -> bool {
        self.flags.is_stream_end()
    }

    /// Check if this is a reset frame.
    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags.is_rst()
    }

    /// Check if this is a server-initiated push frame.
    #[inline]
    pub fn is_push(&self) -> bool {
        self.flags.is_push()
    }

    /// A frame after which its stream expects no more inbound frames.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.flags.is_done()
    }

    /// Encode header and payload into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.payload);
    }

    /// Build the complete on-wire representation of this frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}
