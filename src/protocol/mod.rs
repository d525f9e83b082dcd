//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing protocol:
//! - 16-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use wire_format::{Cmd, FrameFlags, Header, HEADER_SIZE, MIN_FRAME_SIZE};
