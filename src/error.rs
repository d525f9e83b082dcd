//! Error types for muxwire.

use thiserror::Error;

/// Main error type for all muxwire operations.
#[derive(Debug, Error)]
pub enum MuxwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame header carried a size below the 12-byte minimum.
    #[error("invalid frame size")]
    InvalidFrameSize,

    /// Frame header carried a size above the configured maximum.
    #[error("frame size too large")]
    FrameTooLarge,

    /// Write submitted after the connection began teardown.
    #[error("write after close self")]
    WriteAfterCloseSelf,

    /// Reset requested for a request id with no open local stream.
    #[error("reset non existing stream")]
    RstNonExistingStream,

    /// Returned by serve/accept paths after `Server::shutdown`.
    #[error("muxwire: server closed")]
    ServerClosed,

    /// Accept deadline expired (overlay listeners may surface this).
    #[error("muxwire: accept timed out")]
    AcceptTimedout,

    /// Accepted connection does not support keep-alive configuration.
    #[error("muxwire: listener accept did not return a TCP-capable conn")]
    ListenerAcceptReturnType,

    /// Peer closed the connection cleanly (no partial frame pending).
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using MuxwireError.
pub type Result<T> = std::result::Result<T, MuxwireError>;
