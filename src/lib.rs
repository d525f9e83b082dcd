//! # muxwire
//!
//! A length-prefixed, multiplexed, bidirectional RPC framing protocol and
//! its TCP server runtime.
//!
//! A connection carries many concurrent request streams, demultiplexed by
//! a 64-bit request id. Handlers are keyed by a 24-bit command code and
//! respond through a scheduled writer; either side may reset a stream, and
//! the server may push its own streams using server-allocated ids.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): 16-byte header + payload, big-endian.
//! - **Stream table** ([`stream`]): per-connection reassembly and reset.
//! - **Serve loop** ([`server`]): one reader, writer and dispatcher per
//!   connection; accept loops with throttling and backoff; identity
//!   binding with preemption ("kick"); graceful shutdown.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use muxwire::{Cmd, FrameFlags, ServeMux, Server, ServerBinding};
//!
//! #[tokio::main]
//! async fn main() -> muxwire::Result<()> {
//!     let mux = ServeMux::new();
//!     mux.handle_func(Cmd(1), |mut w, r| async move {
//!         w.start_write(r.request_id, Cmd(2), FrameFlags::empty());
//!         w.write_bytes(r.payload());
//!         let _ = w.end_write().await;
//!     });
//!
//!     let server = Server::new(vec![ServerBinding::new("0.0.0.0:8080", Arc::new(mux))]);
//!     server.listen_and_serve().await
//! }
//! ```

pub mod error;
pub mod handler;
pub mod protocol;
pub mod reader;
pub mod server;
pub mod stream;

mod writer;

pub use error::{MuxwireError, Result};
pub use handler::{Handler, HandlerFunc, Middleware, RequestFrame, ServeMux};
pub use protocol::{Cmd, Frame, FrameFlags};
pub use server::{ConnectionInfo, CounterMetric, Server, ServerBinding};
pub use writer::FrameWriter;
