//! Per-binding configuration and the listener/stream seams.
//!
//! A binding is one listen address plus its per-address configuration.
//! The [`Listener`] and [`ServerStream`] traits are the seams where
//! overlay networks (e.g. TLS) and custom listen functions plug in.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::handler::{BoxFuture, Handler};
use crate::writer::FrameWriter;

/// Counter metric sink; the server records `kickoff` events through it
/// with `method`/`error` labels.
pub trait CounterMetric: Send + Sync + 'static {
    /// Add `delta` to the counter identified by `labels` (key/value pairs).
    fn add(&self, labels: &[(&str, &str)], delta: f64);
}

/// Invoked on a preempted connection before its final teardown.
pub type OnKickCallback = Box<dyn Fn(FrameWriter) + Send + Sync>;

/// Override for the default TCP listen. Returns a bound std listener so
/// callers can apply socket options before the server adopts it.
pub type ListenFunc = Box<dyn Fn(&str) -> io::Result<std::net::TcpListener> + Send + Sync>;

/// Wraps the bound listener, e.g. with TLS.
pub type OverlayNetwork = Box<dyn Fn(Box<dyn Listener>) -> Box<dyn Listener> + Send + Sync>;

/// An accepted connection as the server sees it.
pub trait ServerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Enable TCP keep-alive with the given probe period.
    ///
    /// Transports with no keep-alive notion should return an
    /// `Unsupported` error; the server discards the socket.
    fn set_keepalive(&self, period: Duration) -> io::Result<()>;

    /// Peer address, when the transport has one.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

impl ServerStream for TcpStream {
    fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        let socket = SockRef::from(self);
        socket.set_keepalive(true)?;
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(period))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

/// Listener seam so overlay networks can wrap accept.
pub trait Listener: Send + 'static {
    /// Accept the next connection.
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Box<dyn ServerStream>>>;

    /// The bound local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Default TCP listener.
pub(crate) struct TcpServerListener(pub(crate) TcpListener);

impl Listener for TcpServerListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Box<dyn ServerStream>>> {
        Box::pin(async move {
            let (stream, _) = self.0.accept().await?;
            Ok(Box::new(stream) as Box<dyn ServerStream>)
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

/// Parameters for one listen address.
pub struct ServerBinding {
    /// Bind address, `host:port`.
    pub addr: String,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) listen_func: Option<ListenFunc>,
    pub(crate) overlay_network: Option<OverlayNetwork>,
    pub(crate) read_frame_ch_size: usize,
    pub(crate) max_frame_size: u32,
    pub(crate) max_close_rate: u32,
    pub(crate) counter_metric: Option<Arc<dyn CounterMetric>>,
    pub(crate) on_kick: Option<OnKickCallback>,
    pub(crate) default_read_timeout: Option<Duration>,
}

impl ServerBinding {
    /// Create a binding for `addr` served by `handler` with defaults:
    /// unbuffered dispatch, no frame size limit, no close-rate limit,
    /// no read deadline.
    pub fn new(addr: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            addr: addr.into(),
            handler,
            listen_func: None,
            overlay_network: None,
            read_frame_ch_size: 0,
            max_frame_size: 0,
            max_close_rate: 0,
            counter_metric: None,
            on_kick: None,
            default_read_timeout: None,
        }
    }

    /// Override the default TCP listen.
    pub fn with_listen_func(mut self, f: ListenFunc) -> Self {
        self.listen_func = Some(f);
        self
    }

    /// Wrap the bound listener, e.g. with TLS.
    pub fn with_overlay_network(mut self, f: OverlayNetwork) -> Self {
        self.overlay_network = Some(f);
        self
    }

    /// Bound on pending opening frames per connection; 0 means an
    /// unbuffered hand-off from reader to dispatcher.
    pub fn with_read_frame_ch_size(mut self, size: usize) -> Self {
        self.read_frame_ch_size = size;
        self
    }

    /// Maximum accepted frame size; 0 means no limit.
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Rate limit on kick-driven connection closure, in closes per second;
    /// 0 disables the limit.
    pub fn with_max_close_rate(mut self, rate: u32) -> Self {
        self.max_close_rate = rate;
        self
    }

    /// Metric sink for `kickoff` events.
    pub fn with_counter_metric(mut self, metric: Arc<dyn CounterMetric>) -> Self {
        self.counter_metric = Some(metric);
        self
    }

    /// Callback run on a preempted connection before its teardown.
    pub fn with_on_kick(mut self, cb: OnKickCallback) -> Self {
        self.on_kick = Some(cb);
        self
    }

    /// Per-read deadline applied by the connection reader.
    pub fn with_default_read_timeout(mut self, timeout: Duration) -> Self {
        self.default_read_timeout = Some(timeout);
        self
    }
}
