//! Server module - multi-binding orchestration, connection registry,
//! accept loops and graceful shutdown.
//!
//! One [`Server`] owns any number of bindings (listen addresses). Each
//! binding runs one accept loop; each accepted socket runs one serve task.
//! Identity binding ("kick"), throttling and close-rate limiting are
//! per-binding; the push-id allocator and kick order are process-wide.

mod binding;
mod conn;
mod rate;

pub use binding::{
    CounterMetric, Listener, ListenFunc, OnKickCallback, OverlayNetwork, ServerBinding,
    ServerStream,
};
pub use conn::{ConnectionInfo, ServeConn};

#[cfg(test)]
pub(crate) use conn::test_support;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{MuxwireError, Result};
use crate::writer::FrameWriter;
use binding::TcpServerListener;
use rate::RateLimiter;

/// Deadline for a single accept call; doubles as the cooperative
/// cancellation poll interval.
const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keep-alive probe period applied to accepted connections.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Backoff bounds for temporary accept errors.
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after a non-temporary accept error; the loop keeps trying
/// instead of quitting (fd exhaustion is usually transient).
const ACCEPT_FATAL_PAUSE: Duration = Duration::from_secs(1);

/// Process-wide, monotone order of kick events.
static KICK_ORDER: AtomicU64 = AtomicU64::new(0);

/// Process-wide connection ids keying the active tables.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

struct ThrottleSlot {
    on: bool,
    gate: watch::Sender<bool>,
}

impl Default for ThrottleSlot {
    fn default() -> Self {
        let (gate, _) = watch::channel(false);
        Self { on: false, gate }
    }
}

struct Lifecycle {
    /// Bound listeners, filled by `listen_all`, consumed by `serve_all`.
    listeners: Vec<Option<Box<dyn Listener>>>,
    /// Local addresses captured at bind time (useful with port 0).
    bound_addrs: Vec<Option<SocketAddr>>,
    done: bool,
    shutdown_funcs: Vec<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct ServerInner {
    pub(crate) bindings: Vec<ServerBinding>,
    lifecycle: Mutex<Lifecycle>,
    done_tx: watch::Sender<bool>,
    drained_tx: watch::Sender<bool>,
    drain_tx: Mutex<Option<mpsc::Sender<()>>>,
    drain_rx: Mutex<Option<mpsc::Receiver<()>>>,
    id2conn: Vec<DashMap<String, Arc<ServeConn>>>,
    active_conn: Vec<DashMap<u64, Arc<ServeConn>>>,
    throttle: Vec<Mutex<ThrottleSlot>>,
    close_rate: Vec<Option<RateLimiter>>,
    push_id: AtomicU64,
}

/// A muxwire server.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server for the given bindings.
    pub fn new(bindings: Vec<ServerBinding>) -> Self {
        let n = bindings.len();
        let close_rate = bindings
            .iter()
            .map(|b| (b.max_close_rate > 0).then(|| RateLimiter::new(b.max_close_rate)))
            .collect();
        let (done_tx, _) = watch::channel(false);
        let (drained_tx, _) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(ServerInner {
                bindings,
                lifecycle: Mutex::new(Lifecycle {
                    listeners: Vec::new(),
                    bound_addrs: Vec::new(),
                    done: false,
                    shutdown_funcs: Vec::new(),
                }),
                done_tx,
                drained_tx,
                drain_tx: Mutex::new(Some(drain_tx)),
                drain_rx: Mutex::new(Some(drain_rx)),
                id2conn: (0..n).map(|_| DashMap::new()).collect(),
                active_conn: (0..n).map(|_| DashMap::new()).collect(),
                throttle: (0..n).map(|_| Mutex::new(ThrottleSlot::default())).collect(),
                close_rate,
                push_id: AtomicU64::new(0),
            }),
        }
    }

    /// Bind every configured address.
    pub async fn listen_all(&self) -> Result<()> {
        let mut bound = Vec::with_capacity(self.inner.bindings.len());
        let mut addrs = Vec::with_capacity(self.inner.bindings.len());
        for binding in &self.inner.bindings {
            let listener: Box<dyn Listener> = match &binding.listen_func {
                Some(listen) => {
                    let std_listener = listen(&binding.addr)?;
                    std_listener.set_nonblocking(true)?;
                    Box::new(TcpServerListener(TcpListener::from_std(std_listener)?))
                }
                None => Box::new(TcpServerListener(TcpListener::bind(&binding.addr).await?)),
            };
            let listener = match &binding.overlay_network {
                Some(overlay) => overlay(listener),
                None => listener,
            };
            addrs.push(listener.local_addr().ok());
            bound.push(Some(listener));
        }
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.listeners = bound;
        lifecycle.bound_addrs = addrs;
        Ok(())
    }

    /// The address binding `idx` actually bound (resolves port 0).
    pub fn local_addr(&self, idx: usize) -> Option<SocketAddr> {
        self.inner
            .lifecycle
            .lock()
            .bound_addrs
            .get(idx)
            .copied()
            .flatten()
    }

    /// Run one accept loop per binding. If any loop returns, the whole
    /// group shuts down. Always returns an error; after [`shutdown`] it
    /// is `ServerClosed`.
    ///
    /// [`shutdown`]: Server::shutdown
    pub async fn serve_all(&self) -> Result<()> {
        let listeners = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.listeners.len() != self.inner.bindings.len()
                || lifecycle.listeners.iter().any(|l| l.is_none())
            {
                return Err(MuxwireError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "serve_all before listen_all",
                )));
            }
            std::mem::take(&mut lifecycle.listeners)
        };

        let Some(drain_tx) = self.inner.drain_tx.lock().clone() else {
            return Err(MuxwireError::ServerClosed);
        };

        let mut group = JoinSet::new();
        for (idx, listener) in listeners.into_iter().enumerate() {
            let listener = listener.expect("listener presence checked above");
            let inner = self.inner.clone();
            let drain_tx = drain_tx.clone();
            group.spawn(accept_loop(inner, idx, listener, drain_tx));
        }
        drop(drain_tx);

        let first = match group.join_next().await {
            None => Ok(()),
            Some(Ok(result)) => result,
            Some(Err(join_err)) => Err(MuxwireError::Io(io::Error::other(join_err))),
        };
        self.shutdown().await;
        while group.join_next().await.is_some() {}
        first
    }

    /// `listen_all` followed by `serve_all`.
    pub async fn listen_and_serve(&self) -> Result<()> {
        self.listen_all().await?;
        self.serve_all().await
    }

    /// Gracefully shut the server down: stop accepting, run shutdown
    /// callbacks, then wait for every connection task to finish.
    /// Idempotent; concurrent callers all wait for the drain.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// Register `f` to run at shutdown, in registration order. If the
    /// server is already shut down, `f` runs immediately and is not
    /// retained.
    pub fn on_shutdown(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.done {
                lifecycle.shutdown_funcs.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Allocate a process-wide monotonically increasing push id.
    pub fn get_push_id(&self) -> u64 {
        self.inner.push_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Gate new accepts on binding `idx`. Idempotent.
    pub fn set_throttle(&self, idx: usize) {
        let mut slot = self.inner.throttle[idx].lock();
        if slot.on {
            return;
        }
        let (gate, _) = watch::channel(false);
        slot.on = true;
        slot.gate = gate;
    }

    /// Resume accepts on binding `idx`. Idempotent.
    pub fn clear_throttle(&self, idx: usize) {
        let mut slot = self.inner.throttle[idx].lock();
        if !slot.on {
            return;
        }
        slot.on = false;
        let _ = slot.gate.send(true);
    }

    /// Iterate active connections on binding `idx`. Snapshot-like:
    /// concurrent mutation may or may not be observed. The visitor
    /// returns `false` to stop early.
    pub fn walk_conn(&self, idx: usize, mut f: impl FnMut(FrameWriter, Arc<ConnectionInfo>) -> bool) {
        let conns: Vec<Arc<ServeConn>> = self.inner.active_conn[idx]
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for sc in conns {
            if !f(sc.writer(), sc.info()) {
                break;
            }
        }
    }

    /// Visit the connections currently bound to `ids` on binding `idx`.
    pub fn walk_conn_by_id(
        &self,
        idx: usize,
        ids: &[&str],
        mut f: impl FnMut(FrameWriter, Arc<ConnectionInfo>),
    ) {
        for id in ids {
            let sc = self.inner.id2conn[idx].get(*id).map(|e| e.value().clone());
            if let Some(sc) = sc {
                f(sc.writer(), sc.info());
            }
        }
    }

    /// Info for the connection bound to `id` on binding `idx`, if any.
    pub fn get_connection_info_by_id(&self, idx: usize, id: &str) -> Option<Arc<ConnectionInfo>> {
        self.inner.id2conn[idx].get(id).map(|e| e.value().info())
    }

    /// Number of tracked connections on binding `idx`.
    pub fn active_conn_count(&self, idx: usize) -> usize {
        self.inner.active_conn[idx].len()
    }
}

impl ServerInner {
    async fn shutdown(&self) {
        let funcs = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.done {
                None
            } else {
                lifecycle.done = true;
                // Drop unserved listeners so their sockets close.
                lifecycle.listeners.clear();
                Some(std::mem::take(&mut lifecycle.shutdown_funcs))
            }
        };

        match funcs {
            Some(funcs) => {
                let _ = self.done_tx.send(true);
                for f in funcs {
                    f();
                }
                drop(self.drain_tx.lock().take());
                let rx = self.drain_rx.lock().take();
                if let Some(mut rx) = rx {
                    while rx.recv().await.is_some() {}
                }
                let _ = self.drained_tx.send(true);
            }
            None => {
                // Someone else is (or finished) shutting down; wait it out.
                let mut drained = self.drained_tx.subscribe();
                if *drained.borrow() {
                    return;
                }
                while drained.changed().await.is_ok() {
                    if *drained.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Block while the binding's throttle gate is on; the server
    /// done-signal also unblocks.
    async fn wait_throttle(&self, idx: usize) {
        let mut gate = {
            let slot = self.throttle[idx].lock();
            if !slot.on {
                return;
            }
            slot.gate.subscribe()
        };
        let mut done = self.done_tx.subscribe();
        if *gate.borrow() || *done.borrow() {
            return;
        }
        tokio::select! {
            // A dropped gate sender (slot replaced) also unblocks.
            _ = gate.changed() => {}
            _ = done.changed() => {}
        }
    }

    fn start_conn(
        self: &Arc<Self>,
        idx: usize,
        stream: Box<dyn ServerStream>,
        serve_ctx: &CancellationToken,
        drain_tx: &mpsc::Sender<()>,
    ) {
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let sc = ServeConn::new(
            self.clone(),
            idx,
            conn_id,
            stream.remote_addr(),
            serve_ctx.child_token(),
        );
        self.active_conn[idx].insert(conn_id, sc.clone());
        tokio::spawn(sc.serve(stream, drain_tx.clone()));
    }

    /// Establish `id -> sc` exclusively, preempting any previous holder.
    ///
    /// Concurrent rebinds to the same id linearize through the retry loop:
    /// the previous holder is untracked and closed before the slot is
    /// contended again.
    pub(crate) async fn bind_id(&self, sc: &Arc<ServeConn>, id: &str) -> (bool, u64) {
        let idx = sc.idx;
        let mut kicked = false;
        loop {
            let existing = match self.id2conn[idx].entry(id.to_string()) {
                Entry::Occupied(e) => Some(e.get().clone()),
                Entry::Vacant(v) => {
                    v.insert(sc.clone());
                    None
                }
            };

            let Some(vsc) = existing else {
                sc.info().set_id(id);
                return (kicked, KICK_ORDER.load(Ordering::Acquire));
            };
            if Arc::ptr_eq(&vsc, sc) {
                return (kicked, KICK_ORDER.load(Ordering::Acquire));
            }

            let (first, mut untracked) = self.untrack(&vsc, true).await;
            if !first && !*untracked.borrow() {
                let _ = untracked.changed().await;
            }
            debug!(conn_id = vsc.conn_id, "kick triggers close_untracked");
            vsc.close_untracked().await;

            if let Some(metric) = &self.bindings[idx].counter_metric {
                metric.add(&[("method", "kickoff"), ("error", "none")], 1.0);
            }
            KICK_ORDER.fetch_add(1, Ordering::AcqRel);
            kicked = true;
            // A concurrent binder may have taken the slot; check again.
        }
    }

    /// Remove `sc` from the registries exactly once.
    ///
    /// Returns whether this call performed the cleanup, plus the untracked
    /// signal late callers can wait on. Kick-driven untracks consult the
    /// binding's close-rate limiter and run the on-kick callback.
    pub(crate) async fn untrack(
        &self,
        sc: &Arc<ServeConn>,
        kicked: bool,
    ) -> (bool, watch::Receiver<bool>) {
        if sc.untracked.swap(true, Ordering::AcqRel) {
            return (false, sc.untracked_rx());
        }

        if kicked {
            if let Some(limiter) = &self.close_rate[sc.idx] {
                limiter.acquire().await;
            }
        }

        let id = sc.info().id();
        if !id.is_empty() {
            self.id2conn[sc.idx].remove_if(&id, |_, v| Arc::ptr_eq(v, sc));
        }
        self.active_conn[sc.idx].remove(&sc.conn_id);

        if kicked {
            if let Some(on_kick) = &self.bindings[sc.idx].on_kick {
                on_kick(sc.writer());
            }
        }
        sc.mark_untracked();
        (true, sc.untracked_rx())
    }
}

/// One binding's accept loop.
async fn accept_loop(
    inner: Arc<ServerInner>,
    idx: usize,
    mut listener: Box<dyn Listener>,
    drain_tx: mpsc::Sender<()>,
) -> Result<()> {
    // Cancelled when this loop returns, so every connection accepted here
    // observes shutdown through its own token.
    let serve_ctx = CancellationToken::new();
    let _guard = serve_ctx.clone().drop_guard();

    let mut done = inner.done_tx.subscribe();
    let mut temp_delay = Duration::ZERO;

    loop {
        inner.wait_throttle(idx).await;
        if *done.borrow() {
            return Err(MuxwireError::ServerClosed);
        }

        let accepted = tokio::select! {
            biased;
            _ = done.changed() => return Err(MuxwireError::ServerClosed),
            res = tokio::time::timeout(DEFAULT_ACCEPT_TIMEOUT, listener.accept()) => res,
        };
        let result = match accepted {
            // Scheduled deadline; loop around and poll for shutdown.
            Err(_elapsed) => continue,
            Ok(result) => result,
        };

        match result {
            Ok(stream) => {
                temp_delay = Duration::ZERO;
                if let Err(e) = stream.set_keepalive(KEEPALIVE_PERIOD) {
                    if e.kind() == io::ErrorKind::Unsupported {
                        error!("{}", MuxwireError::ListenerAcceptReturnType);
                    } else {
                        warn!("keep-alive setup failed, discarding connection: {}", e);
                    }
                    continue;
                }
                inner.start_conn(idx, stream, &serve_ctx, &drain_tx);
            }
            Err(e) => {
                if *done.borrow() {
                    return Err(MuxwireError::ServerClosed);
                }
                match e.kind() {
                    // Overlay listeners surface their own scheduled timeouts.
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => continue,
                    io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted => {
                        temp_delay = if temp_delay.is_zero() {
                            ACCEPT_BACKOFF_INITIAL
                        } else {
                            (temp_delay * 2).min(ACCEPT_BACKOFF_MAX)
                        };
                        error!("accept error: {}, retrying in {:?}", e, temp_delay);
                        tokio::time::sleep(temp_delay).await;
                    }
                    _ => {
                        // e.g. too many open files; favour availability.
                        error!("accept fatal error: {}", e);
                        tokio::time::sleep(ACCEPT_FATAL_PAUSE).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ServeMux;

    fn test_server() -> Server {
        Server::new(vec![ServerBinding::new(
            "127.0.0.1:0",
            Arc::new(ServeMux::new()),
        )])
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let server = test_server();
        server.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_on_shutdown_runs_in_registration_order() {
        let server = test_server();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            server.on_shutdown(move || order.lock().push(i));
        }
        server.shutdown().await;

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_on_shutdown_after_shutdown_runs_immediately() {
        let server = test_server();
        server.shutdown().await;

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        server.on_shutdown(move || *flag.lock() = true);

        assert!(*ran.lock());
    }

    #[test]
    fn test_push_ids_are_monotonic() {
        let server = test_server();
        let a = server.get_push_id();
        let b = server.get_push_id();
        let c = server.get_push_id();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_throttle_transitions_are_idempotent() {
        let server = test_server();

        server.set_throttle(0);
        server.set_throttle(0);
        server.clear_throttle(0);
        server.clear_throttle(0);

        // Cleared throttle does not block.
        server.inner.wait_throttle(0).await;
    }

    #[tokio::test]
    async fn test_wait_throttle_unblocks_on_clear() {
        let server = test_server();
        server.set_throttle(0);

        let inner = server.inner.clone();
        let waiter = tokio::spawn(async move { inner.wait_throttle(0).await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        server.clear_throttle(0);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock after clear_throttle")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_throttle_unblocks_on_shutdown() {
        let server = test_server();
        server.set_throttle(0);

        let inner = server.inner.clone();
        let waiter = tokio::spawn(async move { inner.wait_throttle(0).await });

        tokio::task::yield_now().await;
        server.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_all_before_listen_all_errors() {
        let server = test_server();
        assert!(matches!(
            server.serve_all().await,
            Err(MuxwireError::Io(_))
        ));
    }
}
