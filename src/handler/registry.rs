//! Handler registry for dispatching requests by command code.
//!
//! [`ServeMux`] maps command codes to handlers. Registration problems
//! (duplicate command) are programming errors and abort the process at
//! registration time, before any accept happens.
//!
//! # Example
//!
//! ```ignore
//! use muxwire::handler::ServeMux;
//! use muxwire::protocol::Cmd;
//!
//! let mux = ServeMux::new();
//! mux.handle_func(Cmd(1), |mut w, r| async move {
//!     w.start_write(r.request_id, Cmd(2), r.flags & !muxwire::protocol::FrameFlags::STREAM);
//!     w.write_bytes(r.payload());
//!     let _ = w.end_write().await;
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use super::RequestFrame;
use crate::protocol::Cmd;
use crate::writer::FrameWriter;

/// Boxed future used for dyn-compatible async dispatch.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler responds to one request stream.
///
/// Handlers own the request frame lifetime: dropping (or explicitly
/// closing) the frame releases its stream from the connection's table.
pub trait Handler: Send + Sync + 'static {
    /// Serve one request. `writer` is bound to the request's connection.
    fn serve(&self, writer: FrameWriter, request: RequestFrame) -> BoxFuture<'static, ()>;
}

/// Adapter to use ordinary async functions as handlers.
pub struct HandlerFunc<F, Fut>
where
    F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    f: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> HandlerFunc<F, Fut>
where
    F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Wrap `f` as a [`Handler`].
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for HandlerFunc<F, Fut>
where
    F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve(&self, writer: FrameWriter, request: RequestFrame) -> BoxFuture<'static, ()> {
        Box::pin((self.f)(writer, request))
    }
}

/// Middleware runs before the handler; returning `false` aborts the chain
/// and closes the request.
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        writer: &'a mut FrameWriter,
        request: &'a mut RequestFrame,
    ) -> BoxFuture<'a, bool>;
}

/// A handler wrapped with its middleware chain.
struct HandlerWithMiddleware {
    inner: Arc<dyn Handler>,
    middleware: Arc<[Arc<dyn Middleware>]>,
}

impl Handler for HandlerWithMiddleware {
    fn serve(&self, mut writer: FrameWriter, mut request: RequestFrame) -> BoxFuture<'static, ()> {
        let inner = self.inner.clone();
        let middleware = self.middleware.clone();
        Box::pin(async move {
            for mw in middleware.iter() {
                if !mw.call(&mut writer, &mut request).await {
                    return;
                }
            }
            inner.serve(writer, request).await;
        })
    }
}

/// Request multiplexer keyed by command code.
#[derive(Default)]
pub struct ServeMux {
    m: RwLock<HashMap<Cmd, Arc<dyn Handler>>>,
}

impl ServeMux {
    /// Allocate a new, empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `cmd`.
    ///
    /// # Panics
    ///
    /// Panics if a handler already exists for `cmd`.
    pub fn handle(&self, cmd: Cmd, handler: Arc<dyn Handler>) {
        self.handle_with(cmd, handler, Vec::new());
    }

    /// Register `handler` for `cmd` behind a middleware chain.
    ///
    /// # Panics
    ///
    /// Panics if a handler already exists for `cmd`.
    pub fn handle_with(
        &self,
        cmd: Cmd,
        handler: Arc<dyn Handler>,
        middleware: Vec<Arc<dyn Middleware>>,
    ) {
        let mut m = self.m.write();
        if m.contains_key(&cmd) {
            panic!("muxwire: multiple registrations for {}", cmd);
        }
        let handler = if middleware.is_empty() {
            handler
        } else {
            Arc::new(HandlerWithMiddleware {
                inner: handler,
                middleware: middleware.into(),
            })
        };
        m.insert(cmd, handler);
    }

    /// Register an async closure for `cmd`.
    ///
    /// # Panics
    ///
    /// Panics if a handler already exists for `cmd`.
    pub fn handle_func<F, Fut>(&self, cmd: Cmd, f: F)
    where
        F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle(cmd, Arc::new(HandlerFunc::new(f)));
    }

    /// Look up the handler registered for `cmd`.
    pub fn get(&self, cmd: Cmd) -> Option<Arc<dyn Handler>> {
        self.m.read().get(&cmd).cloned()
    }
}

impl Handler for ServeMux {
    fn serve(&self, writer: FrameWriter, request: RequestFrame) -> BoxFuture<'static, ()> {
        match self.get(request.cmd) {
            Some(handler) => handler.serve(writer, request),
            None => {
                error!(cmd = %request.cmd, "cmd not registered");
                // Dropping the request releases its stream.
                Box::pin(async move { drop(request) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(HandlerFunc::new(|_w, _r| async {}))
    }

    #[test]
    fn test_register_and_lookup() {
        let mux = ServeMux::new();
        mux.handle(Cmd(1), noop());

        assert!(mux.get(Cmd(1)).is_some());
        assert!(mux.get(Cmd(2)).is_none());
    }

    #[test]
    #[should_panic(expected = "multiple registrations")]
    fn test_duplicate_registration_panics() {
        let mux = ServeMux::new();
        mux.handle(Cmd(1), noop());
        mux.handle(Cmd(1), noop());
    }

    #[test]
    fn test_handle_func_registers() {
        let mux = ServeMux::new();
        mux.handle_func(Cmd(3), |_w, _r| async {});
        assert!(mux.get(Cmd(3)).is_some());
    }

    #[test]
    fn test_handle_with_middleware_registers() {
        struct Pass;
        impl Middleware for Pass {
            fn call<'a>(
                &'a self,
                _writer: &'a mut FrameWriter,
                _request: &'a mut RequestFrame,
            ) -> BoxFuture<'a, bool> {
                Box::pin(async { true })
            }
        }

        let mux = ServeMux::new();
        mux.handle_with(Cmd(4), noop(), vec![Arc::new(Pass)]);
        assert!(mux.get(Cmd(4)).is_some());
    }
}
