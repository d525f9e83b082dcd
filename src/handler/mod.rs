//! Handler module - request handling and dispatch.
//!
//! Provides:
//! - [`ServeMux`] - maps command codes to handlers
//! - [`Handler`] / [`HandlerFunc`] - the handler contract and closure adapter
//! - [`RequestFrame`] - a request's opening frame plus its stream handle

mod registry;
mod request;

pub use registry::{BoxFuture, Handler, HandlerFunc, Middleware, ServeMux};
pub use request::RequestFrame;
