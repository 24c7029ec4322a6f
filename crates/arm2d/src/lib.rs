//! ARM2 session daemon library.
//!
//! Exposes the HTTP+WebSocket API, the session registry, and daemon
//! configuration so the `arm2d` binary and `openapi_dump` can both build
//! the router, and so `arm2-testing` can drive it with
//! `tower::ServiceExt::oneshot` without spawning a real listener.

pub mod api;
pub mod config;
pub mod registry;
pub mod tracing_layer;
