//! Request/response front ends for the correlation waiter.
//!
//! Currently provides an HTTP gateway via axum.

pub mod http;

pub use http::{Gateway, ServerConfig, serve, shutdown_signal};
