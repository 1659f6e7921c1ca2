//! HTTP gateway: one identity per process, one bus request per upload.

mod routes;
mod server;

pub use routes::{Gateway, HealthCheckResponse, UploadResponse, routes};
pub use server::{ServerConfig, serve, shutdown_signal};
