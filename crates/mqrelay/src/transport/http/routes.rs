//! HTTP route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::bridge::Envelope;
use crate::correlation::{CorrelationError, CorrelationWaiter, ReplyRecord};
use crate::identity::Identity;
use crate::version::VersionInfo;

/// Everything the HTTP handlers need: the waiter and this process's identity.
pub struct Gateway {
    waiter: Arc<CorrelationWaiter>,
    identity: Identity,
    default_timeout: Duration,
    version: VersionInfo,
}

impl Gateway {
    pub fn new(waiter: Arc<CorrelationWaiter>, identity: Identity) -> Self {
        Self {
            waiter,
            identity,
            default_timeout: Duration::from_secs(5),
            version: VersionInfo::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: &'static str,
    pub identity: String,
    pub version: VersionInfo,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Set instead of `content` when the reply is not UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
    /// Seconds, rounded to two decimals.
    pub duration: f64,
}

impl From<ReplyRecord> for UploadResponse {
    fn from(record: ReplyRecord) -> Self {
        let duration = (record.duration.as_secs_f64() * 100.0).round() / 100.0;
        let (content, content_base64) = match String::from_utf8(record.content.to_vec()) {
            Ok(text) => (Some(text), None),
            Err(_) => (None, Some(STANDARD.encode(&record.content))),
        };
        Self {
            filename: record.name,
            content,
            content_base64,
            duration,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub timeout_ms: Option<u64>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn health_check(State(gateway): State<Arc<Gateway>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "READY",
        identity: gateway.identity.to_string(),
        version: gateway.version.clone(),
    })
}

async fn upload(
    State(gateway): State<Arc<Gateway>>,
    Path(filename): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Response {
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(gateway.default_timeout);

    let envelope = match Envelope::new(filename, body) {
        Ok(envelope) => envelope,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    tracing::info!(
        identity = %gateway.identity,
        name = envelope.name(),
        ?timeout,
        "Upload received"
    );

    match gateway
        .waiter
        .request(&gateway.identity, envelope, timeout)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(UploadResponse::from(record))).into_response(),
        Err(CorrelationError::Busy(_)) => error_response(
            StatusCode::CONFLICT,
            "Another upload is still waiting for its reply",
        ),
        Err(CorrelationError::Timeout { .. }) => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "Timeout waiting for reply",
        ),
        Err(CorrelationError::Frame(e)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(CorrelationError::Transport(e)) => {
            tracing::error!(error = %e, "Upload failed on transport");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

pub fn routes(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/upload/{filename}", post(upload))
        .with_state(gateway)
}
