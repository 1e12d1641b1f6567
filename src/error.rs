use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Chunk {index} ({size} bytes) was rejected by the upstream as too large")]
    ChunkTooLarge { index: usize, size: usize },

    #[error("Upstream unavailable{}: {detail}", status_suffix(.status))]
    UpstreamUnavailable { status: Option<u16>, detail: String },

    #[error("Malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn upstream(status: Option<u16>, detail: impl Into<String>) -> Self {
        GatewayError::UpstreamUnavailable {
            status,
            detail: detail.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ChunkTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamUnavailable { .. }
            | GatewayError::MalformedUpstreamResponse(_)
            | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }
        // Upstream details stay in the logs; clients get a generic message.
        let body = match &self {
            GatewayError::UpstreamUnavailable { .. }
            | GatewayError::MalformedUpstreamResponse(_)
            | GatewayError::Http(_) => json!({ "error": "Unable to complete request" }),
            GatewayError::ChunkTooLarge { .. } => json!({
                "error": "Message chunk exceeded the upstream size limit",
                "details": self.to_string(),
            }),
            GatewayError::InvalidRequest(msg) => json!({ "error": msg }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, GatewayError>;
