use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;

/// Author of a message. Stored as `user` / `ai`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    #[default]
    User,
    Ai,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Ai => "ai",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sender {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Sender::User),
            "ai" => Ok(Sender::Ai),
            other => Err(RelayError::Validation(format!("unknown sender '{}'", other))),
        }
    }
}

/// Which agent pipeline a request targets. `Ops` carries a structured
/// machine-parameter recipe instead of free text context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Chat,
    Ops,
}

impl AgentMode {
    /// Path segment appended to the agent endpoint for the streaming call.
    pub fn stream_path(&self) -> &'static str {
        match self {
            AgentMode::Chat => "chat/stream",
            AgentMode::Ops => "ops/stream",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentMode::Chat => f.write_str("chat"),
            AgentMode::Ops => f.write_str("ops"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LatencyMs(pub u128);

impl fmt::Display for LatencyMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Duration> for LatencyMs {
    fn from(d: Duration) -> Self {
        Self(d.as_millis())
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, code) = match &self.inner {
            RelayError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone(), "VALIDATION_ERROR"),
            RelayError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            RelayError::UpstreamTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Request timed out. Please try again later.".to_string(),
                "UPSTREAM_TIMEOUT",
            ),
            RelayError::Upstream(_, m) => (StatusCode::BAD_GATEWAY, m.clone(), "UPSTREAM_ERROR"),
            RelayError::Decode(m) => (StatusCode::BAD_GATEWAY, m.clone(), "DECODE_ERROR"),
            RelayError::Arithmetic(m) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                m.clone(),
                "ARITHMETIC_ERROR",
            ),
            RelayError::Persistence(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "PERSISTENCE_ERROR",
            ),
            RelayError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR"),
            RelayError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            RelayError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            RelayError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "IO_ERROR"),
            RelayError::Internal(m, _) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };

        if status.is_server_error() {
            tracing::error!("[⚙️  -> 🖥️ ] {} ({}): {}", status, code, msg);
        } else {
            tracing::debug!("[⚙️  -> 🖥️ ] {} ({}): {}", status, code, msg);
        }

        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn sender_round_trips_through_storage_form() {
        assert_eq!("ai".parse::<Sender>().ok(), Some(Sender::Ai));
        assert_eq!(Sender::User.as_str(), "user");
        assert!("bot".parse::<Sender>().is_err());
    }

    #[test]
    fn error_variants_map_to_statuses() {
        let cases = [
            (RelayError::Validation("x".into()), 400),
            (RelayError::NotFound("x".into()), 404),
            (RelayError::UpstreamTimeout(Duration::from_secs(70)), 504),
            (
                RelayError::Upstream(axum::http::StatusCode::INTERNAL_SERVER_ERROR, "x".into()),
                502,
            ),
            (RelayError::Arithmetic("x".into()), 422),
        ];
        for (err, status) in cases {
            let response = ObservedError::from(err).into_response();
            assert_eq!(response.status().as_u16(), status);
        }
    }

    #[test]
    fn stream_paths_follow_mode() {
        assert_eq!(AgentMode::Chat.stream_path(), "chat/stream");
        assert_eq!(AgentMode::Ops.stream_path(), "ops/stream");
    }
}
