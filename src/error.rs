//! Error types for leadflow.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    /// Network or 5xx-class failure from a remote collaborator.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Gateway(GatewayError::MissingCredential { .. }) => false,
            Self::Gateway(_) | Self::Llm(_) => true,
            _ => false,
        }
    }

    /// Raw error payload returned by the remote provider, if any.
    pub fn provider_payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Gateway(GatewayError::Rejected { body, .. }) => Some(body),
            Self::Llm(LlmError::Api { body, .. }) => Some(body),
            _ => None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_)
            | Self::Validation(_)
            | Self::Gateway(GatewayError::MissingCredential { .. }) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            _ if self.is_transient() => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let Some(details) = self.provider_payload() {
            body["details"] = details.clone();
        }
        (status, Json(body)).into_response()
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging gateway failures. All variants except `MissingCredential` are
/// transient remote errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Instance {instance} has no gateway token; register it again")]
    MissingCredential { instance: String },

    #[error("Gateway {operation} unreachable: {reason}")]
    Unreachable { operation: String, reason: String },

    #[error("Gateway {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Gateway {operation} rejected with status {status}: {body}")]
    Rejected {
        operation: String,
        status: u16,
        body: serde_json::Value,
    },

    #[error("Invalid response from gateway {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Provider {provider} returned status {status}")]
    Api {
        provider: String,
        status: u16,
        body: serde_json::Value,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Result type alias for the core.
pub type Result<T> = std::result::Result<T, Error>;
