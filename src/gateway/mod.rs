//! Messaging gateway capability surface.
//!
//! One [`GatewayClient`] trait over the vendor APIs. Implementations are
//! built per operation by a [`GatewayFactory`] from the current settings
//! snapshot, so a settings change takes effect on the next call.

pub mod evolution;
pub mod uazapi;

pub use evolution::EvolutionClient;
pub use uazapi::UazapiClient;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::config::{GatewayProvider, GatewaySettings};
use crate::error::{ConfigError, GatewayError};
use crate::instances::model::PairingArtifact;

/// Identity and per-instance credential for instance-scoped calls.
#[derive(Debug, Clone)]
pub struct InstanceCredentials {
    pub name: String,
    pub token: Option<String>,
}

impl InstanceCredentials {
    pub fn new(name: impl Into<String>, token: Option<String>) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }

    fn require_token(&self) -> Result<&str, GatewayError> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::MissingCredential {
                instance: self.name.clone(),
            })
    }
}

/// Result of registering a new session with the gateway.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    /// Per-instance credential for message operations.
    pub token: Option<String>,
}

/// Remote truth about a session.
#[derive(Debug, Clone)]
pub struct RemoteStatus {
    pub connected: bool,
    /// Vendor state string when one was reported (e.g. `open`, `close`).
    pub raw_state: Option<String>,
}

/// Result of a connection request.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub connected: bool,
    pub artifact: PairingArtifact,
}

/// Chat presence signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Composing,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Composing => "composing",
        }
    }
}

/// Uniform capability surface over a messaging gateway vendor.
///
/// Lifecycle calls use the administrative credential; message calls use the
/// per-instance credential where the vendor has one.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Short vendor name for logs and audit records.
    fn provider(&self) -> &'static str;

    async fn init(&self, name: &str) -> Result<InitOutcome, GatewayError>;

    async fn status(&self, instance: &InstanceCredentials) -> Result<RemoteStatus, GatewayError>;

    async fn connect(&self, instance: &InstanceCredentials)
    -> Result<ConnectOutcome, GatewayError>;

    async fn logout(&self, instance: &InstanceCredentials) -> Result<(), GatewayError>;

    async fn delete(&self, instance: &InstanceCredentials) -> Result<(), GatewayError>;

    async fn configure_webhook(
        &self,
        instance: &InstanceCredentials,
        url: &str,
    ) -> Result<(), GatewayError>;

    /// Send a text message. Returns the vendor's raw response body.
    async fn send_text(
        &self,
        instance: &InstanceCredentials,
        number: &str,
        text: &str,
    ) -> Result<Value, GatewayError>;

    async fn send_presence(
        &self,
        instance: &InstanceCredentials,
        number: &str,
        presence: Presence,
    ) -> Result<(), GatewayError>;

    /// Request body `send_text` posts, recorded in the audit trail.
    fn text_payload(&self, number: &str, text: &str) -> Value {
        serde_json::json!({ "number": clean_number(number), "text": text })
    }
}

/// Builds a gateway client for the current settings snapshot.
pub trait GatewayFactory: Send + Sync {
    fn build(&self, settings: &GatewaySettings) -> Result<Arc<dyn GatewayClient>, ConfigError>;
}

/// Factory producing the HTTP vendor clients.
pub struct HttpGatewayFactory {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpGatewayFactory {
    /// Every request made by produced clients is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http_client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { http, timeout })
    }
}

impl GatewayFactory for HttpGatewayFactory {
    fn build(&self, settings: &GatewaySettings) -> Result<Arc<dyn GatewayClient>, ConfigError> {
        let transport = HttpTransport {
            http: self.http.clone(),
            base_url: settings.base_url.clone(),
            timeout: self.timeout,
        };
        Ok(match settings.provider {
            GatewayProvider::Uazapi => {
                Arc::new(UazapiClient::new(transport, settings.admin_token.clone()))
            }
            GatewayProvider::Evolution => {
                Arc::new(EvolutionClient::new(transport, settings.admin_token.clone()))
            }
        })
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Whether a vendor state value means "session active".
///
/// Accepts the truthy synonyms `connected` / `open` (any case) and `true`.
pub fn is_connected_value(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("connected") || s.eq_ignore_ascii_case("open")
        }
        _ => false,
    }
}

/// Strip WhatsApp JID suffixes from a number.
pub fn clean_number(number: &str) -> &str {
    number
        .split_once('@')
        .map(|(local, _)| local)
        .unwrap_or(number)
}

/// Normalise a QR payload into a `data:image/png;base64,` URI.
pub fn normalize_qr(raw: &str) -> String {
    if raw.starts_with("data:") {
        raw.to_string()
    } else {
        format!("data:image/png;base64,{raw}")
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// JSON-over-HTTP transport shared by the vendor clients.
pub(crate) struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Send one request. Non-2xx responses become `Rejected` with the
    /// parsed body (JSON, or the raw text as a string).
    pub(crate) async fn request(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        headers: &[(&'static str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| self.map_send_error(operation, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.map_send_error(operation, e))?;
        let parsed = parse_body(text);

        if !status.is_success() {
            tracing::warn!(operation, status = status.as_u16(), "Gateway rejected request");
            return Err(GatewayError::Rejected {
                operation: operation.to_string(),
                status: status.as_u16(),
                body: parsed,
            });
        }
        Ok(parsed)
    }

    fn map_send_error(&self, operation: &'static str, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                operation: operation.to_string(),
                timeout: self.timeout,
            }
        } else {
            GatewayError::Unreachable {
                operation: operation.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}
