//! Audit records — automation attempts and inbound webhook events.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default page size for audit queries.
pub const DEFAULT_AUDIT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Sent,
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(Self::Sent),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown attempt status: {other}")),
        }
    }
}

/// Write-once record of one outbound automated send attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationAttempt {
    pub id: Uuid,
    /// Recipient identity (phone number).
    pub target: String,
    /// Pipeline stage, e.g. `FIRST_CONTACT`, `AI_REPLY`, `OPERATOR`.
    pub stage: String,
    /// Attempt type within the stage, e.g. `flow_step_2`.
    #[serde(rename = "type")]
    pub kind: String,
    pub body: String,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AutomationAttempt {
    /// A successful send.
    pub fn sent(
        target: &str,
        stage: &str,
        kind: &str,
        body: &str,
        request: serde_json::Value,
        response: serde_json::Value,
        instance: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            stage: stage.to_string(),
            kind: kind.to_string(),
            body: body.to_string(),
            status: AttemptStatus::Sent,
            error: None,
            request_payload: Some(request),
            response_payload: Some(response).filter(|v| !v.is_null()),
            instance: instance.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    /// A failed send. An empty `error` is replaced so the detail is never blank.
    #[allow(clippy::too_many_arguments)]
    pub fn failed(
        target: &str,
        stage: &str,
        kind: &str,
        body: &str,
        error: String,
        request: Option<serde_json::Value>,
        response: Option<serde_json::Value>,
        instance: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            stage: stage.to_string(),
            kind: kind.to_string(),
            body: body.to_string(),
            status: AttemptStatus::Error,
            error: Some(if error.is_empty() {
                "unknown error".to_string()
            } else {
                error
            }),
            request_payload: request,
            response_payload: response,
            instance: instance.map(str::to_string),
            created_at: Utc::now(),
        }
    }
}

/// Write-once record of one inbound webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Filter for automation attempt queries. Results are newest-first.
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptFilter {
    pub stage: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<AttemptStatus>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for AttemptFilter {
    fn default() -> Self {
        Self {
            stage: None,
            kind: None,
            status: None,
            limit: DEFAULT_AUDIT_LIMIT,
        }
    }
}

/// Filter for webhook event queries. Results are newest-first.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventFilter {
    pub instance: Option<String>,
    pub event: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for WebhookEventFilter {
    fn default() -> Self {
        Self {
            instance: None,
            event: None,
            limit: DEFAULT_AUDIT_LIMIT,
        }
    }
}

fn default_limit() -> usize {
    DEFAULT_AUDIT_LIMIT
}
