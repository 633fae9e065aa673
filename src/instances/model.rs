//! Gateway instance data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection lifecycle of a gateway session.
///
/// NOT_CREATED → DISCONNECTED → CONNECTING → CONNECTED; a logout collapses
/// back to DISCONNECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    NotCreated,
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotCreated => "NOT_CREATED",
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }

    pub fn from_connected(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_CREATED" => Ok(Self::NotCreated),
            "DISCONNECTED" => Ok(Self::Disconnected),
            "CONNECTING" => Ok(Self::Connecting),
            "CONNECTED" => Ok(Self::Connected),
            other => Err(format!("unknown connection status: {other}")),
        }
    }
}

/// One managed session registered with the messaging gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInstance {
    pub id: Uuid,
    /// Gateway-side instance name, unique locally.
    pub name: String,
    pub display_name: String,
    /// Per-instance credential issued by the gateway on registration.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub status: ConnectionStatus,
    pub webhook_configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GatewayInstance {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_name: name.clone(),
            name,
            token: None,
            status: ConnectionStatus::NotCreated,
            webhook_configured: false,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Pairing artifact returned by a connection request.
///
/// Externally time-limited (~40s); callers re-request instead of tracking expiry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingArtifact {
    /// QR image as a `data:image/png;base64,` URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_starts_not_created() {
        let inst = GatewayInstance::new("main");
        assert_eq!(inst.status, ConnectionStatus::NotCreated);
        assert_eq!(inst.display_name, "main");
        assert!(!inst.webhook_configured);
    }

    #[test]
    fn token_is_never_serialized() {
        let mut inst = GatewayInstance::new("main");
        inst.token = Some("secret".into());
        let json = serde_json::to_value(&inst).unwrap();
        assert!(json.get("token").is_none());
        assert_eq!(json["status"], "NOT_CREATED");
    }
}
