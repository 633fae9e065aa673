//! Instance connection state machine.
//!
//! Owns the lifecycle and persisted status of each gateway session. Local
//! state is only written after the remote call succeeds, except `delete`,
//! whose local cleanup is unconditional.

pub mod model;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::gateway::{GatewayClient, GatewayFactory, InstanceCredentials};
use crate::store::Database;
use model::{ConnectionStatus, GatewayInstance, PairingArtifact};

/// Outcome of a connection request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub status: ConnectionStatus,
    #[serde(flatten)]
    pub artifact: PairingArtifact,
}

pub struct InstanceManager {
    db: Arc<dyn Database>,
    gateways: Arc<dyn GatewayFactory>,
}

impl InstanceManager {
    pub fn new(db: Arc<dyn Database>, gateways: Arc<dyn GatewayFactory>) -> Self {
        Self { db, gateways }
    }

    async fn settings(&self) -> Result<Settings> {
        Ok(Settings::load(self.db.as_ref()).await?)
    }

    fn client(&self, settings: &Settings) -> Result<Arc<dyn GatewayClient>> {
        let gateway = settings.gateway()?;
        Ok(self.gateways.build(&gateway)?)
    }

    async fn require(&self, name: &str) -> Result<GatewayInstance> {
        self.db
            .get_instance(name)
            .await?
            .ok_or_else(|| Error::not_found("instance", name))
    }

    fn credentials(instance: &GatewayInstance) -> InstanceCredentials {
        InstanceCredentials::new(&instance.name, instance.token.clone())
    }

    /// Register a session with the gateway and persist it as DISCONNECTED.
    ///
    /// When `WEBHOOK_URL` is configured the callback is installed too; a
    /// webhook failure does not fail registration.
    pub async fn register(&self, name: &str) -> Result<GatewayInstance> {
        validate_name(name)?;
        let settings = self.settings().await?;
        let client = self.client(&settings)?;

        let outcome = client.init(name).await?;

        let mut instance = match self.db.get_instance(name).await? {
            Some(existing) => existing,
            None => GatewayInstance::new(name),
        };
        instance.token = outcome.token;
        instance.status = ConnectionStatus::Disconnected;
        instance.webhook_configured = false;
        self.db.upsert_instance(&instance).await?;
        info!(instance = %name, provider = client.provider(), "Instance registered");

        if let Some(url) = settings.webhook_url() {
            match client
                .configure_webhook(&Self::credentials(&instance), url)
                .await
            {
                Ok(()) => {
                    self.db.set_instance_webhook(name, true).await?;
                    instance.webhook_configured = true;
                }
                Err(e) => warn!(instance = %name, "Webhook configuration failed: {e}"),
            }
        }

        Ok(instance)
    }

    /// Ask the gateway for a pairing artifact.
    ///
    /// Returns CONNECTED without an artifact if a session is already active.
    pub async fn request_connection(&self, name: &str) -> Result<ConnectionRequest> {
        let instance = self.require(name).await?;
        let settings = self.settings().await?;
        let client = self.client(&settings)?;

        let outcome = client.connect(&Self::credentials(&instance)).await?;
        let status = if outcome.connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Connecting
        };
        let synced = outcome.connected.then(Utc::now);
        self.db.update_instance_status(name, status, synced).await?;
        info!(instance = %name, status = %status, "Connection requested");

        Ok(ConnectionRequest {
            status,
            artifact: if outcome.connected {
                PairingArtifact::default()
            } else {
                outcome.artifact
            },
        })
    }

    /// Overwrite local status with the gateway's view.
    pub async fn sync_status(&self, name: &str) -> Result<GatewayInstance> {
        let instance = self.require(name).await?;
        let settings = self.settings().await?;
        let client = self.client(&settings)?;

        let remote = client.status(&Self::credentials(&instance)).await?;
        let status = ConnectionStatus::from_connected(remote.connected);
        self.db
            .update_instance_status(name, status, Some(Utc::now()))
            .await?;
        info!(
            instance = %name,
            status = %status,
            raw_state = remote.raw_state.as_deref().unwrap_or("-"),
            "Instance status synced"
        );
        self.require(name).await
    }

    pub async fn logout(&self, name: &str) -> Result<GatewayInstance> {
        let instance = self.require(name).await?;
        let settings = self.settings().await?;
        let client = self.client(&settings)?;

        client.logout(&Self::credentials(&instance)).await?;
        self.db
            .update_instance_status(name, ConnectionStatus::Disconnected, Some(Utc::now()))
            .await?;
        info!(instance = %name, "Instance logged out");
        self.require(name).await
    }

    /// Remove the instance. The remote delete is attempted and its outcome
    /// logged; the local record is removed either way.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let instance = self.require(name).await?;

        let remote = match self.settings().await {
            Ok(settings) => match self.client(&settings) {
                Ok(client) => client
                    .delete(&Self::credentials(&instance))
                    .await
                    .map_err(Error::from),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match remote {
            Ok(()) => info!(instance = %name, "Remote instance deleted"),
            Err(e) => warn!(instance = %name, "Remote delete failed, removing locally: {e}"),
        }

        self.db.delete_instance(name).await?;
        info!(instance = %name, "Instance removed");
        Ok(())
    }

    /// Point the gateway's callback at `url`, or at `WEBHOOK_URL` when absent.
    pub async fn configure_webhook(
        &self,
        name: &str,
        url: Option<&str>,
    ) -> Result<GatewayInstance> {
        let instance = self.require(name).await?;
        let settings = self.settings().await?;
        let url = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .or_else(|| settings.webhook_url())
            .ok_or_else(|| {
                Error::Validation("no webhook URL given and WEBHOOK_URL is not set".to_string())
            })?
            .to_string();
        let client = self.client(&settings)?;

        client
            .configure_webhook(&Self::credentials(&instance), &url)
            .await?;
        self.db.set_instance_webhook(name, true).await?;
        info!(instance = %name, url = %url, "Webhook configured");
        self.require(name).await
    }

    /// Apply a connection event from the webhook. Unknown instances are
    /// ignored and yield `None`.
    pub async fn apply_connection_event(
        &self,
        name: &str,
        connected: bool,
    ) -> Result<Option<ConnectionStatus>> {
        let status = ConnectionStatus::from_connected(connected);
        let updated = self
            .db
            .update_instance_status(name, status, Some(Utc::now()))
            .await?;
        if updated {
            info!(instance = %name, status = %status, "Connection event applied");
            Ok(Some(status))
        } else {
            warn!(instance = %name, "Connection event for unknown instance");
            Ok(None)
        }
    }

    pub async fn get(&self, name: &str) -> Result<GatewayInstance> {
        self.require(name).await
    }

    pub async fn list(&self) -> Result<Vec<GatewayInstance>> {
        Ok(self.db.list_instances().await?)
    }

    /// First instance currently CONNECTED, used by send paths.
    pub async fn connected_instance(&self) -> Result<Option<GatewayInstance>> {
        Ok(self.db.first_connected_instance().await?)
    }
}

/// Instance names travel in vendor URL paths.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid instance name '{name}': use 1-64 letters, digits, '-' or '_'"
        )))
    }
}
