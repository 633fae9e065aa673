//! UazAPI gateway client.
//!
//! Admin endpoints authenticate with the `admintoken` header; instance
//! endpoints with the per-instance `token` header.

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::{
    ConnectOutcome, GatewayClient, HttpTransport, InitOutcome, InstanceCredentials, Presence,
    RemoteStatus, clean_number, is_connected_value, non_empty_str, normalize_qr,
};
use crate::error::GatewayError;
use crate::instances::model::PairingArtifact;

const WEBHOOK_EVENTS: [&str; 2] = ["messages", "connection"];

/// Presence indicator duration hint, in milliseconds.
const PRESENCE_DELAY_MS: u64 = 3000;

pub struct UazapiClient {
    transport: HttpTransport,
    admin_token: SecretString,
}

impl UazapiClient {
    pub(crate) fn new(transport: HttpTransport, admin_token: SecretString) -> Self {
        Self {
            transport,
            admin_token,
        }
    }

    async fn admin(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        self.transport
            .request(
                operation,
                method,
                path,
                &[("admintoken", self.admin_token.expose_secret())],
                body,
            )
            .await
    }

    async fn instance(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        creds: &InstanceCredentials,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let token = creds.require_token()?;
        self.transport
            .request(operation, method, path, &[("token", token)], body)
            .await
    }
}

/// `{instance: {status}, status: {connected, loggedIn}}` in any combination.
fn reports_connected(data: &Value) -> bool {
    let status = &data["status"];
    is_connected_value(&status["connected"])
        || is_connected_value(&status["loggedIn"])
        || is_connected_value(&data["instance"]["status"])
        || is_connected_value(&data["connected"])
}

#[async_trait]
impl GatewayClient for UazapiClient {
    fn provider(&self) -> &'static str {
        "uazapi"
    }

    async fn init(&self, name: &str) -> Result<InitOutcome, GatewayError> {
        let body = json!({ "name": name, "systemName": name });
        let data = self
            .admin("init", Method::POST, "/instance/init", Some(&body))
            .await?;
        let token = non_empty_str(data.get("token")).ok_or_else(|| {
            GatewayError::InvalidResponse {
                operation: "init".to_string(),
                reason: "response carries no instance token".to_string(),
            }
        })?;
        Ok(InitOutcome { token: Some(token) })
    }

    async fn status(&self, instance: &InstanceCredentials) -> Result<RemoteStatus, GatewayError> {
        let data = self
            .instance("status", Method::GET, "/instance/status", instance, None)
            .await?;
        Ok(RemoteStatus {
            connected: reports_connected(&data),
            raw_state: non_empty_str(data["instance"].get("status")),
        })
    }

    async fn connect(
        &self,
        instance: &InstanceCredentials,
    ) -> Result<ConnectOutcome, GatewayError> {
        let data = self
            .instance("connect", Method::POST, "/instance/connect", instance, None)
            .await?;
        let inst = &data["instance"];
        let qr = non_empty_str(inst.get("qrcode"))
            .or_else(|| non_empty_str(data.get("qrcode")))
            .or_else(|| non_empty_str(data.get("base64")));
        let pairing_code =
            non_empty_str(inst.get("paircode")).or_else(|| non_empty_str(data.get("paircode")));

        Ok(ConnectOutcome {
            connected: reports_connected(&data),
            artifact: PairingArtifact {
                qr_code: qr.as_deref().map(normalize_qr),
                pairing_code,
            },
        })
    }

    async fn logout(&self, instance: &InstanceCredentials) -> Result<(), GatewayError> {
        self.instance("logout", Method::POST, "/instance/disconnect", instance, None)
            .await?;
        Ok(())
    }

    async fn delete(&self, instance: &InstanceCredentials) -> Result<(), GatewayError> {
        self.instance("delete", Method::DELETE, "/instance", instance, None)
            .await?;
        Ok(())
    }

    async fn configure_webhook(
        &self,
        instance: &InstanceCredentials,
        url: &str,
    ) -> Result<(), GatewayError> {
        let body = json!({ "enabled": true, "url": url, "events": WEBHOOK_EVENTS });
        self.instance(
            "configure_webhook",
            Method::POST,
            "/webhook",
            instance,
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn send_text(
        &self,
        instance: &InstanceCredentials,
        number: &str,
        text: &str,
    ) -> Result<Value, GatewayError> {
        let body = self.text_payload(number, text);
        self.instance("send_text", Method::POST, "/send/text", instance, Some(&body))
            .await
    }

    async fn send_presence(
        &self,
        instance: &InstanceCredentials,
        number: &str,
        presence: Presence,
    ) -> Result<(), GatewayError> {
        let body = json!({
            "number": clean_number(number),
            "presence": presence.as_str(),
            "delay": PRESENCE_DELAY_MS,
        });
        self.instance(
            "send_presence",
            Method::POST,
            "/message/presence",
            instance,
            Some(&body),
        )
        .await?;
        Ok(())
    }
}
