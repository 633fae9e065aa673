//! Evolution API gateway client.
//!
//! Every call authenticates with the global `apikey` header; the instance is
//! addressed by name in the path.

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{
    ConnectOutcome, GatewayClient, HttpTransport, InitOutcome, InstanceCredentials, Presence,
    RemoteStatus, clean_number, is_connected_value, non_empty_str, normalize_qr,
};
use crate::error::GatewayError;
use crate::instances::model::PairingArtifact;

const INTEGRATION: &str = "WHATSAPP-BAILEYS";

const WEBHOOK_EVENTS: [&str; 5] = [
    "QRCODE_UPDATED",
    "CONNECTION_UPDATE",
    "MESSAGES_UPSERT",
    "MESSAGES_UPDATE",
    "SEND_MESSAGE",
];

pub struct EvolutionClient {
    transport: HttpTransport,
    api_key: SecretString,
}

impl EvolutionClient {
    pub(crate) fn new(transport: HttpTransport, api_key: SecretString) -> Self {
        Self { transport, api_key }
    }

    async fn call(
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
                &[("apikey", self.api_key.expose_secret())],
                body,
            )
            .await
    }
}

/// Find the entry for `name` in a `fetchInstances` response and return its state.
fn instance_state<'a>(data: &'a Value, name: &str) -> Option<&'a Value> {
    let entry = match data {
        Value::Array(items) => items.iter().find(|item| {
            item["instance"]["instanceName"].as_str() == Some(name)
                || item["name"].as_str() == Some(name)
        })?,
        other => other,
    };
    [
        &entry["instance"]["state"],
        &entry["state"],
        &entry["connectionStatus"],
    ]
    .into_iter()
    .find(|v| !v.is_null())
}

#[async_trait]
impl GatewayClient for EvolutionClient {
    fn provider(&self) -> &'static str {
        "evolution"
    }

    async fn init(&self, name: &str) -> Result<InitOutcome, GatewayError> {
        let token = Uuid::new_v4().simple().to_string();
        let body = json!({
            "instanceName": name,
            "token": token,
            "integration": INTEGRATION,
        });
        self.call("init", Method::POST, "/instance/create", Some(&body))
            .await?;
        Ok(InitOutcome { token: Some(token) })
    }

    async fn status(&self, instance: &InstanceCredentials) -> Result<RemoteStatus, GatewayError> {
        let path = format!("/instance/fetchInstances?instanceName={}", instance.name);
        let data = self.call("status", Method::GET, &path, None).await?;
        let state = instance_state(&data, &instance.name).ok_or_else(|| {
            GatewayError::InvalidResponse {
                operation: "status".to_string(),
                reason: format!("instance {} not reported by gateway", instance.name),
            }
        })?;
        Ok(RemoteStatus {
            connected: is_connected_value(state),
            raw_state: state.as_str().map(str::to_string),
        })
    }

    async fn connect(
        &self,
        instance: &InstanceCredentials,
    ) -> Result<ConnectOutcome, GatewayError> {
        let path = format!("/instance/connect/{}", instance.name);
        let data = self.call("connect", Method::GET, &path, None).await?;
        let connected = is_connected_value(&data["instance"]["state"]);
        Ok(ConnectOutcome {
            connected,
            artifact: PairingArtifact {
                qr_code: non_empty_str(data.get("base64"))
                    .as_deref()
                    .map(normalize_qr),
                pairing_code: non_empty_str(data.get("pairingCode")),
            },
        })
    }

    async fn logout(&self, instance: &InstanceCredentials) -> Result<(), GatewayError> {
        let path = format!("/instance/logout/{}", instance.name);
        self.call("logout", Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn delete(&self, instance: &InstanceCredentials) -> Result<(), GatewayError> {
        let path = format!("/instance/delete/{}", instance.name);
        self.call("delete", Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn configure_webhook(
        &self,
        instance: &InstanceCredentials,
        url: &str,
    ) -> Result<(), GatewayError> {
        let path = format!("/webhook/set/{}", instance.name);
        let body = json!({
            "enabled": true,
            "url": url,
            "webhook_by_events": false,
            "events": WEBHOOK_EVENTS,
        });
        self.call("configure_webhook", Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    async fn send_text(
        &self,
        instance: &InstanceCredentials,
        number: &str,
        text: &str,
    ) -> Result<Value, GatewayError> {
        let path = format!("/message/sendText/{}", instance.name);
        let body = self.text_payload(number, text);
        self.call("send_text", Method::POST, &path, Some(&body)).await
    }

    async fn send_presence(
        &self,
        instance: &InstanceCredentials,
        number: &str,
        presence: Presence,
    ) -> Result<(), GatewayError> {
        let path = format!("/chat/sendPresence/{}", instance.name);
        let body = json!({ "number": clean_number(number), "presence": presence.as_str() });
        self.call("send_presence", Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    fn text_payload(&self, number: &str, text: &str) -> Value {
        json!({ "number": clean_number(number), "text": text, "linkPreview": true })
    }
}
