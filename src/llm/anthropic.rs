//! Anthropic messages provider.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use super::{ChatTurn, LlmProvider, read_json, transport_error};
use crate::config::AiSettings;
use crate::error::LlmError;

const PROVIDER: &str = "anthropic";

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl AnthropicProvider {
    pub const API_VERSION: &'static str = "2023-06-01";
    pub const MAX_TOKENS: u32 = 1024;

    pub fn new(client: Client, settings: &AiSettings) -> Self {
        Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let request = json!({
            "model": self.model,
            "max_tokens": Self::MAX_TOKENS,
            "system": system,
            "messages": turns,
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", Self::API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let body = read_json(PROVIDER, response).await?;
        let text: String = body["content"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|block| block["type"] == "text")
            .filter_map(|block| block["text"].as_str())
            .collect();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "no text content blocks".to_string(),
            });
        }
        Ok(text)
    }
}
