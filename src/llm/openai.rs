//! OpenAI chat-completions provider.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use super::{ChatTurn, LlmProvider, read_json, transport_error};
use crate::config::AiSettings;
use crate::error::LlmError;

const PROVIDER: &str = "openai";

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiProvider {
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
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut messages = vec![json!({ "role": "system", "content": system })];
        messages.extend(turns.iter().map(|t| json!(t)));

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&json!({ "model": self.model, "messages": messages }))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let body = read_json(PROVIDER, response).await?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "missing choices[0].message.content".to_string(),
            })
    }
}
