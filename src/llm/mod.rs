//! Language-model collaborator.
//!
//! Supports:
//! - **OpenAI**: `/v1/chat/completions`
//! - **Anthropic**: `/v1/messages`
//!
//! Both are plain reqwest clients behind the [`LlmProvider`] trait. Providers
//! are built per operation by an [`LlmFactory`] from the settings snapshot.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AiProvider, AiSettings};
use crate::error::{ConfigError, LlmError};
use crate::leads::model::{Message, MessageSender};

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of the conversation history sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Map a lead's ledger onto chat turns: the contact speaks as `user`, the
/// business (bot or operator) as `assistant`.
pub fn history_from_messages(messages: &[Message]) -> Vec<ChatTurn> {
    messages
        .iter()
        .map(|m| match m.sender {
            MessageSender::Lead => ChatTurn::user(&m.content),
            MessageSender::Bot | MessageSender::Operator => ChatTurn::assistant(&m.content),
        })
        .collect()
}

/// Chat-completion capability of a language-model provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// One assistant utterance for `system` plus `turns`.
    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, LlmError>;
}

/// Builds a provider for the current settings snapshot.
pub trait LlmFactory: Send + Sync {
    fn build(&self, settings: &AiSettings) -> Result<Arc<dyn LlmProvider>, ConfigError>;
}

/// Factory producing the HTTP providers.
pub struct HttpLlmFactory {
    http: reqwest::Client,
}

impl HttpLlmFactory {
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http_client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }
}

impl LlmFactory for HttpLlmFactory {
    fn build(&self, settings: &AiSettings) -> Result<Arc<dyn LlmProvider>, ConfigError> {
        let provider: Arc<dyn LlmProvider> = match settings.provider {
            AiProvider::OpenAi => Arc::new(OpenAiProvider::new(self.http.clone(), settings)),
            AiProvider::Anthropic => Arc::new(AnthropicProvider::new(self.http.clone(), settings)),
        };
        tracing::debug!(model = provider.model_name(), "Language model provider ready");
        Ok(provider)
    }
}

const REFINE_DIRECTIVE: &str = "You are a prompt engineering expert. Rewrite the system prompt \
     so the assistant's replies better satisfy the user's feedback, using the conversation as \
     context. Return ONLY the rewritten prompt, without explanations.";

/// Ask the model for a rewritten system directive that addresses `feedback`.
pub async fn refine_directive(
    provider: &dyn LlmProvider,
    current: &str,
    turns: &[ChatTurn],
    feedback: &str,
) -> Result<String, LlmError> {
    let transcript = turns
        .iter()
        .map(|t| {
            let role = match t.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            format!("{role}: {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let request = format!(
        "Current prompt: {current}\n\nConversation:\n{transcript}\n\nUser feedback: {feedback}\n\n\
         Rewrite the prompt to address the feedback."
    );
    let rewritten = provider
        .complete(REFINE_DIRECTIVE, &[ChatTurn::user(request)])
        .await?;
    Ok(rewritten.trim().to_string())
}

/// Split a first-turn reply into separate messages on lines holding only `---`.
pub fn split_reply(reply: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    for line in reply.lines() {
        if line.trim() == "---" {
            parts.push(current.join("\n"));
            current.clear();
        } else {
            current.push(line);
        }
    }
    parts.push(current.join("\n"));
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Map a reqwest transport error onto `LlmError`.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Read a response body, turning non-2xx statuses into `LlmError::Api`.
pub(crate) async fn read_json(
    provider: &str,
    response: reqwest::Response,
) -> Result<serde_json::Value, LlmError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| transport_error(provider, e))?;
    let body =
        serde_json::from_str(&text).unwrap_or_else(|_| serde_json::Value::String(text.clone()));
    if !status.is_success() {
        return Err(LlmError::Api {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}
