//! Configuration types.
//!
//! Two layers: [`ServerConfig`] is process configuration read once from the
//! environment; [`Settings`] is a snapshot of the `settings` table loaded
//! fresh for every operation and passed down explicitly.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{ConfigError, DatabaseError};
use crate::store::Database;

/// Setting keys understood by the core.
pub mod keys {
    pub const AI_ENABLED: &str = "AI_ENABLED";
    pub const FLOW_INTERVAL: &str = "FLOW_INTERVAL";
    pub const FLOW_TYPING_MS: &str = "FLOW_TYPING_MS";
    pub const FLOW_STEPS: &str = "FLOW_STEPS";
    /// Prefix of the per-step template keys (`FLOW_MSG_1`, `FLOW_MSG_2`, ...).
    pub const FLOW_MSG_PREFIX: &str = "FLOW_MSG_";
    pub const FLOW_ACK_MESSAGE: &str = "FLOW_ACK_MESSAGE";
    pub const PUBLIC_BASE_URL: &str = "PUBLIC_BASE_URL";
    pub const WEBHOOK_URL: &str = "WEBHOOK_URL";
    pub const GATEWAY_PROVIDER: &str = "GATEWAY_PROVIDER";
    pub const GATEWAY_URL: &str = "GATEWAY_URL";
    pub const GATEWAY_ADMIN_TOKEN: &str = "GATEWAY_ADMIN_TOKEN";
    pub const AI_PROVIDER: &str = "AI_PROVIDER";
    pub const AI_TOKEN: &str = "AI_TOKEN";
    pub const AI_MODEL: &str = "AI_MODEL";
    pub const AI_PROMPT: &str = "AI_PROMPT";
    /// Optional override of the provider's API base URL.
    pub const AI_BASE_URL: &str = "AI_BASE_URL";
}

/// Environment prefix used to bootstrap settings on startup.
pub const SETTING_ENV_PREFIX: &str = "LEADFLOW_SETTING_";

const DEFAULT_FLOW_INTERVAL_SECS: u64 = 5;
const DEFAULT_TYPING_MS: u64 = 1500;
const DEFAULT_FLOW_STEPS: usize = 3;
const MAX_FLOW_STEPS: usize = 20;

const DEFAULT_TEMPLATES: [&str; 3] = [
    "Hello! Thanks for reaching out. We're glad to hear from you.",
    "You can book a free trial class here: {LINK_AULA}",
    "Any questions, just reply here. We'll be in touch shortly!",
];

const DEFAULT_ACK_MESSAGE: &str =
    "Thanks for your message! One of our team members will get back to you soon.";

const DEFAULT_AI_PROMPT: &str = "You are a friendly assistant answering WhatsApp messages for a \
     small sports school. Keep replies short, warm and helpful, and invite the contact to book \
     a trial class.";

// ── Process configuration ───────────────────────────────────────────

/// Process-level configuration read from `LEADFLOW_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Upper bound for every outbound HTTP call.
    pub http_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            db_path: PathBuf::from("./data/leadflow.db"),
            http_timeout: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = std::env::var("LEADFLOW_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);
        let db_path = std::env::var("LEADFLOW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let http_timeout = std::env::var("LEADFLOW_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);
        Self {
            port,
            db_path,
            http_timeout,
        }
    }
}

/// Write `LEADFLOW_SETTING_<KEY>` environment variables into the settings
/// table for keys that are not set yet. Returns how many were written.
pub async fn seed_settings_from_env(db: &dyn Database) -> Result<usize, DatabaseError> {
    let vars = std::env::vars().filter_map(|(name, value)| {
        name.strip_prefix(SETTING_ENV_PREFIX)
            .map(|key| (key.to_string(), value))
    });
    seed_settings(db, vars).await
}

/// Insert each pair whose key is absent from the store.
pub async fn seed_settings(
    db: &dyn Database,
    pairs: impl IntoIterator<Item = (String, String)>,
) -> Result<usize, DatabaseError> {
    let mut seeded = 0;
    for (key, value) in pairs {
        if key.is_empty() || db.get_setting(&key).await?.is_some() {
            continue;
        }
        db.set_setting(&key, &value).await?;
        tracing::info!(key = %key, "Seeded setting from environment");
        seeded += 1;
    }
    Ok(seeded)
}

// ── Settings snapshot ───────────────────────────────────────────────

/// Immutable view of the configuration store for one operation.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    /// Read every setting from the store.
    pub async fn load(db: &dyn Database) -> Result<Self, DatabaseError> {
        Ok(Self {
            values: db.list_settings().await?,
        })
    }

    #[cfg(test)]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Trimmed, non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = raw, "Ignoring unparseable setting");
                default
            }),
            None => default,
        }
    }

    /// Whether the AI-assisted branch is active (otherwise the static flow runs).
    pub fn ai_enabled(&self) -> bool {
        self.get(keys::AI_ENABLED).is_some_and(parse_bool)
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.get(keys::WEBHOOK_URL)
    }

    pub fn public_base_url(&self) -> Option<&str> {
        self.get(keys::PUBLIC_BASE_URL)
            .map(|u| u.trim_end_matches('/'))
    }

    pub fn flow(&self) -> FlowSettings {
        let steps = self
            .parse_or(keys::FLOW_STEPS, DEFAULT_FLOW_STEPS)
            .min(MAX_FLOW_STEPS);
        let templates = (1..=steps)
            .filter_map(|n| {
                self.get(&format!("{}{n}", keys::FLOW_MSG_PREFIX))
                    .map(str::to_string)
                    .or_else(|| DEFAULT_TEMPLATES.get(n - 1).map(|t| t.to_string()))
            })
            .collect();

        FlowSettings {
            interval: Duration::from_secs(
                self.parse_or(keys::FLOW_INTERVAL, DEFAULT_FLOW_INTERVAL_SECS),
            ),
            typing: Duration::from_millis(self.parse_or(keys::FLOW_TYPING_MS, DEFAULT_TYPING_MS)),
            templates,
            ack_message: self
                .get(keys::FLOW_ACK_MESSAGE)
                .unwrap_or(DEFAULT_ACK_MESSAGE)
                .to_string(),
        }
    }

    /// Gateway connection settings. Fails fast when the base URL or admin
    /// credential is missing.
    pub fn gateway(&self) -> Result<GatewaySettings, ConfigError> {
        let provider = match self.get(keys::GATEWAY_PROVIDER) {
            Some(raw) => raw.parse()?,
            None => GatewayProvider::Uazapi,
        };
        let base_url = self
            .get(keys::GATEWAY_URL)
            .ok_or_else(|| ConfigError::MissingRequired {
                key: keys::GATEWAY_URL.to_string(),
                hint: "Set the messaging gateway base URL in settings.".to_string(),
            })?
            .trim_end_matches('/')
            .to_string();
        let admin_token =
            self.get(keys::GATEWAY_ADMIN_TOKEN)
                .ok_or_else(|| ConfigError::MissingRequired {
                    key: keys::GATEWAY_ADMIN_TOKEN.to_string(),
                    hint: "Set the gateway administrative token in settings.".to_string(),
                })?;
        Ok(GatewaySettings {
            provider,
            base_url,
            admin_token: SecretString::from(admin_token.to_string()),
        })
    }

    /// Language-model settings. Fails fast when no API token is configured.
    pub fn ai(&self) -> Result<AiSettings, ConfigError> {
        let provider = match self.get(keys::AI_PROVIDER) {
            Some(raw) => raw.parse()?,
            None => AiProvider::OpenAi,
        };
        let token = self
            .get(keys::AI_TOKEN)
            .ok_or_else(|| ConfigError::MissingRequired {
                key: keys::AI_TOKEN.to_string(),
                hint: "Set the language-model API token in settings.".to_string(),
            })?;
        Ok(AiSettings {
            provider,
            api_key: SecretString::from(token.to_string()),
            model: self
                .get(keys::AI_MODEL)
                .unwrap_or(provider.default_model())
                .to_string(),
            base_url: self
                .get(keys::AI_BASE_URL)
                .unwrap_or(provider.default_base_url())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// System directive for the AI branch.
    pub fn ai_prompt(&self) -> &str {
        self.get(keys::AI_PROMPT).unwrap_or(DEFAULT_AI_PROMPT)
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Static-flow parameters.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Delay between consecutive flow messages.
    pub interval: Duration,
    /// Typing simulation before each send.
    pub typing: Duration,
    /// Raw templates in send order (tokens not yet substituted).
    pub templates: Vec<String>,
    pub ack_message: String,
}

// ── Gateway ─────────────────────────────────────────────────────────

/// Supported messaging gateway vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayProvider {
    Uazapi,
    Evolution,
}

impl fmt::Display for GatewayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uazapi => "uazapi",
            Self::Evolution => "evolution",
        })
    }
}

impl FromStr for GatewayProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uazapi" => Ok(Self::Uazapi),
            "evolution" => Ok(Self::Evolution),
            other => Err(ConfigError::InvalidValue {
                key: keys::GATEWAY_PROVIDER.to_string(),
                message: format!("unknown provider '{other}' (expected uazapi or evolution)"),
            }),
        }
    }
}

/// Resolved gateway configuration for one operation.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub provider: GatewayProvider,
    pub base_url: String,
    pub admin_token: SecretString,
}

// ── Language model ──────────────────────────────────────────────────

/// Supported language-model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    OpenAi,
    Anthropic,
}

impl AiProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Anthropic => "claude-3-5-sonnet-20240620",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
        }
    }
}

impl FromStr for AiProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(ConfigError::InvalidValue {
                key: keys::AI_PROVIDER.to_string(),
                message: format!("unknown provider '{other}' (expected openai or anthropic)"),
            }),
        }
    }
}

/// Resolved language-model configuration for one operation.
#[derive(Debug, Clone)]
pub struct AiSettings {
    pub provider: AiProvider,
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}
