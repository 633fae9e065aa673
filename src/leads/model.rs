//! Lead data model — contact records and the conversation ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Business status of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    InProgress,
    Scheduled,
    Archived,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Scheduled => "SCHEDULED",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SCHEDULED" => Ok(Self::Scheduled),
            "ARCHIVED" => Ok(Self::Archived),
            other => Err(format!("unknown lead status: {other}")),
        }
    }
}

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSender {
    Lead,
    Bot,
    Operator,
}

impl MessageSender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "LEAD",
            Self::Bot => "BOT",
            Self::Operator => "OPERATOR",
        }
    }
}

impl FromStr for MessageSender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LEAD" => Ok(Self::Lead),
            "BOT" => Ok(Self::Bot),
            "OPERATOR" => Ok(Self::Operator),
            other => Err(format!("unknown message sender: {other}")),
        }
    }
}

/// Contact record for one phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    /// Digits-only phone number, unique across leads.
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: LeadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Whether automated replies may be sent to this lead.
    pub automation_enabled: bool,
    /// Set once the first inbound contact has been handled (flow run or operator reply).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_contact_handled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry in a lead's append-only conversation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub sender: MessageSender,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
