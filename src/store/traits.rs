//! Unified `Database` trait — single async interface for all persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::model::{AttemptFilter, AutomationAttempt, WebhookEvent, WebhookEventFilter};
use crate::error::DatabaseError;
use crate::instances::model::{ConnectionStatus, GatewayInstance};
use crate::leads::model::{Lead, LeadStatus, Message, MessageSender};

/// Backend-agnostic database trait covering settings, instances, leads and audit.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    /// All settings as a key/value map.
    async fn list_settings(&self) -> Result<HashMap<String, String>, DatabaseError>;

    // ── Gateway instances ───────────────────────────────────────────

    /// Insert or replace an instance keyed by name.
    async fn upsert_instance(&self, instance: &GatewayInstance) -> Result<(), DatabaseError>;

    async fn get_instance(&self, name: &str) -> Result<Option<GatewayInstance>, DatabaseError>;

    async fn list_instances(&self) -> Result<Vec<GatewayInstance>, DatabaseError>;

    /// Overwrite status and sync timestamp. Returns false if no such instance.
    async fn update_instance_status(
        &self,
        name: &str,
        status: ConnectionStatus,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    async fn set_instance_webhook(&self, name: &str, configured: bool)
    -> Result<bool, DatabaseError>;

    /// Remove the local record. Returns false if it did not exist.
    async fn delete_instance(&self, name: &str) -> Result<bool, DatabaseError>;

    /// First instance currently marked CONNECTED, if any.
    async fn first_connected_instance(&self) -> Result<Option<GatewayInstance>, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Atomically find the lead for `phone` or create it as NEW.
    /// Returns the lead and whether this call created it.
    async fn find_or_create_lead(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> Result<(Lead, bool), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    async fn get_lead_by_phone(&self, phone: &str) -> Result<Option<Lead>, DatabaseError>;

    async fn list_leads(&self) -> Result<Vec<Lead>, DatabaseError>;

    async fn update_lead_status(&self, id: Uuid, status: LeadStatus)
    -> Result<bool, DatabaseError>;

    /// NEW → IN_PROGRESS. Returns true only if the lead was NEW.
    async fn promote_new_lead(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Set the first-contact marker (and NEW → IN_PROGRESS) if it is still unset.
    /// Returns true for exactly one caller per lead.
    async fn claim_first_contact(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn set_lead_intent(&self, id: Uuid, intent: Option<&str>) -> Result<bool, DatabaseError>;

    async fn set_lead_automation(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(
        &self,
        lead_id: Uuid,
        sender: MessageSender,
        content: &str,
    ) -> Result<Message, DatabaseError>;

    /// Conversation ledger for a lead, oldest first.
    async fn list_messages(&self, lead_id: Uuid) -> Result<Vec<Message>, DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    async fn insert_attempt(&self, attempt: &AutomationAttempt) -> Result<(), DatabaseError>;

    async fn list_attempts(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<AutomationAttempt>, DatabaseError>;

    /// Delete every attempt. Returns the number removed.
    async fn purge_attempts(&self) -> Result<usize, DatabaseError>;

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), DatabaseError>;

    async fn list_webhook_events(
        &self,
        filter: &WebhookEventFilter,
    ) -> Result<Vec<WebhookEvent>, DatabaseError>;

    async fn purge_webhook_events(&self) -> Result<usize, DatabaseError>;
}
