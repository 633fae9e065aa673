//! Delivery log and audit trail.
//!
//! Writes are isolated from the primary path: a failed audit write is
//! logged and swallowed, never returned to the caller.

pub mod model;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;
use model::{AttemptFilter, AutomationAttempt, WebhookEvent, WebhookEventFilter};

#[derive(Clone)]
pub struct AuditTrail {
    db: Arc<dyn Database>,
}

impl AuditTrail {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append one attempt record (best-effort).
    pub async fn record_attempt(&self, attempt: &AutomationAttempt) {
        match self.db.insert_attempt(attempt).await {
            Ok(()) => debug!(
                target_phone = %attempt.target,
                stage = %attempt.stage,
                kind = %attempt.kind,
                status = attempt.status.as_str(),
                "Attempt recorded"
            ),
            Err(e) => warn!(
                target_phone = %attempt.target,
                kind = %attempt.kind,
                "Failed to record automation attempt: {e}"
            ),
        }
    }

    /// Append one inbound webhook record (best-effort).
    pub async fn record_webhook_event(
        &self,
        event: &str,
        instance: Option<&str>,
        payload: &serde_json::Value,
    ) {
        let record = WebhookEvent {
            id: Uuid::new_v4(),
            event: event.to_string(),
            instance: instance.map(str::to_string),
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_webhook_event(&record).await {
            warn!(event, "Failed to record webhook event: {e}");
        }
    }

    pub async fn attempts(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<AutomationAttempt>, DatabaseError> {
        self.db.list_attempts(filter).await
    }

    pub async fn purge_attempts(&self) -> Result<usize, DatabaseError> {
        self.db.purge_attempts().await
    }

    pub async fn webhook_events(
        &self,
        filter: &WebhookEventFilter,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        self.db.list_webhook_events(filter).await
    }

    pub async fn purge_webhook_events(&self) -> Result<usize, DatabaseError> {
        self.db.purge_webhook_events().await
    }
}
