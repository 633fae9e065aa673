//! Inbound event dispatcher.
//!
//! Every delivery is recorded as a webhook event (best-effort), classified,
//! and routed: connection events to the instance state machine, message
//! events through lead handling to the automation sequencer.

pub mod payload;

pub use payload::{Classified, Envelope, EventKind, InboundMessage, classify, normalize};

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::audit::AuditTrail;
use crate::automation::{AutomationOutcome, Sequencer};
use crate::error::Result;
use crate::instances::InstanceManager;
use crate::instances::model::ConnectionStatus;
use crate::leads::{InboundRecord, LeadService};

/// Result of processing one classified event.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Connection {
        instance: Option<String>,
        /// New status, or `None` when the instance is unknown here.
        status: Option<ConnectionStatus>,
    },
    Message {
        record: Box<InboundRecord>,
        automation: AutomationOutcome,
    },
    Ignored(&'static str),
}

#[derive(Clone)]
pub struct Dispatcher {
    audit: AuditTrail,
    leads: LeadService,
    instances: Arc<InstanceManager>,
    sequencer: Arc<Sequencer>,
}

impl Dispatcher {
    pub fn new(
        audit: AuditTrail,
        leads: LeadService,
        instances: Arc<InstanceManager>,
        sequencer: Arc<Sequencer>,
    ) -> Self {
        Self {
            audit,
            leads,
            instances,
            sequencer,
        }
    }

    /// Record the raw delivery and classify it. Never fails.
    pub async fn accept(&self, raw: &Value) -> Classified {
        let envelope = normalize(raw);
        let event = if envelope.event.is_empty() {
            "unknown"
        } else {
            envelope.event.as_str()
        };
        self.audit
            .record_webhook_event(event, envelope.instance.as_deref(), raw)
            .await;
        let classified = classify(&envelope);
        debug!(event, instance = ?envelope.instance, outcome = classified.describe(), "Webhook classified");
        classified
    }

    /// Act on a classified event.
    pub async fn process(&self, classified: Classified, host: Option<&str>) -> Result<DispatchOutcome> {
        match classified {
            Classified::Connection {
                instance: Some(name),
                connected,
            } => {
                let status = self
                    .instances
                    .apply_connection_event(&name, connected)
                    .await?;
                Ok(DispatchOutcome::Connection {
                    instance: Some(name),
                    status,
                })
            }
            Classified::Connection { instance: None, .. } => {
                Ok(DispatchOutcome::Ignored("Connection event without instance"))
            }
            Classified::Message(msg) => {
                let record = self
                    .leads
                    .record_inbound(&msg.phone, msg.push_name.as_deref(), &msg.text)
                    .await?;
                info!(
                    phone = %msg.phone,
                    lead_id = %record.lead.id,
                    new_lead = record.created,
                    "Inbound message recorded"
                );
                let automation = self
                    .sequencer
                    .respond(&record.lead, msg.instance.as_deref(), host)
                    .await?;
                Ok(DispatchOutcome::Message {
                    record: Box::new(record),
                    automation,
                })
            }
            Classified::Ignored(reason) => Ok(DispatchOutcome::Ignored(reason)),
        }
    }
}
