//! Outbound send path shared by every automated and operator message.
//!
//! Each send produces exactly one audit record; a successful send is also
//! appended to the lead's conversation.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::audit::model::AutomationAttempt;
use crate::error::{Error, Result};
use crate::gateway::{GatewayClient, InstanceCredentials};
use crate::leads::LeadService;
use crate::leads::model::{Lead, Message, MessageSender};

/// One message to send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub stage: &'static str,
    pub kind: String,
    pub body: String,
    pub sender: MessageSender,
}

#[derive(Clone)]
pub struct Outbox {
    audit: AuditTrail,
    leads: LeadService,
}

impl Outbox {
    pub fn new(audit: AuditTrail, leads: LeadService) -> Self {
        Self { audit, leads }
    }

    /// Send `delivery` to `lead`, audit the attempt, and on success append
    /// the message to the conversation.
    ///
    /// Once the gateway accepted the message the send counts as done. A
    /// failed conversation append is logged and the returned message is not
    /// persisted.
    pub async fn deliver(
        &self,
        gateway: &dyn GatewayClient,
        instance: &InstanceCredentials,
        lead: &Lead,
        delivery: &Delivery,
    ) -> Result<Message> {
        let request = gateway.text_payload(&lead.phone, &delivery.body);

        match gateway
            .send_text(instance, &lead.phone, &delivery.body)
            .await
        {
            Ok(response) => {
                self.audit
                    .record_attempt(&AutomationAttempt::sent(
                        &lead.phone,
                        delivery.stage,
                        &delivery.kind,
                        &delivery.body,
                        request,
                        response,
                        Some(&instance.name),
                    ))
                    .await;
                info!(
                    phone = %lead.phone,
                    instance = %instance.name,
                    stage = delivery.stage,
                    kind = %delivery.kind,
                    "Message sent"
                );
                match self
                    .leads
                    .append(lead.id, delivery.sender, &delivery.body)
                    .await
                {
                    Ok(message) => Ok(message),
                    Err(e) => {
                        warn!(
                            phone = %lead.phone,
                            "Sent message not recorded in conversation: {e}"
                        );
                        Ok(Message {
                            id: Uuid::new_v4(),
                            lead_id: lead.id,
                            sender: delivery.sender,
                            content: delivery.body.clone(),
                            created_at: Utc::now(),
                        })
                    }
                }
            }
            Err(e) => {
                let err = Error::from(e);
                warn!(
                    phone = %lead.phone,
                    instance = %instance.name,
                    kind = %delivery.kind,
                    "Send failed: {err}"
                );
                self.audit
                    .record_attempt(&AutomationAttempt::failed(
                        &lead.phone,
                        delivery.stage,
                        &delivery.kind,
                        &delivery.body,
                        err.to_string(),
                        Some(request),
                        err.provider_payload().cloned(),
                        Some(&instance.name),
                    ))
                    .await;
                Err(err)
            }
        }
    }

    /// Audit a failure that happened before anything could be sent.
    pub async fn record_failure(
        &self,
        lead: &Lead,
        stage: &'static str,
        kind: &str,
        error: &Error,
        instance: Option<&str>,
    ) {
        self.audit
            .record_attempt(&AutomationAttempt::failed(
                &lead.phone,
                stage,
                kind,
                "",
                error.to_string(),
                None,
                error.provider_payload().cloned(),
                instance,
            ))
            .await;
    }
}
