//! Lead state machine.
//!
//! NEW → IN_PROGRESS happens when a lead enters the automation path or an
//! operator writes to it. SCHEDULED and ARCHIVED are set by external
//! collaborators through the admin hooks below. Leads are never deleted.

pub mod model;

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Database;
use model::{Lead, LeadStatus, Message, MessageSender};

/// An inbound message after it was attached to its lead.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub lead: Lead,
    /// True when this delivery created the lead.
    pub created: bool,
    pub message: Message,
}

#[derive(Clone)]
pub struct LeadService {
    db: Arc<dyn Database>,
}

impl LeadService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Attach an inbound text to the lead for `phone`, creating it as NEW if unseen.
    pub async fn record_inbound(
        &self,
        phone: &str,
        push_name: Option<&str>,
        text: &str,
    ) -> Result<InboundRecord> {
        let (lead, created) = self.db.find_or_create_lead(phone, push_name).await?;
        if created {
            info!(phone = %phone, lead_id = %lead.id, "New lead created");
        }
        let message = self
            .db
            .append_message(lead.id, MessageSender::Lead, text)
            .await?;
        Ok(InboundRecord {
            lead,
            created,
            message,
        })
    }

    /// Explicit admin creation. Returns the existing lead if the phone is known.
    pub async fn create(&self, phone: &str, name: Option<&str>) -> Result<(Lead, bool)> {
        let phone = normalize_phone(phone)?;
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        Ok(self.db.find_or_create_lead(&phone, name).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Lead> {
        self.db
            .get_lead(id)
            .await?
            .ok_or_else(|| Error::not_found("lead", id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Lead>> {
        Ok(self.db.list_leads().await?)
    }

    pub async fn set_status(&self, id: Uuid, status: LeadStatus) -> Result<Lead> {
        if !self.db.update_lead_status(id, status).await? {
            return Err(Error::not_found("lead", id.to_string()));
        }
        info!(lead_id = %id, status = %status, "Lead status changed");
        self.get(id).await
    }

    pub async fn set_intent(&self, id: Uuid, intent: Option<&str>) -> Result<Lead> {
        let intent = intent.map(str::trim).filter(|i| !i.is_empty());
        if !self.db.set_lead_intent(id, intent).await? {
            return Err(Error::not_found("lead", id.to_string()));
        }
        self.get(id).await
    }

    /// Opt a lead in or out of automated replies.
    pub async fn set_automation(&self, id: Uuid, enabled: bool) -> Result<Lead> {
        if !self.db.set_lead_automation(id, enabled).await? {
            return Err(Error::not_found("lead", id.to_string()));
        }
        info!(lead_id = %id, enabled, "Lead automation toggled");
        self.get(id).await
    }

    /// Conversation ledger, oldest first.
    pub async fn conversation(&self, id: Uuid) -> Result<Vec<Message>> {
        self.get(id).await?;
        Ok(self.db.list_messages(id).await?)
    }

    /// Claim the first-contact marker. True for exactly one caller per lead;
    /// the winner also moves a NEW lead to IN_PROGRESS.
    pub async fn claim_first_contact(&self, id: Uuid) -> Result<bool> {
        let claimed = self.db.claim_first_contact(id).await?;
        if claimed {
            info!(lead_id = %id, "First contact claimed");
        }
        Ok(claimed)
    }

    /// Record that a human operator wrote to the lead: the first-contact
    /// flow is suppressed from now on and NEW becomes IN_PROGRESS.
    pub async fn mark_operator_contact(&self, id: Uuid) -> Result<()> {
        self.db.claim_first_contact(id).await?;
        if self.db.promote_new_lead(id).await? {
            info!(lead_id = %id, "Lead promoted by operator contact");
        }
        Ok(())
    }

    pub async fn append(
        &self,
        id: Uuid,
        sender: MessageSender,
        content: &str,
    ) -> Result<Message> {
        Ok(self.db.append_message(id, sender, content).await?)
    }
}

/// Digits-only phone. Formatting characters are dropped.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let has_letters = raw.chars().any(|c| c.is_alphabetic());
    if digits.len() < 8 || has_letters {
        return Err(Error::Validation(format!("invalid phone number '{raw}'")));
    }
    Ok(digits)
}
