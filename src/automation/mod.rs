//! Automation sequencer.
//!
//! Two mutually exclusive branches, picked per invocation by `AI_ENABLED`:
//! the static first-contact flow, or a language-model reply. Both send
//! through the [`Outbox`].

pub mod flow;
pub mod outbox;

pub use flow::{FlowEnd, FlowPlan, FlowReport, FlowStep};
pub use outbox::{Delivery, Outbox};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::gateway::{GatewayClient, GatewayFactory, InstanceCredentials, Presence};
use crate::instances::InstanceManager;
use crate::instances::model::{ConnectionStatus, GatewayInstance};
use crate::leads::LeadService;
use crate::leads::model::{Lead, Message, MessageSender};
use crate::llm::{self, ChatRole, ChatTurn, LlmFactory};
use crate::store::Database;

pub const STAGE_FIRST_CONTACT: &str = "FIRST_CONTACT";
pub const STAGE_FOLLOW_UP: &str = "FOLLOW_UP";
pub const STAGE_AI_REPLY: &str = "AI_REPLY";
pub const STAGE_OPERATOR: &str = "OPERATOR";

const FLOW_ALREADY_TRIGGERED: &str = "The automatic flow was already sent. In a real \
     conversation the contact would now be waiting for a human reply.";

/// What the sequencer did for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum AutomationOutcome {
    Flow(FlowReport),
    Acknowledged,
    AiReplied { sent: usize },
    Skipped(&'static str),
}

/// Request body of the AI test console.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub user_feedback: Option<String>,
}

/// Dry-run answer for the AI test console.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Preview {
    #[serde(rename_all = "camelCase")]
    Flow {
        is_flow: bool,
        messages: Vec<String>,
        /// Seconds between messages.
        interval: u64,
    },
    Reply(ChatTurn),
    #[serde(rename_all = "camelCase")]
    Directive { new_prompt: String },
}

pub struct Sequencer {
    db: Arc<dyn Database>,
    leads: LeadService,
    instances: Arc<InstanceManager>,
    gateways: Arc<dyn GatewayFactory>,
    llms: Arc<dyn LlmFactory>,
    outbox: Outbox,
}

impl Sequencer {
    pub fn new(
        db: Arc<dyn Database>,
        instances: Arc<InstanceManager>,
        gateways: Arc<dyn GatewayFactory>,
        llms: Arc<dyn LlmFactory>,
    ) -> Self {
        let leads = LeadService::new(Arc::clone(&db));
        let outbox = Outbox::new(AuditTrail::new(Arc::clone(&db)), leads.clone());
        Self {
            db,
            leads,
            instances,
            gateways,
            llms,
            outbox,
        }
    }

    /// React to an inbound message already recorded on `lead`.
    ///
    /// `instance_hint` is the instance the message arrived on; `host` is the
    /// request host used to build the booking link.
    pub async fn respond(
        &self,
        lead: &Lead,
        instance_hint: Option<&str>,
        host: Option<&str>,
    ) -> Result<AutomationOutcome> {
        if !lead.automation_enabled {
            debug!(phone = %lead.phone, "Automation disabled for lead");
            return Ok(AutomationOutcome::Skipped("Automation disabled for lead"));
        }

        let settings = Settings::load(self.db.as_ref()).await?;
        let Some(instance) = self.resolve_instance(instance_hint).await? else {
            warn!(phone = %lead.phone, "No connected instance to reply from");
            return Ok(AutomationOutcome::Skipped("No connected instance"));
        };
        let gateway = self.gateways.build(&settings.gateway()?)?;
        let creds = InstanceCredentials::new(&instance.name, instance.token.clone());

        if settings.ai_enabled() {
            let first_turn = self.leads.claim_first_contact(lead.id).await?;
            return self
                .ai_reply(&settings, gateway.as_ref(), &creds, lead, first_turn)
                .await;
        }

        if self.leads.claim_first_contact(lead.id).await? {
            let link = flow::booking_link(&settings, host);
            let plan = FlowPlan::build(&settings.flow(), &link);
            info!(
                phone = %lead.phone,
                steps = plan.len(),
                min_duration = ?plan.min_duration(),
                "Starting first-contact flow"
            );
            let report = self.run_flow(&plan, gateway.as_ref(), &creds, lead).await;
            info!(phone = %lead.phone, sent = report.sent, end = ?report.end, "Flow finished");
            return Ok(AutomationOutcome::Flow(report));
        }

        let delivery = Delivery {
            stage: STAGE_FOLLOW_UP,
            kind: "ack".to_string(),
            body: settings.flow().ack_message,
            sender: MessageSender::Bot,
        };
        self.outbox
            .deliver(gateway.as_ref(), &creds, lead, &delivery)
            .await?;
        Ok(AutomationOutcome::Acknowledged)
    }

    /// The arrival instance if it is CONNECTED here, else the first CONNECTED one.
    async fn resolve_instance(&self, hint: Option<&str>) -> Result<Option<GatewayInstance>> {
        if let Some(name) = hint
            && let Some(instance) = self.db.get_instance(name).await?
            && instance.status == ConnectionStatus::Connected
        {
            return Ok(Some(instance));
        }
        self.instances.connected_instance().await
    }

    /// Run `plan` step by step. A failed send stops the flow; earlier
    /// steps stay sent.
    async fn run_flow(
        &self,
        plan: &FlowPlan,
        gateway: &dyn GatewayClient,
        creds: &InstanceCredentials,
        lead: &Lead,
    ) -> FlowReport {
        let mut sent = 0;
        for step in plan.steps() {
            if !step.delay_before.is_zero() {
                tokio::time::sleep(step.delay_before).await;
            }
            if !self.should_continue(lead.id).await {
                info!(phone = %lead.phone, step = step.index, "Flow cancelled");
                return FlowReport {
                    sent,
                    end: FlowEnd::Cancelled { step: step.index },
                };
            }

            if let Err(e) = gateway
                .send_presence(creds, &lead.phone, Presence::Composing)
                .await
            {
                debug!(phone = %lead.phone, "Presence signal failed: {e}");
            }
            tokio::time::sleep(step.typing).await;

            let delivery = Delivery {
                stage: STAGE_FIRST_CONTACT,
                kind: step.kind(),
                body: step.body.clone(),
                sender: MessageSender::Bot,
            };
            if self
                .outbox
                .deliver(gateway, creds, lead, &delivery)
                .await
                .is_err()
            {
                return FlowReport {
                    sent,
                    end: FlowEnd::Failed { step: step.index },
                };
            }
            sent += 1;
        }
        FlowReport {
            sent,
            end: FlowEnd::Completed,
        }
    }

    /// Re-read the lead's opt-in and the branch flag before each step.
    async fn should_continue(&self, lead_id: Uuid) -> bool {
        let lead_enabled = match self.db.get_lead(lead_id).await {
            Ok(Some(lead)) => lead.automation_enabled,
            Ok(None) => false,
            Err(e) => {
                warn!(lead_id = %lead_id, "Cancellation check failed: {e}");
                false
            }
        };
        if !lead_enabled {
            return false;
        }
        match Settings::load(self.db.as_ref()).await {
            Ok(settings) => !settings.ai_enabled(),
            Err(e) => {
                warn!(lead_id = %lead_id, "Cancellation check failed: {e}");
                false
            }
        }
    }

    async fn ai_reply(
        &self,
        settings: &Settings,
        gateway: &dyn GatewayClient,
        creds: &InstanceCredentials,
        lead: &Lead,
        first_turn: bool,
    ) -> Result<AutomationOutcome> {
        let provider = match settings.ai().map_err(Error::from).and_then(|ai| {
            self.llms.build(&ai).map_err(Error::from)
        }) {
            Ok(provider) => provider,
            Err(e) => {
                self.outbox
                    .record_failure(lead, STAGE_AI_REPLY, "ai_reply", &e, Some(&creds.name))
                    .await;
                return Err(e);
            }
        };

        let history = llm::history_from_messages(&self.leads.conversation(lead.id).await?);
        let reply = match provider.complete(settings.ai_prompt(), &history).await {
            Ok(reply) => reply,
            Err(e) => {
                let err = Error::from(e);
                warn!(phone = %lead.phone, "Language model failed: {err}");
                self.outbox
                    .record_failure(lead, STAGE_AI_REPLY, "ai_reply", &err, Some(&creds.name))
                    .await;
                return Err(err);
            }
        };

        let parts = if first_turn {
            llm::split_reply(&reply)
        } else {
            Some(reply.trim().to_string())
                .filter(|r| !r.is_empty())
                .into_iter()
                .collect()
        };
        if parts.is_empty() {
            warn!(phone = %lead.phone, "Language model returned an empty reply");
            return Ok(AutomationOutcome::Skipped("Empty AI reply"));
        }

        if let Err(e) = gateway
            .send_presence(creds, &lead.phone, Presence::Composing)
            .await
        {
            debug!(phone = %lead.phone, "Presence signal failed: {e}");
        }

        let multi = parts.len() > 1;
        let mut sent = 0;
        for (i, body) in parts.into_iter().enumerate() {
            let delivery = Delivery {
                stage: STAGE_AI_REPLY,
                kind: if multi {
                    format!("ai_reply_{}", i + 1)
                } else {
                    "ai_reply".to_string()
                },
                body,
                sender: MessageSender::Bot,
            };
            self.outbox
                .deliver(gateway, creds, lead, &delivery)
                .await?;
            sent += 1;
        }
        Ok(AutomationOutcome::AiReplied { sent })
    }

    /// Operator-originated send through the first CONNECTED instance.
    ///
    /// Suppresses the first-contact flow for this lead and promotes NEW to
    /// IN_PROGRESS.
    pub async fn operator_send(&self, lead_id: Uuid, content: &str) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Validation("message content is empty".to_string()));
        }
        let lead = self.leads.get(lead_id).await?;
        let instance = self
            .instances
            .connected_instance()
            .await?
            .ok_or_else(|| Error::Unavailable("No connected WhatsApp instance".to_string()))?;

        let settings = Settings::load(self.db.as_ref()).await?;
        let gateway = self.gateways.build(&settings.gateway()?)?;
        let creds = InstanceCredentials::new(&instance.name, instance.token.clone());

        let delivery = Delivery {
            stage: STAGE_OPERATOR,
            kind: "manual".to_string(),
            body: content.to_string(),
            sender: MessageSender::Operator,
        };
        let message = self
            .outbox
            .deliver(gateway.as_ref(), &creds, &lead, &delivery)
            .await?;
        self.leads.mark_operator_contact(lead.id).await?;
        Ok(message)
    }

    /// Dry run for the AI test console. Nothing is sent or persisted.
    pub async fn preview(&self, request: &PreviewRequest, host: Option<&str>) -> Result<Preview> {
        if request.messages.is_empty() {
            return Err(Error::Validation("messages must not be empty".to_string()));
        }
        let settings = Settings::load(self.db.as_ref()).await?;

        if !settings.ai_enabled() {
            let user_turns = request
                .messages
                .iter()
                .filter(|t| t.role == ChatRole::User)
                .count();
            if user_turns == 1 {
                let flow = settings.flow();
                let plan = FlowPlan::build(&flow, &flow::booking_link(&settings, host));
                return Ok(Preview::Flow {
                    is_flow: true,
                    messages: plan.bodies(),
                    interval: flow.interval.as_secs(),
                });
            }
            return Ok(Preview::Reply(ChatTurn::assistant(FLOW_ALREADY_TRIGGERED)));
        }

        let provider = self.llms.build(&settings.ai()?)?;
        let feedback = request
            .user_feedback
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());
        if let Some(feedback) = feedback {
            let new_prompt = llm::refine_directive(
                provider.as_ref(),
                settings.ai_prompt(),
                &request.messages,
                feedback,
            )
            .await?;
            return Ok(Preview::Directive { new_prompt });
        }

        let reply = provider
            .complete(settings.ai_prompt(), &request.messages)
            .await?;
        Ok(Preview::Reply(ChatTurn::assistant(reply)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_serialization_shapes() {
        let flow = Preview::Flow {
            is_flow: true,
            messages: vec!["a".into()],
            interval: 5,
        };
        assert_eq!(
            serde_json::to_value(&flow).unwrap(),
            serde_json::json!({"isFlow": true, "messages": ["a"], "interval": 5})
        );

        let directive = Preview::Directive {
            new_prompt: "p".into(),
        };
        assert_eq!(
            serde_json::to_value(&directive).unwrap(),
            serde_json::json!({"newPrompt": "p"})
        );

        let reply = Preview::Reply(ChatTurn::assistant("hi"));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({"role": "assistant", "content": "hi"})
        );
    }

    #[test]
    fn preview_request_accepts_feedback() {
        let req: PreviewRequest = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "oi"}],
            "userFeedback": "be brief"
        }))
        .unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.user_feedback.as_deref(), Some("be brief"));
    }
}
