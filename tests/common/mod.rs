//! Shared fakes and setup for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use leadflow::api::AppState;
use leadflow::config::{AiSettings, GatewaySettings};
use leadflow::error::{ConfigError, GatewayError, LlmError};
use leadflow::gateway::{
    ConnectOutcome, GatewayClient, GatewayFactory, InitOutcome, InstanceCredentials, Presence,
    RemoteStatus,
};
use leadflow::instances::model::{ConnectionStatus, GatewayInstance, PairingArtifact};
use leadflow::leads::model::Lead;
use leadflow::llm::{ChatTurn, LlmFactory, LlmProvider};
use leadflow::store::{Database, LibSqlBackend};
use leadflow::webhook::{DispatchOutcome, Dispatcher};

/// Upper bound for tests on the real clock.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for tests on the paused clock (virtual time).
pub const PAUSED_TIMEOUT: Duration = Duration::from_secs(600);

/// One captured `send_text` call.
#[derive(Debug, Clone)]
pub struct SentText {
    pub instance: String,
    pub number: String,
    pub text: String,
    pub at: Instant,
}

/// In-process gateway recording every call.
#[derive(Default)]
pub struct FakeGateway {
    pub sent: Mutex<Vec<SentText>>,
    pub presences: Mutex<Vec<(String, Presence)>>,
    pub webhooks: Mutex<Vec<String>>,
    pub deletes: AtomicUsize,
    /// 1-based `send_text` call that answers 500.
    pub fail_send_at: Mutex<Option<usize>>,
    pub fail_delete: AtomicBool,
    pub fail_webhook: AtomicBool,
    pub remote_connected: AtomicBool,
    send_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_send_at(&self, call: usize) {
        *self.fail_send_at.lock().unwrap() = Some(call);
    }

    pub fn sent(&self) -> Vec<SentText> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.text).collect()
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    fn provider(&self) -> &'static str {
        "fake"
    }

    async fn init(&self, name: &str) -> Result<InitOutcome, GatewayError> {
        Ok(InitOutcome {
            token: Some(format!("tok-{name}")),
        })
    }

    async fn status(&self, _instance: &InstanceCredentials) -> Result<RemoteStatus, GatewayError> {
        let connected = self.remote_connected.load(Ordering::SeqCst);
        Ok(RemoteStatus {
            connected,
            raw_state: Some(if connected { "open" } else { "close" }.to_string()),
        })
    }

    async fn connect(
        &self,
        _instance: &InstanceCredentials,
    ) -> Result<ConnectOutcome, GatewayError> {
        Ok(ConnectOutcome {
            connected: self.remote_connected.load(Ordering::SeqCst),
            artifact: PairingArtifact {
                qr_code: Some("data:image/png;base64,QR".to_string()),
                pairing_code: None,
            },
        })
    }

    async fn logout(&self, _instance: &InstanceCredentials) -> Result<(), GatewayError> {
        self.remote_connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, _instance: &InstanceCredentials) -> Result<(), GatewayError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(GatewayError::Unreachable {
                operation: "delete".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn configure_webhook(
        &self,
        _instance: &InstanceCredentials,
        url: &str,
    ) -> Result<(), GatewayError> {
        if self.fail_webhook.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                operation: "configure_webhook".to_string(),
                status: 401,
                body: json!({ "error": "unauthorized" }),
            });
        }
        self.webhooks.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn send_text(
        &self,
        instance: &InstanceCredentials,
        number: &str,
        text: &str,
    ) -> Result<Value, GatewayError> {
        let call = self.send_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_send_at.lock().unwrap() == Some(call) {
            return Err(GatewayError::Rejected {
                operation: "send_text".to_string(),
                status: 500,
                body: json!({ "error": "internal failure" }),
            });
        }
        self.sent.lock().unwrap().push(SentText {
            instance: instance.name.clone(),
            number: number.to_string(),
            text: text.to_string(),
            at: Instant::now(),
        });
        Ok(json!({ "id": format!("msg-{call}"), "status": "sent" }))
    }

    async fn send_presence(
        &self,
        _instance: &InstanceCredentials,
        number: &str,
        presence: Presence,
    ) -> Result<(), GatewayError> {
        self.presences
            .lock()
            .unwrap()
            .push((number.to_string(), presence));
        Ok(())
    }
}

pub struct FakeGatewayFactory(pub Arc<FakeGateway>);

impl GatewayFactory for FakeGatewayFactory {
    fn build(&self, _settings: &GatewaySettings) -> Result<Arc<dyn GatewayClient>, ConfigError> {
        let client: Arc<dyn GatewayClient> = self.0.clone();
        Ok(client)
    }
}

/// Language model answering with a fixed reply.
pub struct StubLlm {
    pub reply: Mutex<String>,
    pub fail: AtomicBool,
    pub calls: Mutex<Vec<(String, Vec<ChatTurn>)>>,
}

impl StubLlm {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply.to_string()),
            fail: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reply(&self, reply: &str) {
        *self.reply.lock().unwrap() = reply.to_string();
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((system.to_string(), turns.to_vec()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(LlmError::Api {
                provider: "stub".to_string(),
                status: 429,
                body: json!({ "error": { "message": "rate limited" } }),
            });
        }
        Ok(self.reply.lock().unwrap().clone())
    }
}

pub struct StubLlmFactory(pub Arc<StubLlm>);

impl LlmFactory for StubLlmFactory {
    fn build(&self, _settings: &AiSettings) -> Result<Arc<dyn LlmProvider>, ConfigError> {
        let provider: Arc<dyn LlmProvider> = self.0.clone();
        Ok(provider)
    }
}

/// Fully wired core over an in-memory database and fakes.
pub struct Harness {
    pub db: Arc<dyn Database>,
    pub gateway: Arc<FakeGateway>,
    pub llm: Arc<StubLlm>,
    pub state: AppState,
}

impl Harness {
    /// Insert a CONNECTED instance with a token.
    pub async fn connected_instance(&self, name: &str) -> GatewayInstance {
        let mut instance = GatewayInstance::new(name);
        instance.token = Some(format!("tok-{name}"));
        instance.status = ConnectionStatus::Connected;
        self.db.upsert_instance(&instance).await.unwrap();
        instance
    }

    /// Insert an instance in `status`, with or without a token.
    pub async fn instance(&self, name: &str, status: ConnectionStatus, token: Option<&str>) {
        let mut instance = GatewayInstance::new(name);
        instance.token = token.map(str::to_string);
        instance.status = status;
        self.db.upsert_instance(&instance).await.unwrap();
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.db.set_setting(key, value).await.unwrap();
    }

    /// Run a webhook payload through the dispatcher inline.
    pub async fn handle(&self, raw: &Value, host: Option<&str>) -> leadflow::error::Result<DispatchOutcome> {
        dispatch(&self.state.dispatcher, raw, host).await
    }

    pub async fn lead(&self, phone: &str) -> Lead {
        self.db.get_lead_by_phone(phone).await.unwrap().unwrap()
    }
}

/// `accept` followed by `process`, as the webhook route does in the background.
pub async fn dispatch(
    dispatcher: &Dispatcher,
    raw: &Value,
    host: Option<&str>,
) -> leadflow::error::Result<DispatchOutcome> {
    let classified = dispatcher.accept(raw).await;
    dispatcher.process(classified, host).await
}

/// Gateway credentials plus the given overrides.
pub async fn harness(settings: &[(&str, &str)]) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.set_setting("GATEWAY_URL", "http://gateway.test")
        .await
        .unwrap();
    db.set_setting("GATEWAY_ADMIN_TOKEN", "admin-secret")
        .await
        .unwrap();
    db.set_setting("AI_TOKEN", "sk-test").await.unwrap();
    for (key, value) in settings {
        db.set_setting(key, value).await.unwrap();
    }

    let gateway = FakeGateway::new();
    let llm = StubLlm::new("Hello from the assistant");
    let state = AppState::new(
        Arc::clone(&db),
        Arc::new(FakeGatewayFactory(Arc::clone(&gateway))),
        Arc::new(StubLlmFactory(Arc::clone(&llm))),
    );
    Harness {
        db,
        gateway,
        llm,
        state,
    }
}

/// Inbound text message in the common gateway envelope.
pub fn message_payload(instance: &str, phone: &str, text: &str) -> Value {
    json!({
        "event": "messages",
        "instance": { "name": instance },
        "data": {
            "key": { "remoteJid": format!("{phone}@s.whatsapp.net"), "fromMe": false },
            "pushName": "Ana",
            "message": { "conversation": text }
        }
    })
}

pub fn connection_payload(instance: &str, state: &str) -> Value {
    json!({
        "event": "connection.update",
        "instance": instance,
        "data": { "state": state }
    })
}
