//! End-to-end tests over real sockets.
//!
//! Mock vendor servers (gateway and language model) and the application
//! itself each run as an Axum server on a random port; the HTTP clients
//! under test talk to them exactly as they would in production.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use leadflow::api::{self, AppState};
use leadflow::config::{GatewayProvider, GatewaySettings};
use leadflow::error::GatewayError;
use leadflow::gateway::{GatewayFactory, HttpGatewayFactory, InstanceCredentials};
use leadflow::llm::HttpLlmFactory;
use leadflow::store::{Database, LibSqlBackend};

use common::TEST_TIMEOUT;

const POLL: Duration = Duration::from_millis(25);
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);
const ADMIN_TOKEN: &str = "admin-secret";
const PHONE: &str = "5541999990000";

// ── Mock vendor servers ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Call {
    path: String,
    headers: HeaderMap,
    body: Value,
}

impl Call {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Records every request a mock vendor receives.
#[derive(Clone, Default)]
struct Vendor {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Vendor {
    fn record(&self, uri: &Uri, headers: &HeaderMap, body: &Bytes) -> Value {
        let body: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        self.calls.lock().unwrap().push(Call {
            path: uri.path().to_string(),
            headers: headers.clone(),
            body: body.clone(),
        });
        body
    }

    fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path == path)
            .cloned()
            .collect()
    }
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{port}")
}

async fn vendor_ok(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    vendor.record(&uri, &headers, &body);
    Json(json!({ "response": "ok" }))
}

async fn uazapi_init(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = vendor.record(&uri, &headers, &body);
    if headers.get("admintoken").and_then(|v| v.to_str().ok()) != Some(ADMIN_TOKEN) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad admin token" })))
            .into_response();
    }
    Json(json!({ "name": body["name"], "token": "inst-tok" })).into_response()
}

async fn uazapi_status(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    vendor.record(&uri, &headers, &body);
    Json(json!({
        "instance": { "status": "connected" },
        "status": { "connected": true, "loggedIn": true }
    }))
}

async fn uazapi_connect(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    vendor.record(&uri, &headers, &body);
    Json(json!({
        "instance": { "qrcode": "QRDATA", "status": "connecting" },
        "status": { "connected": false }
    }))
}

/// Rejects any text containing `FAIL`.
async fn uazapi_send(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = vendor.record(&uri, &headers, &body);
    if body["text"].as_str().is_some_and(|t| t.contains("FAIL")) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "boom" })),
        )
            .into_response();
    }
    Json(json!({ "id": "msg-1", "status": "queued" })).into_response()
}

fn uazapi_mock(vendor: Vendor) -> Router {
    Router::new()
        .route("/instance/init", post(uazapi_init))
        .route("/instance/status", get(uazapi_status))
        .route("/instance/connect", post(uazapi_connect))
        .route("/instance/disconnect", post(vendor_ok))
        .route("/instance", axum::routing::delete(vendor_ok))
        .route("/webhook", post(vendor_ok))
        .route("/send/text", post(uazapi_send))
        .route("/message/presence", post(vendor_ok))
        .with_state(vendor)
}

async fn evolution_fetch(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    vendor.record(&uri, &headers, &body);
    Json(json!([
        { "instance": { "instanceName": "other", "state": "close" } },
        { "instance": { "instanceName": "main", "state": "open" } }
    ]))
}

async fn evolution_connect(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    vendor.record(&uri, &headers, &body);
    Json(json!({
        "pairingCode": "ABCD-1234",
        "code": "2@xyz",
        "base64": "data:image/png;base64,XYZ"
    }))
}

fn evolution_mock(vendor: Vendor) -> Router {
    Router::new()
        .route("/instance/create", post(vendor_ok))
        .route("/instance/fetchInstances", get(evolution_fetch))
        .route("/instance/connect/{name}", get(evolution_connect))
        .route("/message/sendText/{name}", post(vendor_ok))
        .route("/webhook/set/{name}", post(vendor_ok))
        .with_state(vendor)
}

async fn openai_completion(
    State(vendor): State<Vendor>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    vendor.record(&uri, &headers, &body);
    Json(json!({
        "choices": [{ "message": { "role": "assistant", "content": "Olá! Posso ajudar?" } }]
    }))
}

fn openai_mock(vendor: Vendor) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_completion))
        .with_state(vendor)
}

fn gateway_settings(provider: GatewayProvider, base_url: &str) -> GatewaySettings {
    GatewaySettings {
        provider,
        base_url: base_url.to_string(),
        admin_token: SecretString::from(ADMIN_TOKEN.to_string()),
    }
}

// ── Application under test ──────────────────────────────────────────

struct App {
    base: String,
    http: reqwest::Client,
    gateway: Vendor,
    llm: Vendor,
}

impl App {
    async fn get(&self, path: &str) -> Value {
        self.http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn get_with_status(&self, path: &str) -> (StatusCode, Value) {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }
}

/// Start mock vendors plus the application wired to them.
async fn start_app(settings: &[(&str, &str)]) -> App {
    let gateway = Vendor::default();
    let llm = Vendor::default();
    let gateway_url = serve(uazapi_mock(gateway.clone())).await;
    let llm_url = serve(openai_mock(llm.clone())).await;

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let defaults = [
        ("GATEWAY_PROVIDER", "uazapi"),
        ("GATEWAY_URL", gateway_url.as_str()),
        ("GATEWAY_ADMIN_TOKEN", ADMIN_TOKEN),
        ("AI_PROVIDER", "openai"),
        ("AI_TOKEN", "sk-test"),
        ("AI_BASE_URL", llm_url.as_str()),
        ("FLOW_INTERVAL", "0"),
        ("FLOW_TYPING_MS", "0"),
    ];
    for (key, value) in defaults.iter().chain(settings.iter()) {
        db.set_setting(key, value).await.unwrap();
    }

    let state = AppState::new(
        db,
        Arc::new(HttpGatewayFactory::new(HTTP_TIMEOUT).unwrap()),
        Arc::new(HttpLlmFactory::new(HTTP_TIMEOUT).unwrap()),
    );
    let base = serve(api::routes(state)).await;

    App {
        base,
        http: reqwest::Client::new(),
        gateway,
        llm,
    }
}

fn message_payload(text: &str, from_me: bool) -> Value {
    json!({
        "EventType": "messages",
        "instance": { "name": "main" },
        "data": {
            "key": { "remoteJid": format!("{PHONE}@s.whatsapp.net"), "fromMe": from_me },
            "message": { "conversation": text }
        }
    })
}

// ── Vendor client tests ─────────────────────────────────────────────

#[tokio::test]
async fn uazapi_client_speaks_the_vendor_protocol() {
    timeout(TEST_TIMEOUT, async {
        let vendor = Vendor::default();
        let url = serve(uazapi_mock(vendor.clone())).await;
        let client = HttpGatewayFactory::new(HTTP_TIMEOUT)
            .unwrap()
            .build(&gateway_settings(GatewayProvider::Uazapi, &url))
            .unwrap();

        let init = client.init("main").await.unwrap();
        assert_eq!(init.token.as_deref(), Some("inst-tok"));
        let creds = InstanceCredentials::new("main", init.token);

        let status = client.status(&creds).await.unwrap();
        assert!(status.connected);
        assert_eq!(
            vendor.calls_to("/instance/status")[0].header("token"),
            Some("inst-tok")
        );

        let connect = client.connect(&creds).await.unwrap();
        assert!(!connect.connected);
        assert_eq!(
            connect.artifact.qr_code.as_deref(),
            Some("data:image/png;base64,QRDATA")
        );

        let sent = client
            .send_text(&creds, &format!("{PHONE}@s.whatsapp.net"), "hello")
            .await
            .unwrap();
        assert_eq!(sent["id"], "msg-1");
        assert_eq!(vendor.calls_to("/send/text")[0].body["number"], PHONE);

        let err = client.send_text(&creds, PHONE, "FAIL now").await.unwrap_err();
        match err {
            GatewayError::Rejected { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body["error"], "boom");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn uazapi_rejects_bad_admin_token_and_missing_instance_token() {
    timeout(TEST_TIMEOUT, async {
        let url = serve(uazapi_mock(Vendor::default())).await;
        let mut settings = gateway_settings(GatewayProvider::Uazapi, &url);
        settings.admin_token = SecretString::from("wrong".to_string());
        let client = HttpGatewayFactory::new(HTTP_TIMEOUT)
            .unwrap()
            .build(&settings)
            .unwrap();

        let err = client.init("main").await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 401, .. }));

        let err = client
            .status(&InstanceCredentials::new("main", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingCredential { .. }));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn evolution_client_speaks_the_vendor_protocol() {
    timeout(TEST_TIMEOUT, async {
        let vendor = Vendor::default();
        let url = serve(evolution_mock(vendor.clone())).await;
        let client = HttpGatewayFactory::new(HTTP_TIMEOUT)
            .unwrap()
            .build(&gateway_settings(GatewayProvider::Evolution, &url))
            .unwrap();

        let init = client.init("main").await.unwrap();
        let token = init.token.clone().unwrap();
        let create = &vendor.calls_to("/instance/create")[0];
        assert_eq!(create.header("apikey"), Some(ADMIN_TOKEN));
        assert_eq!(create.body["instanceName"], "main");
        assert_eq!(create.body["token"], token.as_str());

        let creds = InstanceCredentials::new("main", Some(token));
        let status = client.status(&creds).await.unwrap();
        assert!(status.connected);
        assert_eq!(status.raw_state.as_deref(), Some("open"));

        let connect = client.connect(&creds).await.unwrap();
        assert_eq!(
            connect.artifact.qr_code.as_deref(),
            Some("data:image/png;base64,XYZ")
        );
        assert_eq!(connect.artifact.pairing_code.as_deref(), Some("ABCD-1234"));

        client.send_text(&creds, PHONE, "hello").await.unwrap();
        let send = &vendor.calls_to("/message/sendText/main")[0];
        assert_eq!(send.body["number"], PHONE);
        assert_eq!(send.body["text"], "hello");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_gateway_is_a_transport_error() {
    timeout(TEST_TIMEOUT, async {
        // Bind and drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HttpGatewayFactory::new(HTTP_TIMEOUT)
            .unwrap()
            .build(&gateway_settings(
                GatewayProvider::Uazapi,
                &format!("http://127.0.0.1:{port}"),
            ))
            .unwrap();
        let err = client.init("main").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable { .. }));
    })
    .await
    .expect("test timed out");
}

// ── Application tests ───────────────────────────────────────────────

#[tokio::test]
async fn health_check() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[]).await;
        assert_eq!(app.get("/health").await["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_always_acknowledges() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[]).await;

        let (status, body) = app.post("/api/webhook", message_payload("oi", true)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Ignoring self message");

        let response = app
            .http
            .post(format!("{}/api/webhook", app.base))
            .header("content-type", "application/json")
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = app.get("/api/webhook-logs").await;
        let events = events.as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "unknown");
        assert_eq!(events[1]["event"], "messages");
        assert_eq!(events[1]["instance"], "main");

        let filtered = app.get("/api/webhook-logs?event=messages").await;
        assert_eq!(filtered.as_array().unwrap().len(), 1);

        let purged = app
            .http
            .delete(format!("{}/api/webhook-logs", app.base))
            .send()
            .await
            .unwrap()
            .json::<Value>()
            .await
            .unwrap();
        assert_eq!(purged["deleted"], 2);
        assert!(app.get("/api/webhook-logs").await.as_array().unwrap().is_empty());
        // no lead is created for ignored events
        assert!(app.get("/api/leads").await.as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn inbound_message_runs_the_flow_through_the_gateway() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[("PUBLIC_BASE_URL", "https://leads.example.com")]).await;

        let (status, instance) = app.post("/api/instances", json!({ "name": "main" })).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(instance["status"], "DISCONNECTED");
        assert!(instance.get("token").is_none());

        let (status, pending) = app.get_with_status("/api/instances/main/connect").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending["status"], "CONNECTING");
        assert_eq!(pending["qrCode"], "data:image/png;base64,QRDATA");

        let (status, _) = app
            .post(
                "/api/webhook",
                json!({ "event": "connection", "instance": "main", "data": { "state": "open" } }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        loop {
            let instances = app.get("/api/instances").await;
            if instances[0]["status"] == "CONNECTED" {
                break;
            }
            tokio::time::sleep(POLL).await;
        }

        let (status, body) = app.post("/api/webhook", message_payload("oi", false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let attempts = loop {
            let attempts = app.get("/api/automation-logs").await;
            if attempts.as_array().map_or(0, Vec::len) >= 3 {
                break attempts;
            }
            tokio::time::sleep(POLL).await;
        };
        let attempts = attempts.as_array().unwrap();
        assert!(attempts.iter().all(|a| a["status"] == "SENT"));
        assert_eq!(attempts[0]["type"], "flow_step_3");

        let sends = app.gateway.calls_to("/send/text");
        assert_eq!(sends.len(), 3);
        assert!(sends.iter().all(|c| c.header("token") == Some("inst-tok")));
        assert!(sends.iter().all(|c| c.body["number"] == PHONE));
        assert!(
            sends[1].body["text"]
                .as_str()
                .unwrap()
                .contains("https://leads.example.com/marcar-aula")
        );

        let leads = app.get("/api/leads").await;
        assert_eq!(leads.as_array().unwrap().len(), 1);
        assert_eq!(leads[0]["status"], "IN_PROGRESS");
        let id = leads[0]["id"].as_str().unwrap();
        let messages = app.get(&format!("/api/leads/{id}/messages")).await;
        assert_eq!(messages.as_array().unwrap().len(), 4);
        assert_eq!(messages[0]["sender"], "LEAD");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn operator_send_requires_a_connected_instance() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[]).await;

        let (status, lead) = app
            .post("/api/leads", json!({ "phone": "+55 41 99999-0000", "name": "Ana" }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(lead["phone"], PHONE);

        let (status, body) = app
            .post(
                "/api/chat/send",
                json!({ "leadId": lead["id"], "content": "hello" }),
            )
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().is_some());
        assert!(app.gateway.calls_to("/send/text").is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn operator_send_failure_surfaces_vendor_payload() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[]).await;
        app.post("/api/instances", json!({ "name": "main" })).await;
        app.post(
            "/api/webhook",
            json!({ "event": "connection", "instance": "main", "data": { "state": "open" } }),
        )
        .await;
        loop {
            if app.get("/api/instances").await[0]["status"] == "CONNECTED" {
                break;
            }
            tokio::time::sleep(POLL).await;
        }
        let (_, lead) = app.post("/api/leads", json!({ "phone": PHONE })).await;

        let (status, body) = app
            .post(
                "/api/chat/send",
                json!({ "leadId": lead["id"], "content": "FAIL please" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["details"]["error"], "boom");

        let errors = app.get("/api/automation-logs?status=ERROR").await;
        assert_eq!(errors.as_array().unwrap().len(), 1);
        assert_eq!(errors[0]["stage"], "OPERATOR");

        let (status, message) = app
            .post(
                "/api/chat/send",
                json!({ "leadId": lead["id"], "content": "Hi Ana" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(message["sender"], "OPERATOR");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_lead_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[]).await;
        let response = app
            .http
            .get(format!(
                "{}/api/leads/00000000-0000-0000-0000-000000000000/messages",
                app.base
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn lead_admin_updates() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[]).await;
        let (_, lead) = app.post("/api/leads", json!({ "phone": PHONE })).await;
        let id = lead["id"].as_str().unwrap();

        let updated: Value = app
            .http
            .patch(format!("{}/api/leads/{id}", app.base))
            .json(&json!({ "status": "SCHEDULED", "intent": "trial class", "automationEnabled": false }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(updated["status"], "SCHEDULED");
        assert_eq!(updated["intent"], "trial class");
        assert_eq!(updated["automationEnabled"], false);

        // Same phone again returns the existing lead.
        let (status, again) = app.post("/api/leads", json!({ "phone": PHONE })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["id"], lead["id"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ai_console_uses_the_configured_model() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[("AI_ENABLED", "true"), ("AI_PROMPT", "Be brief")]).await;

        let (status, reply) = app
            .post(
                "/api/ai-test",
                json!({ "messages": [{ "role": "user", "content": "oi" }] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply, json!({ "role": "assistant", "content": "Olá! Posso ajudar?" }));

        let call = &app.llm.calls_to("/v1/chat/completions")[0];
        assert_eq!(call.header("authorization"), Some("Bearer sk-test"));
        assert_eq!(call.body["messages"][0]["role"], "system");
        assert_eq!(call.body["messages"][0]["content"], "Be brief");
        assert_eq!(call.body["messages"][1]["content"], "oi");

        let (_, directive) = app
            .post(
                "/api/ai-test",
                json!({
                    "messages": [{ "role": "user", "content": "oi" }],
                    "userFeedback": "mention the trial class"
                }),
            )
            .await;
        assert_eq!(directive["newPrompt"], "Olá! Posso ajudar?");

        // Nothing is sent or persisted by the console.
        assert!(app.gateway.calls_to("/send/text").is_empty());
        assert!(app.get("/api/leads").await.as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ai_console_previews_the_static_flow() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app(&[("FLOW_INTERVAL", "7")]).await;

        let (status, preview) = app
            .post(
                "/api/ai-test",
                json!({ "messages": [{ "role": "user", "content": "oi" }] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["isFlow"], true);
        assert_eq!(preview["interval"], 7);
        assert_eq!(preview["messages"].as_array().unwrap().len(), 3);

        let (_, later) = app
            .post(
                "/api/ai-test",
                json!({ "messages": [
                    { "role": "user", "content": "oi" },
                    { "role": "assistant", "content": "hello" },
                    { "role": "user", "content": "and now?" }
                ] }),
            )
            .await;
        assert_eq!(later["role"], "assistant");
        assert!(app.llm.calls_to("/v1/chat/completions").is_empty());
    })
    .await
    .expect("test timed out");
}
