//! HTTP surface: the gateway webhook plus the operator/admin endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::audit::model::{AttemptFilter, WebhookEventFilter};
use crate::automation::{PreviewRequest, Sequencer};
use crate::error::{Error, Result};
use crate::gateway::GatewayFactory;
use crate::instances::InstanceManager;
use crate::leads::LeadService;
use crate::leads::model::LeadStatus;
use crate::llm::LlmFactory;
use crate::store::Database;
use crate::webhook::{Classified, Dispatcher};

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub instances: Arc<InstanceManager>,
    pub leads: LeadService,
    pub audit: AuditTrail,
    pub sequencer: Arc<Sequencer>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Wire the core services over one database and collaborator factories.
    pub fn new(
        db: Arc<dyn Database>,
        gateways: Arc<dyn GatewayFactory>,
        llms: Arc<dyn LlmFactory>,
    ) -> Self {
        let instances = Arc::new(InstanceManager::new(Arc::clone(&db), Arc::clone(&gateways)));
        let leads = LeadService::new(Arc::clone(&db));
        let audit = AuditTrail::new(Arc::clone(&db));
        let sequencer = Arc::new(Sequencer::new(
            Arc::clone(&db),
            Arc::clone(&instances),
            gateways,
            llms,
        ));
        let dispatcher = Dispatcher::new(
            audit.clone(),
            leads.clone(),
            Arc::clone(&instances),
            Arc::clone(&sequencer),
        );
        Self {
            db,
            instances,
            leads,
            audit,
            sequencer,
            dispatcher,
        }
    }
}

/// Build the full router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhook", post(webhook))
        .route("/api/instances", get(list_instances).post(register_instance))
        .route("/api/instances/{name}", axum::routing::delete(delete_instance))
        .route("/api/instances/{name}/connect", get(connect_instance))
        .route("/api/instances/{name}/sync", post(sync_instance))
        .route("/api/instances/{name}/logout", post(logout_instance))
        .route("/api/instances/{name}/webhook", post(configure_webhook))
        .route("/api/chat/send", post(chat_send))
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/{id}", get(get_lead).patch(update_lead))
        .route("/api/leads/{id}/messages", get(lead_messages))
        .route(
            "/api/automation-logs",
            get(list_attempts).delete(purge_attempts),
        )
        .route(
            "/api/webhook-logs",
            get(list_webhook_events).delete(purge_webhook_events),
        )
        .route("/api/ai-test", post(ai_test))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Public host of the current request, preferring proxy headers.
fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(',').next().unwrap_or(h).trim().to_string())
        .filter(|h| !h.is_empty())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Webhook ─────────────────────────────────────────────────────────

/// POST /api/webhook
///
/// Always 200. The event is recorded and classified inline; lead handling
/// and automation run as a background task.
async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let payload: Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));

    let classified = state.dispatcher.accept(&payload).await;
    let message = classified.describe();

    if !matches!(classified, Classified::Ignored(_)) {
        let dispatcher = state.dispatcher.clone();
        let host = request_host(&headers);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.process(classified, host.as_deref()).await {
                warn!("Webhook processing failed: {e}");
            }
        });
    }

    Json(json!({ "success": true, "message": message }))
}

// ── Instances ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterBody {
    name: String,
}

async fn list_instances(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.instances.list().await?))
}

async fn register_instance(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse> {
    let instance = state.instances.register(body.name.trim()).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    state.instances.delete(&name).await?;
    Ok(Json(json!({ "success": true })))
}

async fn connect_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.instances.request_connection(&name).await?))
}

async fn sync_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.instances.sync_status(&name).await?))
}

async fn logout_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.instances.logout(&name).await?))
}

#[derive(Deserialize, Default)]
struct WebhookBody {
    url: Option<String>,
}

async fn configure_webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let body: WebhookBody = if body.is_empty() {
        WebhookBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| Error::Validation(format!("invalid body: {e}")))?
    };
    Ok(Json(
        state
            .instances
            .configure_webhook(&name, body.url.as_deref())
            .await?,
    ))
}

// ── Chat & leads ────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    lead_id: Uuid,
    content: String,
}

async fn chat_send(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .sequencer
            .operator_send(body.lead_id, &body.content)
            .await?,
    ))
}

#[derive(Deserialize)]
struct CreateLeadBody {
    phone: String,
    name: Option<String>,
}

async fn list_leads(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.leads.list().await?))
}

async fn create_lead(
    State(state): State<AppState>,
    Json(body): Json<CreateLeadBody>,
) -> Result<impl IntoResponse> {
    let (lead, created) = state.leads.create(&body.phone, body.name.as_deref()).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(lead)))
}

async fn get_lead(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    Ok(Json(state.leads.get(id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLeadBody {
    status: Option<LeadStatus>,
    /// Empty string clears the intent.
    intent: Option<String>,
    automation_enabled: Option<bool>,
}

async fn update_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateLeadBody>,
) -> Result<impl IntoResponse> {
    let mut lead = state.leads.get(id).await?;
    if let Some(status) = body.status {
        lead = state.leads.set_status(id, status).await?;
    }
    if let Some(intent) = body.intent.as_deref() {
        lead = state.leads.set_intent(id, Some(intent)).await?;
    }
    if let Some(enabled) = body.automation_enabled {
        lead = state.leads.set_automation(id, enabled).await?;
    }
    Ok(Json(lead))
}

async fn lead_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.leads.conversation(id).await?))
}

// ── Audit ───────────────────────────────────────────────────────────

async fn list_attempts(
    State(state): State<AppState>,
    Query(filter): Query<AttemptFilter>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.audit.attempts(&filter).await?))
}

async fn purge_attempts(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let deleted = state.audit.purge_attempts().await?;
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}

async fn list_webhook_events(
    State(state): State<AppState>,
    Query(filter): Query<WebhookEventFilter>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.audit.webhook_events(&filter).await?))
}

async fn purge_webhook_events(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let deleted = state.audit.purge_webhook_events().await?;
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}

// ── AI test console ─────────────────────────────────────────────────

async fn ai_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PreviewRequest>,
) -> Result<impl IntoResponse> {
    let host = request_host(&headers);
    Ok(Json(state.sequencer.preview(&body, host.as_deref()).await?))
}
