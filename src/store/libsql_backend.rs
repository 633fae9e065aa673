//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by every request.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::model::{
    AttemptFilter, AttemptStatus, AutomationAttempt, WebhookEvent, WebhookEventFilter,
};
use crate::error::DatabaseError;
use crate::instances::model::{ConnectionStatus, GatewayInstance};
use crate::leads::model::{Lead, LeadStatus, Message, MessageSender};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(op: &'static str) -> impl FnOnce(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Canonical write format: fixed-width so lexical order matches time order.
fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    s.map_or(libsql::Value::Null, |s| libsql::Value::Text(s.to_string()))
}

fn opt_json(v: Option<&serde_json::Value>) -> libsql::Value {
    opt_text(v.map(serde_json::Value::to_string).as_deref())
}

const INSTANCE_COLUMNS: &str = "id, name, display_name, token, status, webhook_configured, last_synced_at, created_at, updated_at";

const LEAD_COLUMNS: &str = "id, phone, name, status, intent, automation_enabled, first_contact_handled_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, lead_id, sender, content, created_at";

const ATTEMPT_COLUMNS: &str = "id, target, stage, kind, body, status, error, request_payload, response_payload, instance, created_at";

const WEBHOOK_EVENT_COLUMNS: &str = "id, event, instance, payload, created_at";

fn row_to_instance(row: &libsql::Row) -> Result<GatewayInstance, libsql::Error> {
    let status_str: String = row.get(4)?;
    let synced: Option<String> = row.get(6).ok();
    let created: String = row.get(7)?;
    let updated: String = row.get(8)?;
    Ok(GatewayInstance {
        id: parse_uuid(&row.get::<String>(0)?),
        name: row.get(1)?,
        display_name: row.get(2)?,
        token: row.get(3).ok(),
        status: status_str.parse().unwrap_or(ConnectionStatus::Disconnected),
        webhook_configured: row.get::<i64>(5)? != 0,
        last_synced_at: synced.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_lead(row: &libsql::Row) -> Result<Lead, libsql::Error> {
    let status_str: String = row.get(3)?;
    let handled: Option<String> = row.get(6).ok();
    let created: String = row.get(7)?;
    let updated: String = row.get(8)?;
    Ok(Lead {
        id: parse_uuid(&row.get::<String>(0)?),
        phone: row.get(1)?,
        name: row.get(2).ok(),
        status: status_str.parse().unwrap_or(LeadStatus::New),
        intent: row.get(4).ok(),
        automation_enabled: row.get::<i64>(5)? != 0,
        first_contact_handled_at: handled.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let sender: String = row.get(2)?;
    let created: String = row.get(4)?;
    Ok(Message {
        id: parse_uuid(&row.get::<String>(0)?),
        lead_id: parse_uuid(&row.get::<String>(1)?),
        sender: sender.parse().unwrap_or(MessageSender::Lead),
        content: row.get(3)?,
        created_at: parse_datetime(&created),
    })
}

fn row_to_attempt(row: &libsql::Row) -> Result<AutomationAttempt, libsql::Error> {
    let status: String = row.get(5)?;
    let created: String = row.get(10)?;
    Ok(AutomationAttempt {
        id: parse_uuid(&row.get::<String>(0)?),
        target: row.get(1)?,
        stage: row.get(2)?,
        kind: row.get(3)?,
        body: row.get(4)?,
        status: status.parse().unwrap_or(AttemptStatus::Error),
        error: row.get(6).ok(),
        request_payload: parse_json(row.get(7).ok()),
        response_payload: parse_json(row.get(8).ok()),
        instance: row.get(9).ok(),
        created_at: parse_datetime(&created),
    })
}

fn row_to_webhook_event(row: &libsql::Row) -> Result<WebhookEvent, libsql::Error> {
    let payload: String = row.get(3)?;
    let created: String = row.get(4)?;
    Ok(WebhookEvent {
        id: parse_uuid(&row.get::<String>(0)?),
        event: row.get(1)?,
        instance: row.get(2).ok(),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created),
    })
}

/// Drain a result set through a row mapper.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    op: &'static str,
    map: fn(&libsql::Row) -> Result<T, libsql::Error>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        match map(&row) {
            Ok(item) => out.push(item),
            Err(e) => tracing::warn!(op, "Skipping row: {e}"),
        }
    }
    Ok(out)
}

/// Return the first row of a result set, mapped.
async fn first_row<T>(
    mut rows: libsql::Rows,
    op: &'static str,
    map: fn(&libsql::Row) -> Result<T, libsql::Error>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => map(&row)
            .map(Some)
            .map_err(|e| DatabaseError::Query(format!("{op}: row parse: {e}"))),
        None => Ok(None),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(query_err("get_setting"))?;
        first_row(rows, "get_setting", |row| row.get::<String>(0)).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, to_db_time(Utc::now())],
            )
            .await
            .map_err(query_err("set_setting"))?;
        Ok(())
    }

    async fn list_settings(&self) -> Result<HashMap<String, String>, DatabaseError> {
        let rows = self
            .conn()
            .query("SELECT key, value FROM settings", ())
            .await
            .map_err(query_err("list_settings"))?;
        let pairs = collect_rows(rows, "list_settings", |row| {
            Ok((row.get::<String>(0)?, row.get::<String>(1)?))
        })
        .await?;
        Ok(pairs.into_iter().collect())
    }

    // ── Gateway instances ───────────────────────────────────────────

    async fn upsert_instance(&self, instance: &GatewayInstance) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO gateway_instances (id, name, display_name, token, status,
                    webhook_configured, last_synced_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (name) DO UPDATE SET
                    display_name = ?3, token = ?4, status = ?5, webhook_configured = ?6,
                    last_synced_at = ?7, updated_at = ?9",
                params![
                    instance.id.to_string(),
                    instance.name.as_str(),
                    instance.display_name.as_str(),
                    opt_text(instance.token.as_deref()),
                    instance.status.as_str(),
                    instance.webhook_configured as i64,
                    opt_text(instance.last_synced_at.map(to_db_time).as_deref()),
                    to_db_time(instance.created_at),
                    to_db_time(Utc::now()),
                ],
            )
            .await
            .map_err(query_err("upsert_instance"))?;
        debug!(name = %instance.name, status = %instance.status, "Instance upserted");
        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<Option<GatewayInstance>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM gateway_instances WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(query_err("get_instance"))?;
        first_row(rows, "get_instance", row_to_instance).await
    }

    async fn list_instances(&self) -> Result<Vec<GatewayInstance>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM gateway_instances ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(query_err("list_instances"))?;
        collect_rows(rows, "list_instances", row_to_instance).await
    }

    async fn update_instance_status(
        &self,
        name: &str,
        status: ConnectionStatus,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let now = to_db_time(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE gateway_instances
                 SET status = ?1, last_synced_at = COALESCE(?2, last_synced_at), updated_at = ?3
                 WHERE name = ?4",
                params![
                    status.as_str(),
                    opt_text(synced_at.map(to_db_time).as_deref()),
                    now,
                    name,
                ],
            )
            .await
            .map_err(query_err("update_instance_status"))?;
        Ok(count > 0)
    }

    async fn set_instance_webhook(
        &self,
        name: &str,
        configured: bool,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE gateway_instances SET webhook_configured = ?1, updated_at = ?2 WHERE name = ?3",
                params![configured as i64, to_db_time(Utc::now()), name],
            )
            .await
            .map_err(query_err("set_instance_webhook"))?;
        Ok(count > 0)
    }

    async fn delete_instance(&self, name: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM gateway_instances WHERE name = ?1", params![name])
            .await
            .map_err(query_err("delete_instance"))?;
        Ok(count > 0)
    }

    async fn first_connected_instance(&self) -> Result<Option<GatewayInstance>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM gateway_instances
                     WHERE status = 'CONNECTED' ORDER BY created_at ASC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(query_err("first_connected_instance"))?;
        first_row(rows, "first_connected_instance", row_to_instance).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn find_or_create_lead(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> Result<(Lead, bool), DatabaseError> {
        let now = to_db_time(Utc::now());
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO leads (id, phone, name, status, automation_enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'NEW', 1, ?4, ?4)
                 ON CONFLICT (phone) DO NOTHING",
                params![Uuid::new_v4().to_string(), phone, opt_text(name), now],
            )
            .await
            .map_err(query_err("find_or_create_lead"))?;

        let lead = self.get_lead_by_phone(phone).await?.ok_or_else(|| {
            DatabaseError::Query(format!("find_or_create_lead: lead {phone} vanished"))
        })?;
        Ok((lead, inserted == 1))
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_lead"))?;
        first_row(rows, "get_lead", row_to_lead).await
    }

    async fn get_lead_by_phone(&self, phone: &str) -> Result<Option<Lead>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE phone = ?1"),
                params![phone],
            )
            .await
            .map_err(query_err("get_lead_by_phone"))?;
        first_row(rows, "get_lead_by_phone", row_to_lead).await
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(query_err("list_leads"))?;
        collect_rows(rows, "list_leads", row_to_lead).await
    }

    async fn update_lead_status(
        &self,
        id: Uuid,
        status: LeadStatus,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE leads SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), to_db_time(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("update_lead_status"))?;
        Ok(count > 0)
    }

    async fn promote_new_lead(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE leads SET status = 'IN_PROGRESS', updated_at = ?1
                 WHERE id = ?2 AND status = 'NEW'",
                params![to_db_time(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("promote_new_lead"))?;
        Ok(count > 0)
    }

    async fn claim_first_contact(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = to_db_time(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE leads
                 SET first_contact_handled_at = ?1,
                     status = CASE WHEN status = 'NEW' THEN 'IN_PROGRESS' ELSE status END,
                     updated_at = ?1
                 WHERE id = ?2 AND first_contact_handled_at IS NULL",
                params![now, id.to_string()],
            )
            .await
            .map_err(query_err("claim_first_contact"))?;
        Ok(count == 1)
    }

    async fn set_lead_intent(
        &self,
        id: Uuid,
        intent: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE leads SET intent = ?1, updated_at = ?2 WHERE id = ?3",
                params![opt_text(intent), to_db_time(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("set_lead_intent"))?;
        Ok(count > 0)
    }

    async fn set_lead_automation(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE leads SET automation_enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, to_db_time(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("set_lead_automation"))?;
        Ok(count > 0)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(
        &self,
        lead_id: Uuid,
        sender: MessageSender,
        content: &str,
    ) -> Result<Message, DatabaseError> {
        let message = Message {
            id: Uuid::new_v4(),
            lead_id,
            sender,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.conn()
            .execute(
                "INSERT INTO messages (id, lead_id, sender, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.id.to_string(),
                    lead_id.to_string(),
                    sender.as_str(),
                    content,
                    to_db_time(message.created_at),
                ],
            )
            .await
            .map_err(query_err("append_message"))?;
        debug!(lead_id = %lead_id, sender = sender.as_str(), "Message appended");
        Ok(message)
    }

    async fn list_messages(&self, lead_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE lead_id = ?1
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err("list_messages"))?;
        collect_rows(rows, "list_messages", row_to_message).await
    }

    // ── Audit ───────────────────────────────────────────────────────

    async fn insert_attempt(&self, attempt: &AutomationAttempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO automation_attempts (id, target, stage, kind, body, status, error,
                    request_payload, response_payload, instance, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    attempt.id.to_string(),
                    attempt.target.as_str(),
                    attempt.stage.as_str(),
                    attempt.kind.as_str(),
                    attempt.body.as_str(),
                    attempt.status.as_str(),
                    opt_text(attempt.error.as_deref()),
                    opt_json(attempt.request_payload.as_ref()),
                    opt_json(attempt.response_payload.as_ref()),
                    opt_text(attempt.instance.as_deref()),
                    to_db_time(attempt.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_attempt"))?;
        Ok(())
    }

    async fn list_attempts(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<AutomationAttempt>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(stage) = &filter.stage {
            values.push(libsql::Value::Text(stage.clone()));
            clauses.push(format!("stage = ?{}", values.len()));
        }
        if let Some(kind) = &filter.kind {
            values.push(libsql::Value::Text(kind.clone()));
            clauses.push(format!("kind = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        values.push(libsql::Value::Integer(filter.limit as i64));
        let limit_idx = values.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM automation_attempts {where_sql}
             ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_idx}"
        );

        let rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(query_err("list_attempts"))?;
        collect_rows(rows, "list_attempts", row_to_attempt).await
    }

    async fn purge_attempts(&self) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM automation_attempts", ())
            .await
            .map_err(query_err("purge_attempts"))?;
        info!(count, "Purged automation attempts");
        Ok(count as usize)
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO webhook_events (id, event, instance, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.to_string(),
                    event.event.as_str(),
                    opt_text(event.instance.as_deref()),
                    payload,
                    to_db_time(event.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_webhook_event"))?;
        Ok(())
    }

    async fn list_webhook_events(
        &self,
        filter: &WebhookEventFilter,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(instance) = &filter.instance {
            values.push(libsql::Value::Text(instance.clone()));
            clauses.push(format!("instance = ?{}", values.len()));
        }
        if let Some(event) = &filter.event {
            values.push(libsql::Value::Text(event.clone()));
            clauses.push(format!("event = ?{}", values.len()));
        }
        values.push(libsql::Value::Integer(filter.limit as i64));
        let limit_idx = values.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events {where_sql}
             ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_idx}"
        );

        let rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(query_err("list_webhook_events"))?;
        collect_rows(rows, "list_webhook_events", row_to_webhook_event).await
    }

    async fn purge_webhook_events(&self) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM webhook_events", ())
            .await
            .map_err(query_err("purge_webhook_events"))?;
        info!(count, "Purged webhook events");
        Ok(count as usize)
    }
}
