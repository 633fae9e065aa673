//! Vendor payload normalisation and classification.
//!
//! Pure functions over `serde_json::Value`; the vendors disagree on field
//! names, so every lookup walks a list of known aliases.

use serde_json::Value;

/// Normalised webhook envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Event name as sent by the vendor (empty when absent).
    pub event: String,
    pub instance: Option<String>,
    pub data: Value,
}

/// Broad category of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connection,
    Message,
    Other,
}

/// A text message from a contact, ready for lead handling.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub phone: String,
    pub text: String,
    /// Display name the contact set on their device.
    pub push_name: Option<String>,
    pub instance: Option<String>,
}

/// What the dispatcher should do with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Connection {
        instance: Option<String>,
        connected: bool,
    },
    Message(InboundMessage),
    Ignored(&'static str),
}

impl Classified {
    /// Short acknowledgment text for the webhook caller.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection update received",
            Self::Message(_) => "Message accepted",
            Self::Ignored(reason) => reason,
        }
    }
}

/// First non-null value among `paths` (each a list of object keys).
fn first_of<'a>(root: &'a Value, paths: &[&[&str]]) -> Option<&'a Value> {
    paths.iter().find_map(|path| {
        let value = path.iter().try_fold(root, |v, key| v.get(*key))?;
        (!value.is_null()).then_some(value)
    })
}

fn first_str(root: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        path.iter()
            .try_fold(root, |v, key| v.get(*key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Extract `{event, instance, data}` from any supported vendor envelope.
pub fn normalize(payload: &Value) -> Envelope {
    let event = first_str(payload, &[&["event"], &["type"], &["EventType"]]).unwrap_or_default();

    let instance = match payload.get("instance") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(obj @ Value::Object(_)) => first_str(obj, &[&["name"], &["instanceName"], &["id"]]),
        _ => None,
    }
    .or_else(|| first_str(payload, &[&["instanceName"], &["instanceId"]]));

    let data = match (payload.get("data"), payload.get("message")) {
        (Some(data @ Value::Object(_)), _) => data.clone(),
        (_, Some(message @ Value::Object(_))) => message.clone(),
        _ => payload.clone(),
    };

    Envelope {
        event,
        instance,
        data,
    }
}

/// Map an event name onto its category. Case and `_`/`.` separators are ignored.
pub fn event_kind(event: &str) -> EventKind {
    let normalized = event.trim().to_ascii_lowercase().replace('_', ".");
    match normalized.as_str() {
        "connection" | "connection.update" => EventKind::Connection,
        "message" | "messages" | "messages.upsert" => EventKind::Message,
        _ => EventKind::Other,
    }
}

/// Whether a connection event reports an active session.
fn connection_state(data: &Value) -> bool {
    first_of(
        data,
        &[
            &["state"],
            &["connection"],
            &["status", "connected"],
            &["status"],
            &["connected"],
            &["instance", "state"],
        ],
    )
    .is_some_and(crate::gateway::is_connected_value)
}

/// Phone from a JID: the digits before `@` (and before any `:device` suffix).
fn phone_from_jid(jid: &str) -> Option<String> {
    let local = jid.split('@').next()?.split(':').next()?;
    (!local.is_empty() && local.chars().all(|c| c.is_ascii_digit())).then(|| local.to_string())
}

fn classify_message(envelope: &Envelope) -> Classified {
    let data = &envelope.data;

    let from_me = first_of(data, &[&["key", "fromMe"], &["fromMe"]])
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if from_me {
        return Classified::Ignored("Ignoring self message");
    }

    let jid = first_str(
        data,
        &[
            &["key", "remoteJid"],
            &["chatid"],
            &["remoteJid"],
            &["from"],
            &["sender"],
        ],
    );
    let is_group = data.get("isGroup").and_then(Value::as_bool).unwrap_or(false)
        || jid.as_deref().is_some_and(|j| j.ends_with("@g.us"));
    if is_group {
        return Classified::Ignored("Ignoring group message");
    }

    let Some(phone) = jid.as_deref().and_then(phone_from_jid) else {
        return Classified::Ignored("No sender phone");
    };

    let text = first_str(
        data,
        &[
            &["message", "conversation"],
            &["message", "extendedTextMessage", "text"],
            &["message", "text"],
            &["text"],
            &["body"],
        ],
    );
    let Some(text) = text else {
        return Classified::Ignored("No text content");
    };

    Classified::Message(InboundMessage {
        phone,
        text,
        push_name: first_str(data, &[&["pushName"], &["senderName"]]),
        instance: envelope.instance.clone(),
    })
}

/// Decide what an envelope means. Malformed payloads are ignored, never errors.
pub fn classify(envelope: &Envelope) -> Classified {
    match event_kind(&envelope.event) {
        EventKind::Connection => Classified::Connection {
            instance: envelope.instance.clone(),
            connected: connection_state(&envelope.data),
        },
        EventKind::Message => classify_message(envelope),
        EventKind::Other => Classified::Ignored("Ignoring unhandled event"),
    }
}
