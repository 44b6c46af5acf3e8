//! Provider webhook envelope: data model and schema validation.
//!
//! Parsing is deliberately open on extension — the provider adds fields
//! without notice, and rejecting unknown keys would break the integration
//! on their schedule, not ours. Validation is strict only about required
//! fields and primitive types. Unrecognized value/message fields are
//! captured via `serde(flatten)` so single-item sub-envelopes re-serialize
//! with the original payload intact.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The only change field the dispatcher processes.
pub const MESSAGES_FIELD: &str = "messages";

/// Top-level webhook payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

/// One source account (the tenant's messaging account) with its changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<IncomingMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<StatusUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ChangeError>,
    /// Anything else the provider sends (contacts, messaging_product, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sender display identity for the receiving account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One inbound guest message. `id` is the dedup key; the struct is
/// read-only within the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextBody>,
    /// Type-specific payload (image, location, interactive, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IncomingMessage {
    pub fn body(&self) -> Option<&str> {
        self.text.as_ref().map(|t| t.body.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextBody {
    #[serde(default)]
    pub body: String,
}

/// Delivery lifecycle update for an outbound message. Not deduplicated;
/// downstream status handling is idempotent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
    /// Anything the provider invents later.
    Other,
}

impl StatusUpdate {
    pub fn delivery_status(&self) -> DeliveryStatus {
        match self.status.as_str() {
            "sent" => DeliveryStatus::Sent,
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Other,
        }
    }
}

/// Provider-side error object, passed through to the error handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WebhookEnvelope {
    pub fn message_count(&self) -> usize {
        self.items(|v| v.messages.len())
    }

    pub fn status_count(&self) -> usize {
        self.items(|v| v.statuses.len())
    }

    pub fn error_count(&self) -> usize {
        self.items(|v| v.errors.len())
    }

    fn items(&self, count: impl Fn(&ChangeValue) -> usize) -> usize {
        self.entry
            .iter()
            .flat_map(|e| e.changes.iter())
            .filter(|c| c.field == MESSAGES_FIELD)
            .map(|c| count(&c.value))
            .sum()
    }
}

fn single_item_envelope(object: &str, entry: &Entry, change: &Change, value: ChangeValue) -> WebhookEnvelope {
    WebhookEnvelope {
        object: object.to_string(),
        entry: vec![Entry {
            id: entry.id.clone(),
            changes: vec![Change {
                field: change.field.clone(),
                value,
            }],
        }],
    }
}

/// Minimal sub-envelope carrying exactly one message, same outer shape as
/// the original delivery so downstream handlers parse it identically.
pub fn single_message_envelope(
    object: &str,
    entry: &Entry,
    change: &Change,
    message: &IncomingMessage,
) -> WebhookEnvelope {
    single_item_envelope(
        object,
        entry,
        change,
        ChangeValue {
            metadata: change.value.metadata.clone(),
            messages: vec![message.clone()],
            ..ChangeValue::default()
        },
    )
}

pub fn single_status_envelope(
    object: &str,
    entry: &Entry,
    change: &Change,
    status: &StatusUpdate,
) -> WebhookEnvelope {
    single_item_envelope(
        object,
        entry,
        change,
        ChangeValue {
            metadata: change.value.metadata.clone(),
            statuses: vec![status.clone()],
            ..ChangeValue::default()
        },
    )
}

pub fn single_error_envelope(
    object: &str,
    entry: &Entry,
    change: &Change,
    error: &ChangeError,
) -> WebhookEnvelope {
    single_item_envelope(
        object,
        entry,
        change,
        ChangeValue {
            metadata: change.value.metadata.clone(),
            errors: vec![error.clone()],
            ..ChangeValue::default()
        },
    )
}

/// One schema problem, addressed by JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub problem: String,
}

impl SchemaViolation {
    fn new(path: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.problem)
    }
}

/// Validate a parsed JSON value against the envelope shape.
///
/// Collects every violation instead of stopping at the first, so one log
/// line describes the whole mismatch. Unknown fields anywhere are fine; an
/// empty `entry` array is fine (the delivery is a no-op downstream).
pub fn validate(value: &Value) -> Result<(), Vec<SchemaViolation>> {
    let mut violations = Vec::new();

    let Some(root) = value.as_object() else {
        return Err(vec![SchemaViolation::new("$", "body must be a JSON object")]);
    };

    match root.get("object") {
        Some(Value::String(_)) => {}
        Some(_) => violations.push(SchemaViolation::new("$.object", "must be a string")),
        None => violations.push(SchemaViolation::new("$.object", "required field is missing")),
    }

    match root.get("entry") {
        Some(Value::Array(entries)) => {
            for (i, entry) in entries.iter().enumerate() {
                validate_entry(entry, i, &mut violations);
            }
        }
        Some(_) => violations.push(SchemaViolation::new("$.entry", "must be an array")),
        None => violations.push(SchemaViolation::new("$.entry", "required field is missing")),
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn validate_entry(entry: &Value, index: usize, violations: &mut Vec<SchemaViolation>) {
    let path = format!("$.entry[{index}]");
    let Some(entry) = entry.as_object() else {
        violations.push(SchemaViolation::new(path, "must be an object"));
        return;
    };

    match entry.get("id") {
        Some(Value::String(_)) => {}
        Some(_) => violations.push(SchemaViolation::new(format!("{path}.id"), "must be a string")),
        None => violations.push(SchemaViolation::new(
            format!("{path}.id"),
            "required field is missing",
        )),
    }

    match entry.get("changes") {
        Some(Value::Array(changes)) => {
            for (j, change) in changes.iter().enumerate() {
                validate_change(change, &format!("{path}.changes[{j}]"), violations);
            }
        }
        Some(_) => violations.push(SchemaViolation::new(
            format!("{path}.changes"),
            "must be an array",
        )),
        None => violations.push(SchemaViolation::new(
            format!("{path}.changes"),
            "required field is missing",
        )),
    }
}

fn validate_change(change: &Value, path: &str, violations: &mut Vec<SchemaViolation>) {
    let Some(change) = change.as_object() else {
        violations.push(SchemaViolation::new(path, "must be an object"));
        return;
    };

    match change.get("field") {
        Some(Value::String(_)) => {}
        Some(_) => violations.push(SchemaViolation::new(format!("{path}.field"), "must be a string")),
        None => violations.push(SchemaViolation::new(
            format!("{path}.field"),
            "required field is missing",
        )),
    }

    let Some(value) = change.get("value") else {
        violations.push(SchemaViolation::new(
            format!("{path}.value"),
            "required field is missing",
        ));
        return;
    };
    let Some(value) = value.as_object() else {
        violations.push(SchemaViolation::new(format!("{path}.value"), "must be an object"));
        return;
    };

    if let Some(metadata) = value.get("metadata") {
        if !metadata.is_object() {
            violations.push(SchemaViolation::new(
                format!("{path}.value.metadata"),
                "must be an object",
            ));
        }
    }

    validate_item_array(value, "messages", path, violations, &["id", "from"]);
    validate_item_array(value, "statuses", path, violations, &["id", "status", "recipient_id"]);
    validate_item_array(value, "errors", path, violations, &[]);
}

fn validate_item_array(
    value: &Map<String, Value>,
    key: &str,
    path: &str,
    violations: &mut Vec<SchemaViolation>,
    required_strings: &[&str],
) {
    let Some(items) = value.get(key) else {
        return;
    };
    let Some(items) = items.as_array() else {
        violations.push(SchemaViolation::new(
            format!("{path}.value.{key}"),
            "must be an array",
        ));
        return;
    };

    for (i, item) in items.iter().enumerate() {
        let item_path = format!("{path}.value.{key}[{i}]");
        let Some(item) = item.as_object() else {
            violations.push(SchemaViolation::new(item_path, "must be an object"));
            continue;
        };
        for field in required_strings {
            match item.get(*field) {
                Some(Value::String(s)) if !s.is_empty() => {}
                Some(Value::String(_)) => violations.push(SchemaViolation::new(
                    format!("{item_path}.{field}"),
                    "must not be empty",
                )),
                Some(_) => violations.push(SchemaViolation::new(
                    format!("{item_path}.{field}"),
                    "must be a string",
                )),
                None => violations.push(SchemaViolation::new(
                    format!("{item_path}.{field}"),
                    "required field is missing",
                )),
            }
        }
    }
}
