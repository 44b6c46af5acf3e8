//! Append-only audit trail for webhook processing.
//!
//! Every delivery and per-item outcome is recorded through an [`AuditSink`].
//! Sinks are best-effort: a failing sink is logged at debug level and
//! otherwise ignored — auditing must never block or fail a request. All
//! guest-identifying fields (phone numbers, message text) are redacted
//! before an event is constructed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::util::truncate_with_ellipsis;

/// Longest message-text prefix retained in audit events.
pub const AUDIT_TEXT_MAX_CHARS: usize = 100;

/// Leading characters of a phone number kept after redaction.
const PHONE_VISIBLE_PREFIX: usize = 4;

/// Keep only the leading digits of a phone-like identifier.
///
/// `"4915123456789"` becomes `"4915…"`. Short values pass through, since
/// there is nothing meaningful left to hide.
pub fn redact_phone(number: &str) -> String {
    if number.chars().count() <= PHONE_VISIBLE_PREFIX {
        return number.to_string();
    }
    let mut out: String = number.chars().take(PHONE_VISIBLE_PREFIX).collect();
    out.push('…');
    out
}

/// Truncate free text to the audit budget.
pub fn redact_text(text: &str) -> String {
    truncate_with_ellipsis(text, AUDIT_TEXT_MAX_CHARS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A webhook delivery arrived and passed authentication.
    Received,
    /// A message was accepted and is about to be dispatched.
    Processing,
    /// The business handler completed successfully.
    Processed,
    /// A retransmission was dropped by the dedup window.
    DuplicateSkipped,
    /// A per-item or delivery-level failure.
    Error,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Received => "received",
            AuditKind::Processing => "processing",
            AuditKind::Processed => "processed",
            AuditKind::DuplicateSkipped => "duplicate_skipped",
            AuditKind::Error => "error",
        }
    }
}

/// One audit record. `summary` carries only redacted, size-bounded fields.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    /// Source account id from the webhook entry (the tenant's messaging
    /// account), or `"-"` for delivery-level events with no entry context.
    pub tenant: String,
    pub summary: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, tenant: impl Into<String>, summary: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            kind,
            tenant: tenant.into(),
            summary,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Delivery-level event: counts only, no payload content.
    pub fn received(tenant: &str, messages: usize, statuses: usize, errors: usize) -> Self {
        Self::new(
            AuditKind::Received,
            tenant,
            serde_json::json!({
                "messages": messages,
                "statuses": statuses,
                "errors": errors,
            }),
        )
    }

    /// Per-message event with redacted sender and text.
    pub fn message(
        kind: AuditKind,
        tenant: &str,
        message_id: &str,
        from: &str,
        text: Option<&str>,
    ) -> Self {
        Self::new(
            kind,
            tenant,
            serde_json::json!({
                "message_id": message_id,
                "from": redact_phone(from),
                "text": text.map(redact_text),
            }),
        )
    }

    /// Per-status event; status updates carry no free text.
    pub fn status(tenant: &str, message_id: &str, status: &str, recipient: &str) -> Self {
        Self::new(
            AuditKind::Processed,
            tenant,
            serde_json::json!({
                "message_id": message_id,
                "status": status,
                "recipient": redact_phone(recipient),
            }),
        )
    }
}

/// Destination for audit events. Implementations must be non-blocking in
/// spirit: slow or failing sinks degrade to a debug log line, never to a
/// failed request.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Emit an event to a sink, swallowing any sink failure.
pub async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(err) = sink.append(&event).await {
        tracing::debug!("audit sink append failed ({}): {err:#}", event.kind.as_str());
    }
}

/// Default sink: structured `tracing` events, one line per audit record.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: &AuditEvent) -> anyhow::Result<()> {
        match event.kind {
            AuditKind::Error => tracing::warn!(
                kind = event.kind.as_str(),
                tenant = %event.tenant,
                summary = %event.summary,
                error = event.error.as_deref().unwrap_or("-"),
                "webhook audit"
            ),
            _ => tracing::info!(
                kind = event.kind.as_str(),
                tenant = %event.tenant,
                summary = %event.summary,
                "webhook audit"
            ),
        }
        Ok(())
    }
}

/// In-memory sink for lightweight deployments and tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Kinds in append order, handy for asserting pipeline sequencing.
    pub fn kinds(&self) -> Vec<AuditKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
