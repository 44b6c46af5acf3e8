//! Typed failure taxonomy for the webhook pipeline.
//!
//! Only `AuthenticationFailure` ever surfaces to the HTTP caller (as 401);
//! every other variant is contained inside the request, recorded in the
//! audit log, and acknowledged with a success response so the provider
//! does not retry.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Signature header missing, malformed, or not matching the raw body.
    #[error("webhook signature missing or invalid")]
    AuthenticationFailure,

    /// Body was not valid JSON, or the envelope failed schema validation.
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Sender exceeded the accepted-message ceiling for the current window.
    #[error("sender {sender} exceeded {limit} messages per {window:?}")]
    RateLimitExceeded {
        sender: String,
        limit: u32,
        window: Duration,
    },

    /// Business handler did not complete inside the configured budget.
    /// The abandoned future is dropped; the downstream side effect may
    /// still be running.
    #[error("handler for {label} timed out after {timeout:?}")]
    HandlerTimeout { label: String, timeout: Duration },

    /// Business handler returned an error.
    #[error("handler for {label} failed: {source}")]
    HandlerFailure {
        label: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Short machine-readable tag used in audit events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::AuthenticationFailure => "auth_failure",
            PipelineError::MalformedPayload(_) => "malformed_payload",
            PipelineError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            PipelineError::HandlerTimeout { .. } => "handler_timeout",
            PipelineError::HandlerFailure { .. } => "handler_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_label_and_budget() {
        let err = PipelineError::HandlerTimeout {
            label: "wamid.test".into(),
            timeout: Duration::from_secs(30),
        };
        let text = err.to_string();
        assert!(text.contains("wamid.test"));
        assert!(text.contains("30s"));
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(PipelineError::AuthenticationFailure.kind(), "auth_failure");
        assert_eq!(
            PipelineError::MalformedPayload("x".into()).kind(),
            "malformed_payload"
        );
    }
}
