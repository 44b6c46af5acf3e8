//! Outbound messaging channels.
//!
//! The gateway itself only ever sends two kinds of guest-facing text —
//! a rate-limit notice and a generic failure apology — and both are
//! best-effort. Business replies (reservation confirmations, AI answers)
//! are sent by the platform's own services, so the channel seam stays
//! deliberately small.

pub mod cloud;

use async_trait::async_trait;

pub use cloud::CloudChannel;

/// An outbound text notification.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub content: String,
    pub recipient: String,
}

impl SendMessage {
    pub fn new(content: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()>;

    async fn health_check(&self) -> bool;
}

/// Placeholder used when no outbound channel is configured. Sends fail,
/// which the pipeline's best-effort call sites log and discard.
pub struct DisabledChannel;

#[async_trait]
impl Channel for DisabledChannel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn send(&self, _message: &SendMessage) -> anyhow::Result<()> {
        anyhow::bail!("outbound channel is not configured")
    }

    async fn health_check(&self) -> bool {
        false
    }
}
