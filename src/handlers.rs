//! Business-logic handler seam.
//!
//! The gateway never implements reservation or AI logic itself; it hands
//! single-item sub-envelopes to an [`EventHandler`]. The default adapter
//! forwards them over HTTP to the platform's internal API. Handlers must
//! tolerate being invoked while an earlier, timed-out invocation for the
//! same item may still be running downstream.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::ForwardConfig;
use crate::webhook::envelope::WebhookEnvelope;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a sub-envelope containing exactly one guest message.
    async fn handle_message(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()>;

    /// Handle a sub-envelope containing exactly one delivery status.
    /// Status handling must be idempotent; the gateway does not dedup them.
    async fn handle_status(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()>;

    /// Handle a sub-envelope containing exactly one provider error.
    async fn handle_error(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()>;
}

/// Handler used when no downstream is configured: events are audited and
/// dropped. Useful for dry runs and webhook-subscription testing.
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {
    async fn handle_message(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()> {
        tracing::debug!(
            messages = envelope.message_count(),
            "no downstream configured; message dropped"
        );
        Ok(())
    }

    async fn handle_status(&self, _envelope: &WebhookEnvelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_error(&self, _envelope: &WebhookEnvelope) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards sub-envelopes to the platform's internal API over HTTP.
pub struct HttpForwardHandler {
    client: reqwest::Client,
    message_url: String,
    status_url: Option<String>,
    error_url: Option<String>,
    auth_token: Option<String>,
}

impl HttpForwardHandler {
    pub fn new(config: &ForwardConfig) -> Result<Self> {
        let message_url = config.message_url.trim().to_string();
        if message_url.is_empty() {
            anyhow::bail!("forward handler message URL is empty");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            message_url,
            status_url: normalize(&config.status_url),
            error_url: normalize(&config.error_url),
            auth_token: normalize(&config.auth_token),
        })
    }

    async fn post(&self, url: &str, envelope: &WebhookEnvelope) -> Result<()> {
        let mut req = self.client.post(url).json(envelope);
        if let Some(token) = self.auth_token.as_deref() {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.context("forward request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("forward target returned {status}: {}", body.trim());
        }
        Ok(())
    }
}

fn normalize(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

#[async_trait]
impl EventHandler for HttpForwardHandler {
    async fn handle_message(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()> {
        self.post(&self.message_url, envelope).await
    }

    async fn handle_status(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()> {
        match self.status_url.as_deref() {
            Some(url) => self.post(url, envelope).await,
            None => {
                tracing::debug!("no status forward URL configured; status dropped");
                Ok(())
            }
        }
    }

    async fn handle_error(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()> {
        match self.error_url.as_deref() {
            Some(url) => self.post(url, envelope).await,
            None => {
                tracing::debug!("no error forward URL configured; provider error dropped");
                Ok(())
            }
        }
    }
}
