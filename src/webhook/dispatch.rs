//! Event dispatcher: walks a validated envelope and drives each item
//! through dedup, rate limiting, and the timeout-guarded business handler.
//!
//! Items are processed sequentially, in array order. Downstream handlers
//! may share per-tenant conversation state that is not concurrency-safe,
//! and message order from one guest matters to it, so there is no fan-out
//! inside a delivery. One item's failure never touches its siblings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{self, AuditEvent, AuditKind, AuditSink};
use crate::channels::{Channel, SendMessage};
use crate::error::PipelineError;
use crate::handlers::EventHandler;
use crate::metrics::GatewayMetrics;
use crate::webhook::dedup::DedupWindow;
use crate::webhook::envelope::{
    self, Change, ChangeError, Entry, IncomingMessage, StatusUpdate, WebhookEnvelope,
};
use crate::webhook::rate_limit::SenderRateLimiter;

/// Guest-facing texts for the two user-visible failure paths. No internal
/// error detail ever leaves through the messaging channel.
const SLOW_DOWN_TEXT: &str =
    "You're sending messages a little too quickly. Please wait a moment and try again.";
const APOLOGY_TEXT: &str =
    "Sorry, we couldn't process your message right now. Please try again in a few minutes.";

pub struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    outbound: Arc<dyn Channel>,
    dedup: Arc<DedupWindow>,
    limiter: Arc<SenderRateLimiter>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<GatewayMetrics>,
    handler_timeout: Duration,
}

/// Per-delivery outcome counts, for the dispatch log line and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub messages_processed: usize,
    pub duplicates: usize,
    pub rate_limited: usize,
    pub failures: usize,
    pub statuses_processed: usize,
    pub provider_errors: usize,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        outbound: Arc<dyn Channel>,
        dedup: Arc<DedupWindow>,
        limiter: Arc<SenderRateLimiter>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<GatewayMetrics>,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            handler,
            outbound,
            dedup,
            limiter,
            audit,
            metrics,
            handler_timeout,
        }
    }

    /// Process one validated delivery. Never fails: every per-item error is
    /// contained, audited, and reflected in the summary.
    pub async fn process(&self, delivery: &WebhookEnvelope) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        let tenant = delivery.entry.first().map_or("-", |e| e.id.as_str());
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::received(
                tenant,
                delivery.message_count(),
                delivery.status_count(),
                delivery.error_count(),
            ),
        )
        .await;

        for entry in &delivery.entry {
            for change in &entry.changes {
                if change.field != envelope::MESSAGES_FIELD {
                    continue;
                }
                for message in &change.value.messages {
                    self.process_message(&delivery.object, entry, change, message, &mut summary)
                        .await;
                }
                for status in &change.value.statuses {
                    self.process_status(&delivery.object, entry, change, status, &mut summary)
                        .await;
                }
                for error in &change.value.errors {
                    self.process_error(&delivery.object, entry, change, error, &mut summary)
                        .await;
                }
            }
        }

        summary
    }

    async fn process_message(
        &self,
        object: &str,
        entry: &Entry,
        change: &Change,
        message: &IncomingMessage,
        summary: &mut DispatchSummary,
    ) {
        // Seen-check and mark are one atomic step; the provider can deliver
        // a retry on a second connection before this request completes.
        if !self.dedup.accept(&message.id) {
            summary.duplicates += 1;
            self.metrics.duplicates.inc();
            audit::emit(
                self.audit.as_ref(),
                AuditEvent::message(
                    AuditKind::DuplicateSkipped,
                    &entry.id,
                    &message.id,
                    &message.from,
                    None,
                ),
            )
            .await;
            return;
        }

        if let Err(err) = self.limiter.check_limit(&message.from) {
            summary.rate_limited += 1;
            self.metrics.rate_limited.inc();
            audit::emit(
                self.audit.as_ref(),
                AuditEvent::message(AuditKind::Error, &entry.id, &message.id, &message.from, None)
                    .with_error(err.to_string()),
            )
            .await;
            self.notify(&message.from, SLOW_DOWN_TEXT).await;
            return;
        }

        audit::emit(
            self.audit.as_ref(),
            AuditEvent::message(
                AuditKind::Processing,
                &entry.id,
                &message.id,
                &message.from,
                message.body(),
            ),
        )
        .await;

        let sub = envelope::single_message_envelope(object, entry, change, message);
        match self
            .invoke_with_deadline(&message.id, self.handler.handle_message(&sub))
            .await
        {
            Ok(()) => {
                summary.messages_processed += 1;
                self.metrics.processed.inc();
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::message(
                        AuditKind::Processed,
                        &entry.id,
                        &message.id,
                        &message.from,
                        None,
                    ),
                )
                .await;
            }
            Err(err) => {
                summary.failures += 1;
                self.metrics.handler_errors.inc();
                tracing::error!("message handler failed: {err}");
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::message(
                        AuditKind::Error,
                        &entry.id,
                        &message.id,
                        &message.from,
                        None,
                    )
                    .with_error(err.to_string()),
                )
                .await;
                self.notify(&message.from, APOLOGY_TEXT).await;
            }
        }
    }

    async fn process_status(
        &self,
        object: &str,
        entry: &Entry,
        change: &Change,
        status: &StatusUpdate,
        summary: &mut DispatchSummary,
    ) {
        // No dedup, no rate limit: status handling is idempotent downstream
        // and statuses are provider-generated, not guest-generated.
        let sub = envelope::single_status_envelope(object, entry, change, status);
        match self
            .invoke_with_deadline(&status.id, self.handler.handle_status(&sub))
            .await
        {
            Ok(()) => {
                summary.statuses_processed += 1;
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::status(&entry.id, &status.id, &status.status, &status.recipient_id),
                )
                .await;
            }
            Err(err) => {
                summary.failures += 1;
                self.metrics.handler_errors.inc();
                tracing::warn!("status handler failed: {err}");
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(
                        AuditKind::Error,
                        &entry.id,
                        serde_json::json!({"status_id": status.id}),
                    )
                    .with_error(err.to_string()),
                )
                .await;
            }
        }
    }

    async fn process_error(
        &self,
        object: &str,
        entry: &Entry,
        change: &Change,
        error: &ChangeError,
        summary: &mut DispatchSummary,
    ) {
        summary.provider_errors += 1;
        let sub = envelope::single_error_envelope(object, entry, change, error);
        if let Err(err) = self
            .invoke_with_deadline("provider-error", self.handler.handle_error(&sub))
            .await
        {
            summary.failures += 1;
            self.metrics.handler_errors.inc();
            tracing::warn!("error handler failed: {err}");
            audit::emit(
                self.audit.as_ref(),
                AuditEvent::new(
                    AuditKind::Error,
                    &entry.id,
                    serde_json::json!({"provider_error_code": error.code}),
                )
                .with_error(err.to_string()),
            )
            .await;
        }
    }

    /// Race the handler against the configured budget. On expiry the future
    /// is dropped; whatever side effect it started downstream may still
    /// finish, which is why handlers must be idempotent.
    async fn invoke_with_deadline<F>(&self, label: &str, operation: F) -> Result<(), PipelineError>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match tokio::time::timeout(self.handler_timeout, operation).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(PipelineError::HandlerFailure {
                label: label.to_string(),
                source,
            }),
            Err(_) => Err(PipelineError::HandlerTimeout {
                label: label.to_string(),
                timeout: self.handler_timeout,
            }),
        }
    }

    /// Best-effort guest notification; failures are logged and discarded.
    async fn notify(&self, recipient: &str, text: &str) {
        if let Err(err) = self
            .outbound
            .send(&SendMessage::new(text, recipient))
            .await
        {
            tracing::debug!(
                "notification send failed for {}: {err:#}",
                audit::redact_phone(recipient)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Instant;

    /// Handler that records invocation order and fails or hangs on demand.
    #[derive(Default)]
    struct ScriptedHandler {
        calls: Mutex<Vec<String>>,
        fail_ids: HashSet<String>,
        hang_ids: HashSet<String>,
    }

    impl ScriptedHandler {
        fn failing_on(ids: &[&str]) -> Self {
            Self {
                fail_ids: ids.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn hanging_on(ids: &[&str]) -> Self {
            Self {
                hang_ids: ids.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle_message(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()> {
            let id = envelope.entry[0].changes[0].value.messages[0].id.clone();
            self.calls.lock().push(id.clone());
            if self.hang_ids.contains(&id) {
                std::future::pending::<()>().await;
            }
            if self.fail_ids.contains(&id) {
                anyhow::bail!("scripted failure for {id}");
            }
            Ok(())
        }

        async fn handle_status(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()> {
            let id = envelope.entry[0].changes[0].value.statuses[0].id.clone();
            self.calls.lock().push(format!("status:{id}"));
            if self.fail_ids.contains(&id) {
                anyhow::bail!("scripted status failure for {id}");
            }
            Ok(())
        }

        async fn handle_error(&self, _envelope: &WebhookEnvelope) -> anyhow::Result<()> {
            self.calls.lock().push("error".to_string());
            Ok(())
        }
    }

    /// Channel that records every outbound text.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<SendMessage>>,
    }

    impl RecordingChannel {
        fn sent(&self) -> Vec<SendMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        handler: Arc<ScriptedHandler>,
        channel: Arc<RecordingChannel>,
        sink: Arc<MemoryAuditSink>,
        metrics: Arc<GatewayMetrics>,
    }

    fn fixture(handler: ScriptedHandler, rate_limit: u32, timeout: Duration) -> Fixture {
        let handler = Arc::new(handler);
        let channel = Arc::new(RecordingChannel::default());
        let sink = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let dispatcher = Dispatcher::new(
            handler.clone(),
            channel.clone(),
            Arc::new(DedupWindow::new(Duration::from_secs(300), 10_000)),
            Arc::new(SenderRateLimiter::new(
                rate_limit,
                Duration::from_secs(60),
                1_000,
            )),
            sink.clone(),
            metrics.clone(),
            timeout,
        );
        Fixture {
            dispatcher,
            handler,
            channel,
            sink,
            metrics,
        }
    }

    fn delivery(message_ids: &[&str]) -> WebhookEnvelope {
        let messages: Vec<serde_json::Value> = message_ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "from": "4915123456789",
                    "type": "text",
                    "text": {"body": format!("message {id}")},
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "acct-100",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "metadata": {"phone_number_id": "pn-1"},
                        "messages": messages,
                    }
                }]
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn same_delivery_twice_invokes_handler_once() {
        let f = fixture(ScriptedHandler::default(), 0, Duration::from_secs(5));
        let envelope = delivery(&["wamid.m1"]);

        let first = f.dispatcher.process(&envelope).await;
        let second = f.dispatcher.process(&envelope).await;

        assert_eq!(first.messages_processed, 1);
        assert_eq!(second.messages_processed, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(f.handler.calls(), vec!["wamid.m1"]);

        let kinds = f.sink.kinds();
        assert_eq!(
            kinds.iter().filter(|k| **k == AuditKind::Processed).count(),
            1
        );
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == AuditKind::DuplicateSkipped)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn siblings_run_in_order_and_survive_a_failure() {
        let f = fixture(
            ScriptedHandler::failing_on(&["wamid.m2"]),
            0,
            Duration::from_secs(5),
        );
        let summary = f
            .dispatcher
            .process(&delivery(&["wamid.m1", "wamid.m2", "wamid.m3"]))
            .await;

        assert_eq!(f.handler.calls(), vec!["wamid.m1", "wamid.m2", "wamid.m3"]);
        assert_eq!(summary.messages_processed, 2);
        assert_eq!(summary.failures, 1);

        // Exactly one apology, for the failed message's sender.
        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, APOLOGY_TEXT);
        assert_eq!(sent[0].recipient, "4915123456789");
    }

    #[tokio::test]
    async fn stalled_handler_times_out_and_siblings_still_run() {
        let f = fixture(
            ScriptedHandler::hanging_on(&["wamid.m1"]),
            0,
            Duration::from_millis(50),
        );

        let started = Instant::now();
        let summary = f
            .dispatcher
            .process(&delivery(&["wamid.m1", "wamid.m2"]))
            .await;

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.messages_processed, 1);
        assert_eq!(f.handler.calls(), vec!["wamid.m1", "wamid.m2"]);
        // The batch is delayed by at most roughly one timeout budget.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(f.metrics.handler_errors.get(), 1);

        let errors: Vec<_> = f
            .sink
            .events()
            .into_iter()
            .filter(|e| e.kind == AuditKind::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn rate_limit_ceiling_drops_excess_with_one_notice_each() {
        let f = fixture(ScriptedHandler::default(), 2, Duration::from_secs(5));
        let summary = f
            .dispatcher
            .process(&delivery(&["wamid.m1", "wamid.m2", "wamid.m3"]))
            .await;

        assert_eq!(summary.messages_processed, 2);
        assert_eq!(summary.rate_limited, 1);
        assert_eq!(f.handler.calls(), vec!["wamid.m1", "wamid.m2"]);

        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, SLOW_DOWN_TEXT);
        assert_eq!(f.metrics.rate_limited.get(), 1);
    }

    #[tokio::test]
    async fn rate_limited_message_is_not_retried_later() {
        let f = fixture(ScriptedHandler::default(), 1, Duration::from_secs(5));
        f.dispatcher
            .process(&delivery(&["wamid.m1", "wamid.m2"]))
            .await;

        // m2 was dropped by the limiter but marked seen: a provider retry
        // of the same delivery is pure duplicate traffic.
        let retry = f.dispatcher.process(&delivery(&["wamid.m1", "wamid.m2"])).await;
        assert_eq!(retry.duplicates, 2);
        assert_eq!(retry.messages_processed, 0);
        assert_eq!(f.handler.calls(), vec!["wamid.m1"]);
    }

    #[tokio::test]
    async fn statuses_bypass_dedup_and_rate_limiting() {
        let f = fixture(ScriptedHandler::default(), 1, Duration::from_secs(5));
        let envelope: WebhookEnvelope = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "acct-100",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "statuses": [
                            {"id": "wamid.out1", "status": "delivered", "recipient_id": "49151"},
                            {"id": "wamid.out1", "status": "read", "recipient_id": "49151"},
                        ]
                    }
                }]
            }]
        }))
        .unwrap();

        let summary = f.dispatcher.process(&envelope).await;
        // The repeated status id is processed both times.
        assert_eq!(summary.statuses_processed, 2);
        assert_eq!(
            f.handler.calls(),
            vec!["status:wamid.out1", "status:wamid.out1"]
        );
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn status_failures_are_logged_without_guest_notification() {
        let f = fixture(
            ScriptedHandler::failing_on(&["wamid.out1"]),
            0,
            Duration::from_secs(5),
        );
        let envelope: WebhookEnvelope = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "acct-100",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "statuses": [{"id": "wamid.out1", "status": "failed", "recipient_id": "49151"}]
                    }
                }]
            }]
        }))
        .unwrap();

        let summary = f.dispatcher.process(&envelope).await;
        assert_eq!(summary.failures, 1);
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn non_message_change_fields_are_ignored() {
        let f = fixture(ScriptedHandler::default(), 0, Duration::from_secs(5));
        let envelope: WebhookEnvelope = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "acct-100",
                "changes": [{
                    "field": "account_update",
                    "value": {
                        "messages": [{"id": "wamid.m1", "from": "49151", "type": "text"}]
                    }
                }]
            }]
        }))
        .unwrap();

        let summary = f.dispatcher.process(&envelope).await;
        assert!(f.handler.calls().is_empty());
        assert_eq!(summary, DispatchSummary::default());
    }

    #[tokio::test]
    async fn handler_receives_single_message_sub_envelopes() {
        #[derive(Default)]
        struct CapturingHandler {
            envelopes: Mutex<Vec<WebhookEnvelope>>,
        }

        #[async_trait]
        impl EventHandler for CapturingHandler {
            async fn handle_message(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()> {
                self.envelopes.lock().push(envelope.clone());
                Ok(())
            }
            async fn handle_status(&self, _e: &WebhookEnvelope) -> anyhow::Result<()> {
                Ok(())
            }
            async fn handle_error(&self, _e: &WebhookEnvelope) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let handler = Arc::new(CapturingHandler::default());
        let dispatcher = Dispatcher::new(
            handler.clone(),
            Arc::new(RecordingChannel::default()),
            Arc::new(DedupWindow::new(Duration::from_secs(300), 100)),
            Arc::new(SenderRateLimiter::new(0, Duration::from_secs(60), 100)),
            Arc::new(MemoryAuditSink::new()),
            Arc::new(GatewayMetrics::new()),
            Duration::from_secs(5),
        );

        dispatcher
            .process(&delivery(&["wamid.m1", "wamid.m2"]))
            .await;

        let captured = handler.envelopes.lock();
        assert_eq!(captured.len(), 2);
        for sub in captured.iter() {
            assert_eq!(sub.object, "whatsapp_business_account");
            assert_eq!(sub.message_count(), 1);
            assert_eq!(sub.entry[0].id, "acct-100");
            assert_eq!(
                sub.entry[0].changes[0]
                    .value
                    .metadata
                    .as_ref()
                    .and_then(|m| m.phone_number_id.as_deref()),
                Some("pn-1")
            );
        }
        assert_eq!(captured[0].entry[0].changes[0].value.messages[0].id, "wamid.m1");
        assert_eq!(captured[1].entry[0].changes[0].value.messages[0].id, "wamid.m2");
    }

    #[tokio::test]
    async fn outbound_send_failure_is_swallowed() {
        struct FailingChannel;

        #[async_trait]
        impl Channel for FailingChannel {
            fn name(&self) -> &str {
                "failing"
            }
            async fn send(&self, _message: &SendMessage) -> anyhow::Result<()> {
                anyhow::bail!("provider unreachable")
            }
            async fn health_check(&self) -> bool {
                false
            }
        }

        let handler = Arc::new(ScriptedHandler::failing_on(&["wamid.m1"]));
        let dispatcher = Dispatcher::new(
            handler.clone(),
            Arc::new(FailingChannel),
            Arc::new(DedupWindow::new(Duration::from_secs(300), 100)),
            Arc::new(SenderRateLimiter::new(0, Duration::from_secs(60), 100)),
            Arc::new(MemoryAuditSink::new()),
            Arc::new(GatewayMetrics::new()),
            Duration::from_secs(5),
        );

        // The apology send fails; the delivery still completes normally.
        let summary = dispatcher.process(&delivery(&["wamid.m1", "wamid.m2"])).await;
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.messages_processed, 1);
    }
}
