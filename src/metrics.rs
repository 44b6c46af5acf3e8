//! Prometheus counters for the webhook pipeline.
//!
//! Malformed payloads deliberately receive a 200 acknowledgment at the HTTP
//! boundary, so their rate is only visible here — scrape
//! `stayflow_webhook_malformed_total` to catch a broken provider
//! integration that the response codes will never reveal.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

pub struct GatewayMetrics {
    registry: Registry,
    /// Authenticated deliveries that reached the dispatcher.
    pub deliveries: IntCounter,
    /// Messages handed to the business handler and completed successfully.
    pub processed: IntCounter,
    /// Retransmissions dropped by the dedup window.
    pub duplicates: IntCounter,
    /// Messages dropped by the per-sender rate limiter.
    pub rate_limited: IntCounter,
    /// Handler failures and timeouts.
    pub handler_errors: IntCounter,
    /// Bodies rejected as invalid JSON or schema violations.
    pub malformed: IntCounter,
    /// Signature verification failures (the only 401 path).
    pub auth_failures: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name.to_string(), help.to_string())
        .unwrap_or_else(|_| IntCounter::new("stayflow_invalid", "invalid").expect("counter"));
    let _ = registry.register(Box::new(c.clone()));
    c
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        Self {
            deliveries: counter(
                &registry,
                "stayflow_webhook_deliveries_total",
                "Authenticated webhook deliveries dispatched",
            ),
            processed: counter(
                &registry,
                "stayflow_messages_processed_total",
                "Messages successfully handled downstream",
            ),
            duplicates: counter(
                &registry,
                "stayflow_messages_duplicate_total",
                "Messages dropped as retransmissions",
            ),
            rate_limited: counter(
                &registry,
                "stayflow_messages_rate_limited_total",
                "Messages dropped by the per-sender rate limiter",
            ),
            handler_errors: counter(
                &registry,
                "stayflow_handler_errors_total",
                "Business handler failures and timeouts",
            ),
            malformed: counter(
                &registry,
                "stayflow_webhook_malformed_total",
                "Deliveries acknowledged but not processed (bad JSON or schema)",
            ),
            auth_failures: counter(
                &registry,
                "stayflow_webhook_auth_failures_total",
                "Deliveries rejected for a missing or invalid signature",
            ),
            registry,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
