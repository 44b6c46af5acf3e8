//! The inbound webhook pipeline.
//!
//! Flow per delivery: signature verification on the raw bytes → schema
//! validation of the parsed JSON → dispatcher walk (dedup → rate limit →
//! timeout-guarded handler, per item). The HTTP layer in
//! [`crate::gateway`] acknowledges the provider independently of per-item
//! outcomes.

pub mod dedup;
pub mod dispatch;
pub mod envelope;
pub mod rate_limit;
pub mod signature;

pub use dedup::DedupWindow;
pub use dispatch::{DispatchSummary, Dispatcher};
pub use envelope::{SchemaViolation, WebhookEnvelope};
pub use rate_limit::SenderRateLimiter;
pub use signature::{compute_signature, verify_signature, SIGNATURE_HEADER};
