//! Gateway configuration: a TOML file plus environment overrides.
//!
//! Environment variables win over file values so deploy secrets never
//! have to live in the file. Every knob has a default; an empty config is
//! a valid local-development setup (with signature verification disabled,
//! loudly).

use std::path::Path;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Outbound cloud messaging channel; omit to disable guest notices.
    #[serde(default)]
    pub channel: Option<CloudChannelConfig>,
    /// HTTP forwarding targets for the platform's business handlers; omit
    /// to run the gateway in audit-only mode.
    #[serde(default)]
    pub forward: Option<ForwardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Binding to a non-loopback address requires this explicit opt-in.
    #[serde(default)]
    pub allow_public_bind: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allow_public_bind: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebhookConfig {
    /// Token echoed back during the provider's GET verification handshake.
    #[serde(default)]
    pub verify_token: Option<String>,
    /// Shared secret for `X-Hub-Signature-256` verification. Unset means
    /// verification is skipped (local development only).
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Accepted messages per sender per window; 0 disables the limiter.
    #[serde(default = "default_rate_limit_per_window")]
    pub rate_limit_per_window: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_max_senders")]
    pub rate_limit_max_senders: usize,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_dedup_sweep_secs")]
    pub dedup_sweep_secs: u64,
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,
    /// Hard budget for one business-handler invocation.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            verify_token: None,
            app_secret: None,
            rate_limit_per_window: default_rate_limit_per_window(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_max_senders: default_rate_limit_max_senders(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            dedup_sweep_secs: default_dedup_sweep_secs(),
            dedup_max_entries: default_dedup_max_entries(),
            handler_timeout_secs: default_handler_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CloudChannelConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub phone_number_id: String,
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ForwardConfig {
    /// Target for single-message sub-envelopes.
    pub message_url: String,
    /// Target for status sub-envelopes; omitted statuses are dropped.
    #[serde(default)]
    pub status_url: Option<String>,
    /// Target for provider-error sub-envelopes; omitted errors are dropped.
    #[serde(default)]
    pub error_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8480
}
fn default_rate_limit_per_window() -> u32 {
    20
}
fn default_rate_limit_window_secs() -> u64 {
    60
}
fn default_rate_limit_max_senders() -> usize {
    10_000
}
fn default_dedup_ttl_secs() -> u64 {
    300
}
fn default_dedup_sweep_secs() -> u64 {
    60
}
fn default_dedup_max_entries() -> usize {
    100_000
}
fn default_handler_timeout_secs() -> u64 {
    30
}
fn default_api_url() -> String {
    "https://graph.facebook.com/v19.0".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path`, or start from defaults when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(secret) = env_value("STAYFLOW_APP_SECRET") {
            self.webhook.app_secret = Some(secret);
        }
        if let Some(token) = env_value("STAYFLOW_VERIFY_TOKEN") {
            self.webhook.verify_token = Some(token);
        }
        if let Some(token) = env_value("STAYFLOW_ACCESS_TOKEN") {
            if let Some(channel) = self.channel.as_mut() {
                channel.access_token = token;
            }
        }
    }

    /// JSON Schema for `config.toml`, for editor completion and CI checks.
    pub fn json_schema_pretty() -> String {
        serde_json::to_string_pretty(&schemars::schema_for!(Config)).unwrap_or_default()
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
