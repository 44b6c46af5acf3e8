use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use stayflow::config::Config;
use stayflow::gateway;

#[derive(Parser)]
#[command(name = "stayflow", version, about = "Stayflow guest-messaging webhook gateway")]
struct Cli {
    /// Path to config.toml (environment variables override file values).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook gateway.
    Gateway {
        /// Bind host; overrides the config file.
        #[arg(long)]
        host: Option<String>,
        /// Bind port; overrides the config file.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate the config file and print the resolved settings.
    Check,
    /// Print the JSON Schema for config.toml.
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STAYFLOW_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stayflow=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Gateway { host, port } => {
            let mut config = Config::load_or_default(cli.config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            gateway::run_gateway(config).await
        }
        Command::Check => {
            let config = Config::load_or_default(cli.config.as_deref())?;
            println!("config OK");
            println!("  gateway: {}:{}", config.gateway.host, config.gateway.port);
            println!(
                "  signature verification: {}",
                if config.webhook.app_secret.is_some() {
                    "enabled"
                } else {
                    "DISABLED"
                }
            );
            println!(
                "  dedup: ttl {}s, sweep every {}s, max {} ids",
                config.webhook.dedup_ttl_secs,
                config.webhook.dedup_sweep_secs,
                config.webhook.dedup_max_entries
            );
            println!(
                "  rate limit: {} messages / {}s per sender",
                config.webhook.rate_limit_per_window, config.webhook.rate_limit_window_secs
            );
            println!(
                "  handler timeout: {}s",
                config.webhook.handler_timeout_secs
            );
            println!(
                "  outbound channel: {}",
                if config.channel.is_some() { "cloud" } else { "disabled" }
            );
            println!(
                "  forward targets: {}",
                config
                    .forward
                    .as_ref()
                    .map_or("none (audit-only)".to_string(), |f| f.message_url.clone())
            );
            Ok(())
        }
        Command::Schema => {
            println!("{}", Config::json_schema_pretty());
            Ok(())
        }
    }
}
