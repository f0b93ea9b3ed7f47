use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

use crate::bridge::DEFAULT_CHANNEL;
use crate::session::SessionConfig;
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Address clients are steered to and that tags outgoing messages.
    pub public_address: String,
    pub redis_url: String,
    pub bus_channel: String,
    pub database_url: String,
    pub router_url: Option<String>,
    pub register_attempts: u32,
    pub register_backoff: Duration,
    pub session: SessionConfig,
    pub shutdown_grace: Duration,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "chat-relay",
    author,
    version,
    about = "Chat relay: WebSocket sessions fanned out across processes over Redis"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CHAT_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Address advertised to the router; defaults to ws://<listen-addr>.
    #[arg(long, env = "CHAT_RELAY_PUBLIC_ADDRESS")]
    pub public_address: Option<String>,

    /// Redis connection URI for the cross-process message bus.
    #[arg(long, env = "CHAT_RELAY_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "CHAT_RELAY_BUS_CHANNEL", default_value = DEFAULT_CHANNEL)]
    pub bus_channel: String,

    /// SQLite database holding chat history.
    #[arg(
        long,
        env = "CHAT_RELAY_DATABASE_URL",
        default_value = "sqlite://chat.db?mode=rwc"
    )]
    pub database_url: String,

    /// Router base URL. Without it the relay runs standalone.
    #[arg(long, env = "CHAT_RELAY_ROUTER_URL")]
    pub router_url: Option<String>,

    #[arg(long, env = "CHAT_RELAY_REGISTER_ATTEMPTS", default_value_t = 5)]
    pub register_attempts: u32,

    #[arg(long, env = "CHAT_RELAY_REGISTER_BACKOFF_MS", default_value_t = 1000)]
    pub register_backoff_ms: u64,

    /// Per-session outbound queue capacity.
    #[arg(long, env = "CHAT_RELAY_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    #[arg(long, env = "CHAT_RELAY_PING_INTERVAL_SECS", default_value_t = 54)]
    pub ping_interval_secs: u64,

    #[arg(long, env = "CHAT_RELAY_PONG_WAIT_SECS", default_value_t = 60)]
    pub pong_wait_secs: u64,

    #[arg(long, env = "CHAT_RELAY_WRITE_WAIT_SECS", default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CHAT_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "CHAT_RELAY_LOG", default_value = "info")]
    pub log_filter: String,

    /// Also export tracing spans to stdout via OpenTelemetry.
    #[arg(
        long,
        env = "CHAT_RELAY_OTEL_STDOUT",
        value_parser = clap::builder::BoolishValueParser::new(),
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub otel_stdout: bool,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.outbound_buffer > 0, "outbound buffer must be positive");
        ensure!(
            cli.ping_interval_secs < cli.pong_wait_secs,
            "ping interval ({}s) must be shorter than pong wait ({}s)",
            cli.ping_interval_secs,
            cli.pong_wait_secs
        );
        ensure!(cli.ping_interval_secs > 0, "ping interval must be positive");
        ensure!(!cli.log_filter.trim().is_empty(), "log filter must not be empty");

        let public_address = cli
            .public_address
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or_else(|| format!("ws://{listen_addr}"));
        let router_url = cli.router_url.filter(|url| !url.trim().is_empty());

        Ok(RelayConfig {
            listen_addr,
            public_address,
            redis_url: cli.redis_url,
            bus_channel: cli.bus_channel,
            database_url: cli.database_url,
            router_url,
            register_attempts: cli.register_attempts.max(1),
            register_backoff: Duration::from_millis(cli.register_backoff_ms),
            session: SessionConfig {
                outbound_buffer: cli.outbound_buffer,
                ping_interval: Duration::from_secs(cli.ping_interval_secs),
                pong_wait: Duration::from_secs(cli.pong_wait_secs),
                write_wait: Duration::from_secs(cli.write_wait_secs),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            telemetry: TelemetryConfig {
                log_filter: cli.log_filter,
                otel_stdout: cli.otel_stdout,
            },
        })
    }
}
