use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub listen_addr: SocketAddr,
    pub log_filter: String,
}

#[derive(Debug, Parser)]
#[command(
    name = "chat-router",
    author,
    version,
    about = "Routes new chat clients to the least-loaded relay"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "CHAT_ROUTER_LISTEN_ADDR", default_value = "0.0.0.0:9000")]
    pub listen_addr: String,

    /// Tracing filter used when RUST_LOG is unset.
    #[arg(long, env = "CHAT_ROUTER_LOG", default_value = "info")]
    pub log_filter: String,
}

impl TryFrom<Cli> for RouterConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(RouterConfig {
            listen_addr,
            log_filter: cli.log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_parse() {
        let cli = Cli::parse_from(["chat-router"]);
        let config = RouterConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_addr() {
        let cli = Cli::parse_from(["chat-router", "--listen-addr", "nowhere"]);
        assert!(RouterConfig::try_from(cli).is_err());
    }
}
