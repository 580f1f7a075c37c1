// CLI arguments for the relay server and the line client

use crate::chat::config::{
    ServerConfig, DEFAULT_CERT_PATH, DEFAULT_HISTORY_PATH, DEFAULT_KEY_PATH,
    DEFAULT_OUTBOUND_CAPACITY, DEFAULT_REPLAY_LIMIT, DEFAULT_STATUS_PATH,
};
use crate::chat::storage::HistoryPolicy;
use crate::chat::tls::CERT_HOST;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Chat relay server
///
/// Every flag defaults to the relay's fixed layout, so running without
/// arguments serves on port 9000 from the current directory.
#[derive(Debug, Parser)]
#[command(name = "chatrelay-server")]
#[command(about = "TLS multi-user chat relay with durable public history")]
pub struct ServerCli {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    pub bind: SocketAddr,

    /// Certificate file, generated on first run if missing
    #[arg(long, default_value = DEFAULT_CERT_PATH)]
    pub cert: PathBuf,

    /// Private key file, generated on first run if missing
    #[arg(long, default_value = DEFAULT_KEY_PATH)]
    pub key: PathBuf,

    /// Append-only public message log
    #[arg(long, default_value = DEFAULT_HISTORY_PATH)]
    pub history: PathBuf,

    /// Status snapshot document
    #[arg(long, default_value = DEFAULT_STATUS_PATH)]
    pub status: PathBuf,

    /// Keep the history log from previous runs instead of truncating it
    #[arg(long)]
    pub preserve_history: bool,

    /// History lines replayed to a joining user
    #[arg(long, default_value_t = DEFAULT_REPLAY_LIMIT)]
    pub replay_limit: usize,

    /// Lines buffered per user before the oldest is dropped
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Disconnect users idle for this many seconds (disabled by default)
    #[arg(long)]
    pub idle_timeout: Option<u64>,
}

impl ServerCli {
    /// Build the server configuration from the parsed flags
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            cert_path: self.cert,
            key_path: self.key,
            history_path: self.history,
            status_path: self.status,
            history_policy: if self.preserve_history {
                HistoryPolicy::Preserve
            } else {
                HistoryPolicy::Truncate
            },
            replay_limit: self.replay_limit,
            outbound_capacity: self.outbound_capacity,
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
            ..ServerConfig::default()
        }
    }
}

/// Line-mode chat client
#[derive(Debug, Parser)]
#[command(name = "chatrelay-client")]
#[command(about = "Connect to a chat relay and exchange lines over TLS")]
pub struct ClientCli {
    /// Server address
    #[arg(short, long, default_value = "localhost:9000")]
    pub addr: String,

    /// Server certificate to trust
    #[arg(long, default_value = DEFAULT_CERT_PATH)]
    pub ca: PathBuf,

    /// Name the server certificate is issued for
    #[arg(long, default_value = CERT_HOST)]
    pub server_name: String,

    /// Answer the username prompt automatically
    #[arg(short, long)]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults_match_config() {
        let cli = ServerCli::try_parse_from(["chatrelay-server"]).unwrap();
        let config = cli.into_config();
        let defaults = ServerConfig::default();

        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.cert_path, defaults.cert_path);
        assert_eq!(config.history_path, defaults.history_path);
        assert_eq!(config.history_policy, HistoryPolicy::Truncate);
        assert_eq!(config.replay_limit, defaults.replay_limit);
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_server_overrides() {
        let cli = ServerCli::try_parse_from([
            "chatrelay-server",
            "--bind",
            "127.0.0.1:9100",
            "--preserve-history",
            "--idle-timeout",
            "300",
        ])
        .unwrap();
        let config = cli.into_config();

        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.history_policy, HistoryPolicy::Preserve);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_client_parsing() {
        let cli = ClientCli::try_parse_from(["chatrelay-client", "-u", "alice"]).unwrap();
        assert_eq!(cli.addr, "localhost:9000");
        assert_eq!(cli.server_name, "localhost");
        assert_eq!(cli.username.as_deref(), Some("alice"));

        assert!(ClientCli::try_parse_from(["chatrelay-client", "--bogus"]).is_err());
    }
}
