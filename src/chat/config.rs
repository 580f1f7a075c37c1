// Server configuration with the relay's fixed defaults

use crate::chat::storage::HistoryPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_CERT_PATH: &str = "tls/cert.pem";
pub const DEFAULT_KEY_PATH: &str = "tls/key.pem";
pub const DEFAULT_HISTORY_PATH: &str = "history.log";
pub const DEFAULT_STATUS_PATH: &str = "status.json";
pub const DEFAULT_REPLAY_LIMIT: usize = 200;
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 512;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

/// Delay before a send is announced as typing
pub const TYPING_DELAY: Duration = Duration::from_millis(500);

/// How long a typing status stays visible after the last inbound line
pub const TYPING_WINDOW: Duration = Duration::from_secs(2);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub history_path: PathBuf,
    pub status_path: PathBuf,
    pub history_policy: HistoryPolicy,
    /// Lines of history replayed to a joining session
    pub replay_limit: usize,
    /// Lines buffered per session before the oldest is dropped
    pub outbound_capacity: usize,
    pub max_line_length: usize,
    /// Disconnect sessions that send nothing for this long
    pub idle_timeout: Option<Duration>,
    pub typing_delay: Duration,
    pub typing_window: Duration,
}

impl ServerConfig {
    /// Defaults with every file placed under `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            cert_path: dir.join(DEFAULT_CERT_PATH),
            key_path: dir.join(DEFAULT_KEY_PATH),
            history_path: dir.join(DEFAULT_HISTORY_PATH),
            status_path: dir.join(DEFAULT_STATUS_PATH),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            cert_path: PathBuf::from(DEFAULT_CERT_PATH),
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            history_path: PathBuf::from(DEFAULT_HISTORY_PATH),
            status_path: PathBuf::from(DEFAULT_STATUS_PATH),
            history_policy: HistoryPolicy::Truncate,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            idle_timeout: None,
            typing_delay: TYPING_DELAY,
            typing_window: TYPING_WINDOW,
        }
    }
}
