// Chat relay core
//
// This module provides the server side of a TLS line-protocol chat relay:
// the session registry, the broadcast router, per-connection sessions and
// the persistence they rely on.

pub mod error;
pub mod message;
pub mod command;
pub mod outbound;
pub mod storage;
pub mod registry;
pub mod router;
pub mod session;
pub mod tls;
pub mod config;
pub mod server;
pub mod cli;

pub use error::{PublishError, RegisterError, StatusError};
pub use message::{Message, Status};
pub use command::Command;
pub use outbound::{OutboundQueue, PushOutcome};
pub use storage::{HistoryLog, HistoryPolicy, StatusStore};
pub use registry::{Registry, SessionHandle, SessionInfo, UserStatus};
pub use router::{Delivery, Router};
pub use session::serve_connection;
pub use config::ServerConfig;
pub use server::ChatServer;
pub use cli::{ClientCli, ServerCli};
