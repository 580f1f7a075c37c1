//! chatrelay - TLS multi-user chat relay
//!
//! Clients connect over TLS, pick a username and exchange public and
//! private lines routed through a central server. Public messages are
//! numbered in one global order and kept in a durable log that is replayed
//! to users as they join.

pub mod chat;

pub use chat::{ChatServer, ServerConfig};
