// Error types for the chat relay core

use thiserror::Error;

/// Why a username could not be attached to a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("Username must not be empty")]
    EmptyUsername,
    #[error("Username must not contain spaces")]
    InvalidUsername,
    #[error("Username {0} is reserved")]
    Reserved(String),
    #[error("User already online")]
    AlreadyOnline,
}

/// Why a publish was not delivered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Sender has no registry entry (e.g. raced with a disconnect)
    #[error("sender {0} not found")]
    UnknownSender(String),
    /// Private recipient does not exist or is not connected
    #[error("User not found or offline")]
    RecipientUnavailable(String),
}

/// Why a status update was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("user {0} not found")]
    UnknownUser(String),
    #[error("Usage: /status <status>")]
    EmptyStatus,
}
