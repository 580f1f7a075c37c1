// Message and status types plus the wire formatting of relayed lines

use chrono::{DateTime, Local};
use std::fmt;

/// Synthetic sender used for join/leave announcements
pub const SERVER_SENDER: &str = "Server";

/// First bytes sent on every connection, no trailing newline
pub const USERNAME_PROMPT: &str = "Enter username: ";

/// Reply to `/help`
pub const HELP_TEXT: &str = "/msg <user> <msg>, /who, /users, /status <status>, /help";

/// Prefix of replayed history lines
pub const HISTORY_PREFIX: &str = "[History] ";

/// Prefix of every error line sent to a single session
pub const ERROR_PREFIX: &str = "[x] ";

/// Format an error line for the offending session
pub fn error_line(reason: impl fmt::Display) -> String {
    format!("{}{}", ERROR_PREFIX, reason)
}

/// A user's presence status
///
/// `Typing` and `Disconnected` are transient: they are never restored from
/// the snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Available,
    Typing,
    Disconnected,
    Custom(String),
}

impl Status {
    /// Parse a free-text status, recognizing the well-known values
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "available" => Status::Available,
            "typing" => Status::Typing,
            "disconnected" => Status::Disconnected,
            other => Status::Custom(other.to_string()),
        }
    }

    /// Whether this status only describes the moment it was set
    pub fn is_transient(&self) -> bool {
        matches!(self, Status::Typing | Status::Disconnected)
    }

    /// The status to resume with after a restart or reconnect
    pub fn resumable(&self) -> Status {
        if self.is_transient() {
            Status::Available
        } else {
            self.clone()
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Available => "available",
            Status::Typing => "typing",
            Status::Disconnected => "disconnected",
            Status::Custom(text) => text,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relayed chat message
#[derive(Debug, Clone)]
pub struct Message {
    pub sequence_id: u64,
    pub sender: String,
    pub body: String,
    /// `None` for public messages
    pub recipient: Option<String>,
    pub timestamp: DateTime<Local>,
}

impl Message {
    /// Create a public message stamped with the current local time
    pub fn public(sequence_id: u64, sender: &str, body: &str) -> Self {
        Self {
            sequence_id,
            sender: sender.to_string(),
            body: body.to_string(),
            recipient: None,
            timestamp: Local::now(),
        }
    }

    /// Create a private message stamped with the current local time
    pub fn private(sequence_id: u64, sender: &str, recipient: &str, body: &str) -> Self {
        Self {
            sequence_id,
            sender: sender.to_string(),
            body: body.to_string(),
            recipient: Some(recipient.to_string()),
            timestamp: Local::now(),
        }
    }

    /// `[HH:MM:SS] [sender] #id: body`
    pub fn format(&self) -> String {
        format!(
            "[{}] [{}] #{}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.sender,
            self.sequence_id,
            self.body
        )
    }

    /// Line delivered to the recipient of a private message
    pub fn format_for_recipient(&self) -> String {
        format!("[PM] {}", self.format())
    }

    /// Echo delivered to the sender of a private message
    pub fn format_for_sender(&self) -> String {
        match &self.recipient {
            Some(recipient) => format!("[PM to {}] {}", recipient, self.format()),
            None => self.format(),
        }
    }
}
