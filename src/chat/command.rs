// Parsing of inbound session lines into commands

/// A parsed inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/msg <user> <text>`
    Private { recipient: String, body: String },
    /// `/msg` with fewer than two arguments
    MalformedPrivate,
    /// `/status <text>`, text may be empty
    Status(String),
    /// `/who`
    Who,
    /// `/users`
    Users,
    /// `/help`
    Help,
    /// Anything else is a public message body
    Say(String),
}

impl Command {
    /// Parse one line with its line terminator already stripped
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim_end();

        if trimmed == "/msg" || trimmed.starts_with("/msg ") {
            let mut parts = trimmed["/msg".len()..].trim_start().splitn(2, ' ');
            let recipient = parts.next().unwrap_or_default();
            let body = parts.next().map(str::trim).unwrap_or_default();
            if recipient.is_empty() || body.is_empty() {
                return Command::MalformedPrivate;
            }
            return Command::Private {
                recipient: recipient.to_string(),
                body: body.to_string(),
            };
        }

        if trimmed == "/status" || trimmed.starts_with("/status ") {
            return Command::Status(trimmed["/status".len()..].trim().to_string());
        }

        match trimmed {
            "/who" => Command::Who,
            "/users" => Command::Users,
            "/help" => Command::Help,
            _ => Command::Say(trimmed.to_string()),
        }
    }

    /// Whether this command sends a message (and so arms the typing timer)
    pub fn is_send(&self) -> bool {
        matches!(self, Command::Private { .. } | Command::Say(_))
    }
}
