// Client session: handshake, reader loop, writer task and disconnect path

use crate::chat::command::Command;
use crate::chat::config::ServerConfig;
use crate::chat::message::{error_line, Status, HELP_TEXT, USERNAME_PROMPT};
use crate::chat::outbound::OutboundQueue;
use crate::chat::registry::{SessionHandle, UserStatus};
use crate::chat::router::Router;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// How long a closing session waits for its writer to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why an active session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    EndOfStream,
    ReadError(String),
    WriteError,
    LineTooLong,
    IdleTimeout,
}

/// `Online: alice (available), bob (away)`
pub fn format_who(users: &[UserStatus]) -> String {
    let online: Vec<String> = users
        .iter()
        .map(|u| format!("{} ({})", u.username, u.status))
        .collect();
    format!("Online: {}", online.join(", "))
}

/// `All users: me [available], alice [away], ...` with the requester first
pub fn format_users(requester: &str, users: &[UserStatus]) -> String {
    let mut listed: Vec<String> = users
        .iter()
        .filter(|u| u.username == requester)
        .chain(users.iter().filter(|u| u.username != requester))
        .map(|u| format!("{} [{}]", u.username, u.status))
        .collect();
    if listed.is_empty() {
        listed.push(format!("{} [{}]", requester, Status::Available));
    }
    format!("All users: {}", listed.join(", "))
}

type LineReader<R> = FramedRead<R, LinesCodec>;

/// Serve one connection from the username prompt until it closes
///
/// Generic over the stream so that TLS sockets and in-memory pipes share
/// the same code path.
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(config.max_line_length));

    // Handshake
    if let Err(e) = write_prompt(&mut write_half).await {
        tracing::debug!("Failed to send prompt to {}: {}", peer, e);
        return;
    }

    let username = match next_line(&mut lines, config.idle_timeout).await {
        Some(Ok(line)) => line.trim().to_string(),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            tracing::info!("Rejected over-long username from {}", peer);
            reject(&mut write_half, "Line too long").await;
            return;
        }
        _ => {
            tracing::debug!("{} closed before choosing a username", peer);
            return;
        }
    };

    let handle = match router.join(&username).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::info!("Rejected {:?} from {}: {}", username, peer, e);
            reject(&mut write_half, e).await;
            return;
        }
    };

    tracing::info!("👤 {} joined from {}", username, peer);

    // Active
    let cancel = CancellationToken::new();
    let mut writer = tokio::spawn(run_writer(
        write_half,
        handle.queue.clone(),
        cancel.clone(),
        username.clone(),
    ));

    router
        .announce(&format!("{} has joined ({}).", username, handle.status))
        .await;

    let session = ActiveSession {
        handle,
        router,
        config,
    };
    let reason = session.read_loop(&mut lines, &cancel).await;

    // Closing
    tracing::info!("👋 {} left: {:?}", session.handle.username, reason);
    session.close().await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        tracing::warn!(
            "Writer for {} did not drain in time, aborting",
            session.handle.username
        );
        writer.abort();
    }
}

async fn write_prompt<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(USERNAME_PROMPT.as_bytes()).await?;
    writer.flush().await
}

/// Read the handshake line, honouring the idle timeout
///
/// `None` means the peer closed or stayed silent for too long.
async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut LineReader<R>,
    timeout: Option<Duration>,
) -> Option<Result<String, LinesCodecError>> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, lines.next()).await.ok()?,
        None => lines.next().await,
    }
}

/// Send a single error line and close the write side
async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, reason: impl std::fmt::Display) {
    let rejection = format!("{}\n", error_line(reason));
    let _ = writer.write_all(rejection.as_bytes()).await;
    let _ = writer.shutdown().await;
}

/// Drain the outbound queue into the socket, in enqueue order
///
/// Ends when the queue is closed and empty, or on the first write error,
/// which cancels the reader.
async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
    username: String,
) {
    while let Some(line) = queue.recv().await {
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            if queue.is_empty() {
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            tracing::debug!("Write to {} failed: {}", username, e);
            cancel.cancel();
            return;
        }
    }

    let _ = writer.shutdown().await;
}

struct ActiveSession {
    handle: SessionHandle,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
}

impl ActiveSession {
    fn username(&self) -> &str {
        &self.handle.username
    }

    fn reply(&self, line: String) {
        Router::deliver(self.username(), &self.handle.queue, line);
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        &self,
        lines: &mut LineReader<R>,
        cancel: &CancellationToken,
    ) -> CloseReason {
        let mut typing_due: Option<Instant> = None;
        let mut last_input = Instant::now();

        loop {
            let idle_deadline = self.config.idle_timeout.map(|t| last_input + t);

            tokio::select! {
                _ = cancel.cancelled() => return CloseReason::WriteError,

                _ = sleep_until(typing_due.unwrap_or_else(Instant::now)), if typing_due.is_some() => {
                    typing_due = None;
                    let announced = self
                        .router
                        .registry()
                        .announce_typing(self.username(), self.handle.connection_id)
                        .await;
                    if announced {
                        tracing::debug!("{} is typing", self.username());
                    }
                }

                _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    tracing::warn!("{} idle for too long, disconnecting", self.username());
                    return CloseReason::IdleTimeout;
                }

                next = lines.next() => match next {
                    None => return CloseReason::EndOfStream,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        self.reply(error_line("Line too long"));
                        return CloseReason::LineTooLong;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return CloseReason::ReadError(e.to_string()),
                    Some(Ok(line)) => {
                        last_input = Instant::now();
                        if let Some(due) = self.dispatch(&line).await {
                            typing_due = Some(due);
                        }
                        self.router
                            .registry()
                            .touch(self.username(), self.handle.connection_id)
                            .await;
                    }
                },
            }
        }
    }

    /// Handle one inbound line; returns the typing deadline if it was a send
    async fn dispatch(&self, line: &str) -> Option<Instant> {
        tracing::debug!("Received from {}: {}", self.username(), line);

        let command = Command::parse(line);
        let registry = self.router.registry();

        match &command {
            Command::Private { recipient, body } => {
                // Errors were already reported to the sender by the router
                let _ = self
                    .router
                    .publish(self.username(), body, Some(recipient.as_str()))
                    .await;
            }
            Command::MalformedPrivate => {
                self.reply(error_line("Usage: /msg username message"));
            }
            Command::Status(text) => {
                if let Err(e) = registry.set_status(self.username(), Status::parse(text)).await {
                    self.reply(error_line(e));
                }
            }
            Command::Who => {
                let users = registry.snapshot_online_users().await;
                self.reply(format_who(&users));
            }
            Command::Users => {
                let users = registry.snapshot_users().await;
                self.reply(format_users(self.username(), &users));
            }
            Command::Help => {
                self.reply(HELP_TEXT.to_string());
            }
            Command::Say(body) => {
                let _ = self.router.publish(self.username(), body, None).await;
            }
        }

        if !command.is_send() {
            return None;
        }
        registry
            .arm_typing(
                self.username(),
                self.handle.connection_id,
                self.config.typing_delay,
            )
            .await
    }

    /// Detach from the registry and announce the departure, once
    async fn close(&self) {
        let detached = self
            .router
            .registry()
            .mark_disconnected(self.username(), self.handle.connection_id)
            .await;

        if detached {
            self.router
                .announce(&format!("{} has disconnected.", self.username()))
                .await;
        }
    }
}
