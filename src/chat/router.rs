// Broadcast router: sequencing, fan-out and durable logging of messages

use crate::chat::error::{PublishError, RegisterError};
use crate::chat::message::{error_line, Message, HISTORY_PREFIX, SERVER_SENDER};
use crate::chat::outbound::{OutboundQueue, PushOutcome};
use crate::chat::registry::{Registry, SessionHandle};
use crate::chat::storage::HistoryLog;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Acknowledgement of a delivered publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Public { sequence_id: u64, recipients: usize },
    Private { sequence_id: u64, recipient: String },
}

/// Resolves recipients and fans messages out to their outbound queues
///
/// Public messages are numbered under the sequence section, which is held
/// for the whole fan-out and log append so that every session and the log
/// observe the same order. Lock order is always sequence, then registry or
/// history; the registry section is released before anything is enqueued.
pub struct Router {
    registry: Arc<Registry>,
    history: Option<Arc<HistoryLog>>,
    /// Id the next public message will receive
    sequence: Mutex<u64>,
    replay_limit: usize,
}

impl Router {
    /// Create a router; sequence ids start at 1
    pub fn new(
        registry: Arc<Registry>,
        history: Option<Arc<HistoryLog>>,
        replay_limit: usize,
    ) -> Self {
        Self {
            registry,
            history,
            sequence: Mutex::new(1),
            replay_limit,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Id the next public message will receive
    pub async fn next_sequence_id(&self) -> u64 {
        *self.sequence.lock().await
    }

    /// Register a session and replay recent history to it
    ///
    /// Runs under the sequence section, so the session sees the replay
    /// followed by every later public message with nothing missed or repeated.
    pub async fn join(&self, username: &str) -> Result<SessionHandle, RegisterError> {
        let _sequence = self.sequence.lock().await;

        let handle = self.registry.register(username).await?;

        if let Some(history) = &self.history {
            match history.tail(self.replay_limit) {
                Ok(lines) => {
                    tracing::debug!("Replaying {} history lines to {}", lines.len(), username);
                    for line in lines {
                        Self::deliver(username, &handle.queue, format!("{}{}", HISTORY_PREFIX, line));
                    }
                }
                Err(e) => tracing::warn!("Failed to read history for {}: {:#}", username, e),
            }
        }

        Ok(handle)
    }

    /// Publish a public message, or a private one when `recipient` is set
    pub async fn publish(
        &self,
        sender: &str,
        body: &str,
        recipient: Option<&str>,
    ) -> Result<Delivery, PublishError> {
        match recipient {
            Some(recipient) => self.publish_private(sender, recipient, body).await,
            None => self.publish_public(sender, body).await,
        }
    }

    /// Publish a public message as the synthetic server sender
    pub async fn announce(&self, body: &str) -> Option<Delivery> {
        self.publish(SERVER_SENDER, body, None).await.ok()
    }

    async fn publish_public(&self, sender: &str, body: &str) -> Result<Delivery, PublishError> {
        let mut next_id = self.sequence.lock().await;

        if sender != SERVER_SENDER && !self.registry.contains(sender).await {
            tracing::warn!("Dropping message from unknown sender {}", sender);
            return Err(PublishError::UnknownSender(sender.to_string()));
        }

        let recipients = self.registry.connected_outbounds().await;

        let sequence_id = *next_id;
        *next_id += 1;

        let line = Message::public(sequence_id, sender, body).format();
        for (name, queue) in &recipients {
            Self::deliver(name, queue, line.clone());
        }

        if let Some(history) = &self.history {
            if let Err(e) = history.append(&line) {
                tracing::warn!("Message #{} not written to history: {:#}", sequence_id, e);
            }
        }

        tracing::debug!(
            "Message #{} from {} delivered to {} sessions",
            sequence_id,
            sender,
            recipients.len()
        );

        Ok(Delivery::Public {
            sequence_id,
            recipients: recipients.len(),
        })
    }

    async fn publish_private(
        &self,
        sender: &str,
        recipient: &str,
        body: &str,
    ) -> Result<Delivery, PublishError> {
        let sequence_id = self.next_sequence_id().await;

        let Some(sender_queue) = self.registry.outbound(sender).await else {
            tracing::warn!("Dropping private message from unknown sender {}", sender);
            return Err(PublishError::UnknownSender(sender.to_string()));
        };

        let Some(recipient_queue) = self.registry.outbound(recipient).await else {
            let err = PublishError::RecipientUnavailable(recipient.to_string());
            Self::deliver(sender, &sender_queue, error_line(&err));
            return Err(err);
        };

        let message = Message::private(sequence_id, sender, recipient, body);
        Self::deliver(recipient, &recipient_queue, message.format_for_recipient());
        Self::deliver(sender, &sender_queue, message.format_for_sender());

        Ok(Delivery::Private {
            sequence_id,
            recipient: recipient.to_string(),
        })
    }

    /// Send one line to one session's queue
    pub fn deliver(username: &str, queue: &OutboundQueue, line: String) {
        match queue.push(line) {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest => {
                tracing::warn!("Outbound queue for {} is full, dropped oldest line", username);
            }
            PushOutcome::Closed => {
                tracing::debug!("Outbound queue for {} already closed", username);
            }
        }
    }
}
