// Session registry: the authoritative username -> session mapping

use crate::chat::error::{RegisterError, StatusError};
use crate::chat::message::{Status, SERVER_SENDER};
use crate::chat::outbound::OutboundQueue;
use crate::chat::storage::{StatusSnapshot, StatusStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Per-session state of the synthetic typing announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingTimer {
    Idle,
    PendingAnnounce { due: Instant },
}

/// Returned to the connection that successfully registered a username
#[derive(Clone)]
pub struct SessionHandle {
    pub username: String,
    /// Identifies this attachment; stale connections cannot detach a newer one
    pub connection_id: Uuid,
    pub queue: Arc<OutboundQueue>,
    /// Status the session resumed with
    pub status: Status,
    /// True when an existing disconnected entry was reattached
    pub reattached: bool,
}

/// Read-only view of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub username: String,
    pub connected: bool,
    pub connection_id: Option<Uuid>,
    /// Status as last set
    pub status: Status,
    /// Status as shown to other users
    pub effective_status: Status,
    pub last_activity: Instant,
    pub typing: TypingTimer,
}

/// One line of a `/who` or `/users` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatus {
    pub username: String,
    pub status: Status,
}

struct SessionEntry {
    connection_id: Option<Uuid>,
    queue: Option<Arc<OutboundQueue>>,
    status: Status,
    last_activity: Instant,
    typing: TypingTimer,
}

impl SessionEntry {
    fn is_connected(&self) -> bool {
        self.connection_id.is_some()
    }

    fn is_attached(&self, connection_id: Uuid) -> bool {
        self.connection_id == Some(connection_id)
    }

    fn effective_status(&self, now: Instant, typing_window: Duration) -> Status {
        if !self.is_connected() {
            return Status::Disconnected;
        }
        if self.status == Status::Typing
            && now.saturating_duration_since(self.last_activity) > typing_window
        {
            return Status::Available;
        }
        self.status.clone()
    }
}

struct RegistryState {
    sessions: HashMap<String, SessionEntry>,
    /// Statuses loaded at boot, consumed on each username's first connect
    restored: HashMap<String, Status>,
    snapshot_version: u64,
}

impl RegistryState {
    fn snapshot(&mut self) -> StatusSnapshot {
        self.snapshot_version += 1;
        StatusSnapshot {
            version: self.snapshot_version,
            statuses: self
                .sessions
                .iter()
                .map(|(name, entry)| (name.clone(), entry.status.to_string()))
                .chain(
                    self.restored
                        .iter()
                        .map(|(name, status)| (name.clone(), status.to_string())),
                )
                .collect(),
        }
    }
}

/// Check a requested username before it reaches the registry
pub fn validate_username(username: &str) -> Result<(), RegisterError> {
    if username.is_empty() {
        return Err(RegisterError::EmptyUsername);
    }
    if username.chars().any(char::is_whitespace) {
        return Err(RegisterError::InvalidUsername);
    }
    if username.eq_ignore_ascii_case(SERVER_SENDER) {
        return Err(RegisterError::Reserved(username.to_string()));
    }
    Ok(())
}

/// Every session ever created, keyed by username
///
/// All operations run under one exclusive section. The status snapshot is
/// written after the section is released.
pub struct Registry {
    state: Mutex<RegistryState>,
    store: Option<Arc<StatusStore>>,
    outbound_capacity: usize,
    typing_window: Duration,
}

impl Registry {
    /// Create an in-memory registry without a status snapshot
    pub fn new(outbound_capacity: usize, typing_window: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                restored: HashMap::new(),
                snapshot_version: 0,
            }),
            store: None,
            outbound_capacity,
            typing_window,
        }
    }

    /// Create a registry seeded from the status snapshot
    ///
    /// An unreadable snapshot is logged and ignored.
    pub fn with_store(
        store: Arc<StatusStore>,
        outbound_capacity: usize,
        typing_window: Duration,
    ) -> Self {
        let restored = match store.load() {
            Ok(restored) => {
                tracing::info!(
                    "Restored {} user statuses from {:?}",
                    restored.len(),
                    store.path()
                );
                restored
            }
            Err(e) => {
                tracing::warn!("Ignoring status snapshot: {:#}", e);
                HashMap::new()
            }
        };

        Self {
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                restored,
                snapshot_version: 0,
            }),
            store: Some(store),
            outbound_capacity,
            typing_window,
        }
    }

    fn persist(&self, snapshot: StatusSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store.write(&snapshot) {
                tracing::warn!("Failed to write status snapshot: {:#}", e);
            }
        }
    }

    /// Attach a connection to `username`
    ///
    /// Fails without touching any state when the username is already online.
    /// A disconnected entry is reattached with a fresh outbound queue and its
    /// previous status.
    pub async fn register(&self, username: &str) -> Result<SessionHandle, RegisterError> {
        validate_username(username)?;

        let now = Instant::now();
        let connection_id = Uuid::new_v4();
        let queue = Arc::new(OutboundQueue::new(self.outbound_capacity));

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let (status, reattached) = match state.sessions.get_mut(username) {
            Some(entry) if entry.is_connected() => return Err(RegisterError::AlreadyOnline),
            Some(entry) => {
                entry.status = entry.status.resumable();
                entry.connection_id = Some(connection_id);
                entry.queue = Some(queue.clone());
                entry.last_activity = now;
                entry.typing = TypingTimer::Idle;
                (entry.status.clone(), true)
            }
            None => {
                let status = state.restored.remove(username).unwrap_or_default();
                state.sessions.insert(
                    username.to_string(),
                    SessionEntry {
                        connection_id: Some(connection_id),
                        queue: Some(queue.clone()),
                        status: status.clone(),
                        last_activity: now,
                        typing: TypingTimer::Idle,
                    },
                );
                (status, false)
            }
        };

        let snapshot = state.snapshot();
        drop(guard);
        self.persist(snapshot);

        tracing::info!(
            "{} {} ({})",
            username,
            if reattached { "reattached" } else { "registered" },
            status
        );

        Ok(SessionHandle {
            username: username.to_string(),
            connection_id,
            queue,
            status,
            reattached,
        })
    }

    /// Look up a session by username
    pub async fn lookup(&self, username: &str) -> Option<SessionInfo> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.sessions.get(username).map(|entry| SessionInfo {
            username: username.to_string(),
            connected: entry.is_connected(),
            connection_id: entry.connection_id,
            status: entry.status.clone(),
            effective_status: entry.effective_status(now, self.typing_window),
            last_activity: entry.last_activity,
            typing: entry.typing,
        })
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.state.lock().await.sessions.contains_key(username)
    }

    /// Outbound queue of a connected session
    pub async fn outbound(&self, username: &str) -> Option<Arc<OutboundQueue>> {
        let state = self.state.lock().await;
        state.sessions.get(username).and_then(|entry| entry.queue.clone())
    }

    /// Outbound queues of every connected session, ordered by username
    pub async fn connected_outbounds(&self) -> Vec<(String, Arc<OutboundQueue>)> {
        let state = self.state.lock().await;
        let mut outbounds: Vec<_> = state
            .sessions
            .iter()
            .filter_map(|(name, entry)| entry.queue.clone().map(|q| (name.clone(), q)))
            .collect();
        outbounds.sort_by(|a, b| a.0.cmp(&b.0));
        outbounds
    }

    /// Overwrite a user's status and persist the snapshot
    pub async fn set_status(&self, username: &str, status: Status) -> Result<(), StatusError> {
        if status.as_str().is_empty() {
            return Err(StatusError::EmptyStatus);
        }

        let mut state = self.state.lock().await;
        let entry = state
            .sessions
            .get_mut(username)
            .ok_or_else(|| StatusError::UnknownUser(username.to_string()))?;

        entry.status = status;
        entry.typing = TypingTimer::Idle;

        let snapshot = state.snapshot();
        drop(state);
        self.persist(snapshot);
        Ok(())
    }

    /// Record inbound activity on an attached connection
    pub async fn touch(&self, username: &str, connection_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sessions.get_mut(username) {
            if entry.is_attached(connection_id) {
                entry.last_activity = Instant::now();
            }
        }
    }

    /// Schedule a typing announcement `delay` from now
    ///
    /// Returns the deadline, or `None` if the connection is no longer attached.
    pub async fn arm_typing(
        &self,
        username: &str,
        connection_id: Uuid,
        delay: Duration,
    ) -> Option<Instant> {
        let mut state = self.state.lock().await;
        let entry = state.sessions.get_mut(username)?;
        if !entry.is_attached(connection_id) {
            return None;
        }

        let due = Instant::now() + delay;
        entry.typing = TypingTimer::PendingAnnounce { due };
        Some(due)
    }

    /// Fire a pending typing announcement
    ///
    /// The status becomes typing only if the timer is due, the last activity
    /// is still inside the typing window, and the user has not set a custom
    /// status. Returns whether the status changed.
    pub async fn announce_typing(&self, username: &str, connection_id: Uuid) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.sessions.get_mut(username) else {
            return false;
        };
        if !entry.is_attached(connection_id) {
            return false;
        }

        match entry.typing {
            TypingTimer::PendingAnnounce { due } if due <= now => {
                entry.typing = TypingTimer::Idle;
            }
            _ => return false,
        }

        let recent = now.saturating_duration_since(entry.last_activity) <= self.typing_window;
        let replaceable = matches!(entry.status, Status::Available | Status::Typing);
        if !recent || !replaceable {
            return false;
        }

        entry.status = Status::Typing;
        let snapshot = state.snapshot();
        drop(state);
        self.persist(snapshot);
        true
    }

    /// Connected users with their effective status
    ///
    /// Sorted by effective status, then username.
    pub async fn snapshot_online_users(&self) -> Vec<UserStatus> {
        self.collect_users(true).await
    }

    /// Every registered user, including disconnected ones
    pub async fn snapshot_users(&self) -> Vec<UserStatus> {
        self.collect_users(false).await
    }

    async fn collect_users(&self, online_only: bool) -> Vec<UserStatus> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let mut users: Vec<UserStatus> = state
            .sessions
            .iter()
            .filter(|(_, entry)| !online_only || entry.is_connected())
            .map(|(name, entry)| UserStatus {
                username: name.clone(),
                status: entry.effective_status(now, self.typing_window),
            })
            .collect();
        drop(state);

        users.sort_by(|a, b| {
            a.status
                .as_str()
                .cmp(b.status.as_str())
                .then_with(|| a.username.cmp(&b.username))
        });
        users
    }

    /// Detach a connection and close its outbound queue
    ///
    /// The entry is kept with its status. Returns false when `connection_id`
    /// is not the attached connection, so the caller must not announce a leave.
    pub async fn mark_disconnected(&self, username: &str, connection_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.sessions.get_mut(username) else {
            return false;
        };
        if !entry.is_attached(connection_id) {
            return false;
        }

        entry.connection_id = None;
        entry.typing = TypingTimer::Idle;
        if let Some(queue) = entry.queue.take() {
            queue.close();
        }

        let snapshot = state.snapshot();
        drop(state);
        self.persist(snapshot);

        tracing::info!("{} marked disconnected", username);
        true
    }

    /// Number of entries, connected or not
    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
