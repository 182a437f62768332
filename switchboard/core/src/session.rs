//! Session State
//!
//! One `Session` per active participant. It owns the pairing, the connection
//! state machine, the ordered message log and the last reported error.
//!
//! # Design Philosophy
//!
//! A session is plain data. The actor in [`crate::client`] is its only
//! writer, so nothing in here locks. Connection state changes only through
//! [`Session::apply`], which runs the pure transition function.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionMachine, ConnectionState, Effect, RetryPolicy,
};
use crate::messages::{ChatMessage, Role};
use crate::pairing::Pairing;

/// Unique identifier for one session instance in this process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered message log
///
/// Arrival order is insertion order. A history load replaces everything
/// that was in the log when its fetch was issued; live messages appended
/// after that point are kept behind the history, minus any the history
/// already contains.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
    // Append sequence of each entry; `None` for history
    seqs: Vec<Option<u64>>,
    appended: u64,
}

impl MessageLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a live message
    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.seqs.push(Some(self.appended));
        self.appended += 1;
    }

    /// Position to pass to [`MessageLog::load_history`] for a fetch issued now
    #[must_use]
    pub fn mark(&self) -> u64 {
        self.appended
    }

    /// Install a history load for a fetch issued at `since`
    pub fn load_history(&mut self, history: Vec<ChatMessage>, since: u64) {
        let kept: Vec<(ChatMessage, Option<u64>)> = self
            .messages
            .drain(..)
            .zip(self.seqs.drain(..))
            .filter(|(message, seq)| {
                seq.is_some_and(|n| n >= since)
                    && !message
                        .id
                        .is_some_and(|id| history.iter().any(|h| h.id == Some(id)))
            })
            .collect();

        self.seqs = vec![None; history.len()];
        self.messages = history;
        for (message, seq) in kept {
            self.messages.push(message);
            self.seqs.push(seq);
        }
    }

    /// All messages, oldest first
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// What the participant should be told about the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not connected
    Idle,
    /// Opening the channel
    Connecting,
    /// Connected, no counterpart yet
    Waiting,
    /// Connected and paired
    Ready,
    /// Waiting out a backoff delay
    Reconnecting {
        /// Consecutive failures so far
        attempt: u32,
        /// Ceiling
        max_attempts: u32,
    },
    /// Retries used up
    Exhausted {
        /// Consecutive failures
        attempts: u32,
    },
}

impl SessionStatus {
    /// Human-readable text for `role`
    #[must_use]
    pub fn describe(&self, role: Role) -> String {
        match self {
            Self::Idle => "Disconnected".to_string(),
            Self::Connecting => "Connecting...".to_string(),
            Self::Waiting => role.waiting_message().to_string(),
            Self::Ready => "Connected".to_string(),
            Self::Reconnecting {
                attempt,
                max_attempts,
            } => format!("Connection failed. Reconnecting (retry {attempt}/{max_attempts})..."),
            Self::Exhausted { attempts } => format!(
                "Connection failed after {attempts} attempts. Restart the session to try again."
            ),
        }
    }
}

/// Point-in-time copy of a session for callers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session instance ID
    pub session_id: SessionId,
    /// Local participant ID
    pub local_id: String,
    /// Local participant role
    pub role: Role,
    /// Current counterpart
    pub peer_id: Option<String>,
    /// Connection state
    pub connection: ConnectionState,
    /// Consecutive failed attempts
    pub retry_count: u32,
    /// Derived status
    pub status: SessionStatus,
    /// Human-readable status
    pub status_text: String,
    /// Last error, cleared on successful connect
    pub last_error: Option<String>,
    /// Message log, oldest first
    pub messages: Vec<ChatMessage>,
}

/// Change notifications broadcast to observers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A live message was appended
    MessageAppended(ChatMessage),
    /// A history load rebuilt the log; carries the whole log
    HistoryReplaced(Vec<ChatMessage>),
    /// The counterpart changed
    PeerChanged(Option<String>),
    /// The status changed
    StatusChanged {
        /// New status
        status: SessionStatus,
        /// Human-readable form
        text: String,
    },
    /// An error worth showing
    Error(String),
    /// The session was closed
    Closed,
}

/// One participant's session
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    pairing: Pairing,
    machine: ConnectionMachine,
    log: MessageLog,
    last_error: Option<String>,
}

impl Session {
    /// Create an idle session for a resolved pairing
    #[must_use]
    pub fn new(pairing: Pairing, policy: RetryPolicy) -> Self {
        Self {
            id: SessionId::new(),
            pairing,
            machine: ConnectionMachine::new(policy),
            log: MessageLog::new(),
            last_error: None,
        }
    }

    /// Session instance ID
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Local participant ID
    #[must_use]
    pub fn local_id(&self) -> &str {
        self.pairing.local_id()
    }

    /// Local participant role
    #[must_use]
    pub fn role(&self) -> Role {
        self.pairing.role()
    }

    /// Current counterpart
    #[must_use]
    pub fn peer_id(&self) -> Option<&str> {
        self.pairing.peer_id()
    }

    /// Pairing
    #[must_use]
    pub fn pairing(&self) -> &Pairing {
        &self.pairing
    }

    /// Mutable pairing
    pub fn pairing_mut(&mut self) -> &mut Pairing {
        &mut self.pairing
    }

    /// Swap in a freshly resolved pairing (restart)
    ///
    /// Only valid while idle; the log belongs to the old identity and is
    /// cleared.
    pub fn replace_pairing(&mut self, pairing: Pairing) {
        self.pairing = pairing;
        self.log = MessageLog::new();
    }

    /// Connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Consecutive failed attempts
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.machine.retry_count()
    }

    /// Retry policy
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        self.machine.policy()
    }

    /// Check if the channel is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.machine.is_connected()
    }

    /// Feed an event to the connection state machine
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` for rejected events; nothing changes.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<Vec<Effect>, ConnectionError> {
        self.machine.handle(event)
    }

    /// Description of the most recent failure signal
    #[must_use]
    pub fn last_failure_detail(&self) -> Option<String> {
        self.machine.last_failure().map(ToString::to_string)
    }

    /// Message log
    #[must_use]
    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Append a live message
    pub fn append_message(&mut self, message: ChatMessage) {
        self.log.append(message);
    }

    /// Install a history load fetched at log position `since`
    pub fn load_history(&mut self, history: Vec<ChatMessage>, since: u64) {
        self.log.load_history(history, since);
    }

    /// Last error
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record an error
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Forget the last error
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Derived status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self.machine.state() {
            ConnectionState::Idle => SessionStatus::Idle,
            ConnectionState::Connecting => SessionStatus::Connecting,
            ConnectionState::Connected if self.pairing.is_paired() => SessionStatus::Ready,
            ConnectionState::Connected => SessionStatus::Waiting,
            ConnectionState::RetryWait => SessionStatus::Reconnecting {
                attempt: self.machine.retry_count(),
                max_attempts: self.machine.policy().max_attempts,
            },
            ConnectionState::Exhausted => SessionStatus::Exhausted {
                attempts: self.machine.retry_count(),
            },
        }
    }

    /// Copy out the current state
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            session_id: self.id,
            local_id: self.local_id().to_string(),
            role: self.role(),
            peer_id: self.peer_id().map(str::to_string),
            connection: self.machine.state(),
            retry_count: self.machine.retry_count(),
            status_text: status.describe(self.role()),
            status,
            last_error: self.last_error.clone(),
            messages: self.log.messages().to_vec(),
        }
    }
}
