//! Connection Manager State Machine
//!
//! Drives the connect/retry lifecycle of one session's channel.
//!
//! # Architecture: Effect-Based State Machine
//!
//! - [`transition`] is pure: `(state, retry_count, event) -> (state, retry_count, effects)`
//! - The session actor executes the returned [`Effect`]s (open the transport,
//!   install subscriptions, arm the retry timer, ...)
//! - Nothing here touches a socket or a clock
//!
//! # State Machine
//!
//! ```text
//!            Start            Opened
//! ┌──────┐ ───────> ┌────────────┐ ───────> ┌───────────┐
//! │ Idle │          │ Connecting │          │ Connected │
//! └──────┘          └────────────┘          └───────────┘
//!    ↑                │    ↑                      │
//!    │         Failed │    │ RetryElapsed         │ Failed
//!    │                ↓    │                      │
//!    │             ┌───────────┐ <────────────────┘
//!    │             │ RetryWait │
//!    │             └───────────┘
//!    │  Reset      ┌───────────┐
//!    └──────────── │ Exhausted │ <── Failed with retry_count >= max_attempts
//!                  └───────────┘
//! ```
//!
//! `Close` moves any state to `Idle`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::transport::FailureSignal;

/// Default base delay between reconnect attempts
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(3);

/// Default number of consecutive failures before giving up
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Idle,
    /// Opening the transport
    Connecting,
    /// Channel open and subscriptions installed
    Connected,
    /// Waiting out the backoff delay before the next attempt
    RetryWait,
    /// Retry ceiling reached; needs an external restart
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::RetryWait => write!(f, "retry-wait"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Linear backoff with a retry ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit; the n-th consecutive failure waits `n * base_delay`
    pub base_delay: Duration,
    /// Consecutive failures that move the machine to `Exhausted`
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `retry_count` failures
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay.saturating_mul(retry_count)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Begin connecting as `local_id`
    Start {
        /// Identifier the channel is keyed by
        local_id: String,
    },
    /// The transport opened
    Opened,
    /// Open failed, or an open channel reported a failure signal
    Failed(FailureSignal),
    /// The backoff timer fired
    RetryElapsed,
    /// Explicit close/logout
    Close,
    /// External restart out of `Exhausted`
    Reset,
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Opened => "opened",
            Self::Failed(_) => "failed",
            Self::RetryElapsed => "retry-elapsed",
            Self::Close => "close",
            Self::Reset => "reset",
        }
    }
}

/// Work the driver performs after a transition, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open the transport
    OpenTransport,
    /// Subscribe to the participant's message and assignment queues
    InstallSubscriptions,
    /// Arm the retry timer
    ScheduleRetry {
        /// Consecutive failures so far
        attempt: u32,
        /// How long to wait before reconnecting
        delay: Duration,
    },
    /// Disarm a pending retry timer
    CancelRetry,
    /// Close the transport and drop its event stream
    TeardownTransport,
    /// Surface the terminal error
    ReportExhausted {
        /// Consecutive failures that hit the ceiling
        attempts: u32,
    },
    /// Forget the last reported error
    ClearError,
}

/// Result of a successful transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the event
    pub state: ConnectionState,
    /// Retry counter after the event
    pub retry_count: u32,
    /// Effects to execute
    pub effects: Vec<Effect>,
}

/// Rejected transitions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// `Start` with an empty local ID
    #[error("Cannot connect without a local identifier")]
    MissingIdentity,

    /// Event not valid in the current state (usually a stale signal)
    #[error("Event '{event}' is not valid in state {state}")]
    InvalidState {
        /// State the machine was in
        state: ConnectionState,
        /// Event that was rejected
        event: &'static str,
    },
}

/// Compute the next state
///
/// # Errors
///
/// Returns `ConnectionError` if the event does not apply to `state`. The
/// caller's state is unchanged in that case.
pub fn transition(
    state: ConnectionState,
    retry_count: u32,
    event: &ConnectionEvent,
    policy: &RetryPolicy,
) -> Result<Transition, ConnectionError> {
    use ConnectionState as S;

    let next = match (state, event) {
        (_, ConnectionEvent::Close) => {
            let mut effects = Vec::with_capacity(2);
            if state == S::RetryWait {
                effects.push(Effect::CancelRetry);
            }
            if state != S::Idle {
                effects.push(Effect::TeardownTransport);
            }
            Transition {
                state: S::Idle,
                retry_count: 0,
                effects,
            }
        }

        (S::Idle, ConnectionEvent::Start { local_id }) => {
            if local_id.trim().is_empty() {
                return Err(ConnectionError::MissingIdentity);
            }
            Transition {
                state: S::Connecting,
                retry_count,
                effects: vec![Effect::OpenTransport],
            }
        }

        (S::Connecting, ConnectionEvent::Opened) => Transition {
            state: S::Connected,
            retry_count: 0,
            effects: vec![Effect::ClearError, Effect::InstallSubscriptions],
        },

        (S::Connecting | S::Connected, ConnectionEvent::Failed(_)) => {
            let attempt = retry_count.saturating_add(1);
            if attempt >= policy.max_attempts {
                Transition {
                    state: S::Exhausted,
                    retry_count: attempt,
                    effects: vec![
                        Effect::TeardownTransport,
                        Effect::ReportExhausted { attempts: attempt },
                    ],
                }
            } else {
                Transition {
                    state: S::RetryWait,
                    retry_count: attempt,
                    effects: vec![
                        Effect::TeardownTransport,
                        Effect::ScheduleRetry {
                            attempt,
                            delay: policy.delay_for(attempt),
                        },
                    ],
                }
            }
        }

        (S::RetryWait, ConnectionEvent::RetryElapsed) => Transition {
            state: S::Connecting,
            retry_count,
            effects: vec![Effect::OpenTransport],
        },

        (S::Exhausted, ConnectionEvent::Reset) => Transition {
            state: S::Idle,
            retry_count: 0,
            effects: Vec::new(),
        },

        (state, event) => {
            return Err(ConnectionError::InvalidState {
                state,
                event: event.name(),
            })
        }
    };

    Ok(next)
}

/// Connection Manager state owned by one session
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    retry_count: u32,
    policy: RetryPolicy,
    last_failure: Option<FailureSignal>,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ConnectionMachine {
    /// Create an idle machine
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            policy,
            last_failure: None,
        }
    }

    /// Apply an event and return the effects to execute
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` when the event is rejected; the machine is
    /// left untouched.
    pub fn handle(&mut self, event: ConnectionEvent) -> Result<Vec<Effect>, ConnectionError> {
        let next = transition(self.state, self.retry_count, &event, &self.policy)?;

        if next.state != self.state {
            tracing::debug!(
                from = %self.state,
                to = %next.state,
                event = event.name(),
                retry_count = next.retry_count,
                "Connection state transition"
            );
        }

        match event {
            ConnectionEvent::Failed(signal) => self.last_failure = Some(signal),
            ConnectionEvent::Opened | ConnectionEvent::Close | ConnectionEvent::Reset => {
                self.last_failure = None;
            }
            _ => {}
        }

        self.state = next.state;
        self.retry_count = next.retry_count;
        Ok(next.effects)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful open
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Retry policy in force
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Most recent failure signal, cleared on success or close
    #[must_use]
    pub fn last_failure(&self) -> Option<&FailureSignal> {
        self.last_failure.as_ref()
    }

    /// Check if the channel is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}
