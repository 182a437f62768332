//! Transport Traits
//!
//! The contract every duplex channel implementation fulfils for a session.
//!
//! A transport is opened with an event sender. Everything the channel
//! produces afterwards (inbound frames and the three failure signals) is
//! delivered through that sender in arrival order. Dropping the receiving
//! side is how a session stops listening to a torn-down channel.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of one subscription on one open channel
///
/// Subscriptions do not survive a teardown; IDs are only meaningful for the
/// channel that issued them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the channel failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The channel was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation requires an open channel
    #[error("Not connected")]
    NotConnected,

    /// Failed to hand a frame to the channel
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The peer violated the framing protocol or reported an error frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The peer did not answer in time
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// IO error from the underlying socket
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Which of the channel's failure signals fired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The messaging protocol reported an error (e.g. a STOMP `ERROR` frame)
    Protocol,
    /// The underlying socket failed
    Transport,
    /// The channel closed without being asked to
    Closed,
    /// The channel could not be opened at all
    OpenFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => write!(f, "protocol error"),
            Self::Transport => write!(f, "transport error"),
            Self::Closed => write!(f, "connection closed"),
            Self::OpenFailed => write!(f, "open failed"),
        }
    }
}

/// A failure signal with enough detail to log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureSignal {
    /// Kind of failure
    pub kind: FailureKind,
    /// Human-readable detail
    pub detail: String,
}

impl FailureSignal {
    /// Create a new failure signal
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// A frame delivered on a subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    /// Subscription the frame arrived on
    pub subscription: SubscriptionId,
    /// Topic the frame was published to
    pub topic: String,
    /// Raw frame body
    pub body: String,
}

/// Everything an open channel reports back to its owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound frame
    Frame(InboundFrame),
    /// The channel failed; no further events follow
    Failure(FailureSignal),
}

/// A duplex, message-framed channel
///
/// Implementations report inbound frames and failures through the sender
/// passed to [`ChannelTransport::open`].
#[async_trait]
pub trait ChannelTransport: Send {
    /// Open the channel
    ///
    /// Returns once the channel is usable. Events for this channel go to
    /// `events` until [`ChannelTransport::close`] is called.
    async fn open(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError>;

    /// Subscribe to a topic
    ///
    /// Returns `TransportError::NotConnected` (and does nothing) while the
    /// channel is not open.
    async fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId, TransportError>;

    /// Publish a payload to a topic
    async fn publish(&mut self, topic: &str, payload: String) -> Result<(), TransportError>;

    /// Release all subscriptions and the underlying channel
    ///
    /// Idempotent; closing a closed transport is a no-op.
    async fn close(&mut self);

    /// Check if the channel is currently open
    fn is_connected(&self) -> bool;
}
