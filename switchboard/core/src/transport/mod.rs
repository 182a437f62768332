//! Transport Layer for Session Channels
//!
//! Provides abstraction over the duplex channel a session talks through:
//! - `InMemory`: Channel-backed broker (embedded use and tests)
//! - `WebSocket`: STOMP 1.2 over a WebSocket to the chat backend
//!
//! # Design Philosophy
//!
//! The session actor only ever sees [`ChannelTransport`] and the
//! [`TransportEvent`]s it reports. Frames and failure signals arrive on one
//! ordered channel per open, so a teardown is just dropping the receiver.

pub mod in_memory;
pub mod stomp;
pub mod traits;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-exports for convenience
pub use in_memory::{InMemoryHandle, InMemoryTransport};
pub use stomp::{StompCommand, StompDecoder, StompFrame};
pub use traits::{
    ChannelTransport, FailureKind, FailureSignal, InboundFrame, SubscriptionId, TransportError,
    TransportEvent,
};

#[cfg(feature = "websocket")]
pub use websocket::{StompWebSocketTransport, WebSocketSettings};
