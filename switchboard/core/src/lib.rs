//! Switchboard Core - Realtime Pairing and Connection Sessions
//!
//! This crate keeps a 1:1 conversation between an anonymous requester and a
//! designated responder alive over a duplex channel. It resolves who the
//! participants are, opens the channel, retries with bounded backoff when it
//! drops, orders inbound messages and gates outbound ones.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SessionHandle                          │
//! │          send / snapshot / subscribe / restart / close        │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ commands
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                  Session actor (one task)                     │
//! │  ┌──────────┐  ┌────────────┐  ┌──────────┐  ┌────────────┐  │
//! │  │ Pairing  │  │ Connection │  │ Consumer │  │ Dispatcher │  │
//! │  │ Resolver │  │  Machine   │  │          │  │            │  │
//! │  └────┬─────┘  └─────┬──────┘  └────┬─────┘  └─────┬──────┘  │
//! └───────┼──────────────┼──────────────┼──────────────┼─────────┘
//!         │              │              │              │
//!   identity /     ChannelTransport (STOMP over WebSocket,
//!   assignment /         or in-memory)
//!   history services
//! ```
//!
//! # Key Types
//!
//! - [`SessionHandle`]: Start and drive one participant's session
//! - [`Session`]: Pairing, connection state and message log
//! - [`ConnectionMachine`]: Pure connect/retry state machine
//! - [`ChannelTransport`]: Duplex channel abstraction
//! - [`ChatError`]: Errors surfaced to callers
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{
//!     config::load_config, HttpServices, Role, Services, SessionHandle,
//!     StompWebSocketTransport,
//! };
//!
//! let config = load_config()?;
//! let backend = Arc::new(HttpServices::new(&config.base_url, config.credentials())?);
//! let transport = StompWebSocketTransport::new(config.websocket_settings());
//!
//! let session = SessionHandle::start(
//!     Role::Requester,
//!     Services::from_backend(backend),
//!     transport,
//!     config.session_config(),
//! )
//! .await?;
//!
//! let mut updates = session.subscribe();
//! session.send("Hello!").await?;
//! session.close().await?;
//! ```
//!
//! # Module Overview
//!
//! - [`messages`]: Wire types and topic naming
//! - [`pairing`]: Identity and counterpart resolution
//! - [`services`]: Identity, assignment and history collaborators
//! - [`transport`]: Channel abstraction, STOMP codec, transports
//! - [`connection`]: Connect/retry state machine
//! - [`consumer`]: Inbound frame handling
//! - [`dispatcher`]: Outbound message validation and publishing
//! - [`session`]: Session state, message log, status
//! - [`client`]: Session actor and handle
//! - [`config`]: Layered configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod messages;
pub mod pairing;
pub mod services;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use client::{SessionConfig, SessionHandle};
pub use config::{ClientConfig, ConfigError, ConfigSource};
pub use connection::{
    transition, ConnectionError, ConnectionEvent, ConnectionMachine, ConnectionState, Effect,
    RetryPolicy, Transition,
};
pub use error::ChatError;
pub use messages::{AssignmentNotice, ChatMessage, Role, Topics};
pub use pairing::{Pairing, PairingResolver, PairingStatus, Resolution};
pub use services::{
    AssignmentService, FixedServices, HistoryService, HttpServices, IdentityGrant,
    IdentityService, ServiceError, Services,
};
pub use session::{MessageLog, Session, SessionId, SessionSnapshot, SessionStatus, SessionUpdate};
pub use transport::{
    ChannelTransport, FailureKind, FailureSignal, InMemoryHandle, InMemoryTransport,
    TransportError, TransportEvent,
};

#[cfg(feature = "websocket")]
pub use transport::{StompWebSocketTransport, WebSocketSettings};
