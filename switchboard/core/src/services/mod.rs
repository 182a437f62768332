//! External Collaborators
//!
//! Request/response services a session depends on but does not own:
//! identity issuance, counterpart assignment and message history. Each is a
//! trait so the session can run against the HTTP backend ([`http`]) or an
//! in-process stand-in ([`fixed`]).
//!
//! No retry is applied to these calls here; a failed call is reported once
//! and the caller decides what to do.

pub mod fixed;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::{ChatMessage, Role};

pub use fixed::FixedServices;
pub use http::HttpServices;

/// Identity handed out by the identity service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityGrant {
    /// Stable identifier for the local participant
    pub local_id: String,
    /// Counterpart assigned at issuance, if any
    pub peer_id: Option<String>,
}

/// Collaborator call failures
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The service answered but has no counterpart to offer yet
    #[error("Unavailable: {detail}")]
    Unavailable {
        /// Identifier issued despite the missing counterpart, if the service sent one
        local_id: Option<String>,
        /// Service-provided explanation
        detail: String,
    },

    /// Credentials missing or rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The request could not be completed
    #[error("Request failed: {0}")]
    Request(String),

    /// The response body was not understood
    #[error("Invalid response: {0}")]
    Decode(String),
}

/// Issues participant identities
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Create (or log in) an identity for `role`
    async fn create_identity(&self, role: Role) -> Result<IdentityGrant, ServiceError>;
}

/// Tracks which requester is paired with which responder
#[async_trait]
pub trait AssignmentService: Send + Sync {
    /// Current counterpart of `local_id`, `None` if unpaired
    async fn get_assignment(&self, local_id: &str) -> Result<Option<String>, ServiceError>;

    /// Release `local_id`'s pairing on logout
    async fn release_assignment(&self, local_id: &str, role: Role) -> Result<(), ServiceError>;
}

/// Stored conversation history
#[async_trait]
pub trait HistoryService: Send + Sync {
    /// All stored messages involving `local_id`, oldest first
    async fn get_history(&self, local_id: &str) -> Result<Vec<ChatMessage>, ServiceError>;
}

/// The three collaborators a session talks to
#[derive(Clone)]
pub struct Services {
    /// Identity issuance
    pub identity: Arc<dyn IdentityService>,
    /// Assignment lookup and release
    pub assignment: Arc<dyn AssignmentService>,
    /// History retrieval
    pub history: Arc<dyn HistoryService>,
}

impl Services {
    /// Use one backend for all three collaborators
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: IdentityService + AssignmentService + HistoryService + 'static,
    {
        Self {
            identity: Arc::clone(&backend) as Arc<dyn IdentityService>,
            assignment: Arc::clone(&backend) as Arc<dyn AssignmentService>,
            history: backend,
        }
    }
}
