//! Pairing Resolver
//!
//! Works out who the local participant is and who they are talking to.
//!
//! Resolution runs once per session start (and again on restart). After
//! that, the counterpart only changes through [`Pairing::update_peer`], fed
//! by assignment notifications or by the first inbound message a waiting
//! responder receives.

use std::sync::Arc;

use crate::error::ChatError;
use crate::messages::Role;
use crate::services::{AssignmentService, IdentityService, ServiceError};

/// Whether a counterpart is assigned
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingStatus {
    /// No counterpart yet
    Waiting,
    /// Paired with the given participant
    Paired(String),
}

/// Local identity plus current counterpart
///
/// Holds at most one peer at a time; a new assignment replaces the old one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pairing {
    local_id: String,
    role: Role,
    peer_id: Option<String>,
}

impl Pairing {
    /// Create a pairing
    pub fn new(local_id: impl Into<String>, role: Role, peer_id: Option<String>) -> Self {
        Self {
            local_id: local_id.into(),
            role,
            peer_id: peer_id.filter(|p| !p.trim().is_empty()),
        }
    }

    /// Local participant ID
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Local participant role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current counterpart
    #[must_use]
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Check if a counterpart is assigned
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.peer_id.is_some()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> PairingStatus {
        match self.peer_id {
            Some(ref peer) => PairingStatus::Paired(peer.clone()),
            None => PairingStatus::Waiting,
        }
    }

    /// Replace the counterpart
    ///
    /// An empty ID counts as absent.
    pub fn update_peer(&mut self, peer_id: Option<String>) -> PairingStatus {
        let peer_id = peer_id.filter(|p| !p.trim().is_empty());
        if peer_id != self.peer_id {
            tracing::info!(
                local_id = %self.local_id,
                previous = ?self.peer_id,
                peer_id = ?peer_id,
                "Counterpart changed"
            );
        }
        self.peer_id = peer_id;
        self.status()
    }
}

/// Outcome of a resolution
#[derive(Debug)]
pub struct Resolution {
    /// Resolved pairing (possibly without a counterpart)
    pub pairing: Pairing,
    /// Non-fatal assignment failure encountered while resolving
    pub assignment_error: Option<ChatError>,
}

/// Resolves identity and counterpart through the external services
#[derive(Clone)]
pub struct PairingResolver {
    identity: Arc<dyn IdentityService>,
    assignment: Arc<dyn AssignmentService>,
}

impl PairingResolver {
    /// Create a resolver
    pub fn new(identity: Arc<dyn IdentityService>, assignment: Arc<dyn AssignmentService>) -> Self {
        Self {
            identity,
            assignment,
        }
    }

    /// Resolve the local ID and current counterpart for `role`
    ///
    /// A missing counterpart is a valid waiting state, not an error.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Identity` if the identity service fails or issues
    /// no identifier.
    pub async fn resolve(&self, role: Role) -> Result<Resolution, ChatError> {
        let grant = match self.identity.create_identity(role).await {
            Ok(grant) => grant,
            Err(ServiceError::Unavailable {
                local_id: Some(local_id),
                detail,
            }) => {
                tracing::info!(local_id = %local_id, %detail, "Identity issued without counterpart");
                crate::services::IdentityGrant {
                    local_id,
                    peer_id: None,
                }
            }
            Err(e) => {
                tracing::warn!(%role, error = %e, "Identity resolution failed");
                return Err(ChatError::identity(&e));
            }
        };

        if grant.local_id.trim().is_empty() {
            return Err(ChatError::Identity(
                "identity service issued an empty identifier".to_string(),
            ));
        }

        let mut assignment_error = None;
        let peer_id = match role {
            Role::Requester => grant.peer_id,
            Role::Responder => match self.assignment.get_assignment(&grant.local_id).await {
                Ok(peer) => peer.or(grant.peer_id),
                Err(e) => {
                    tracing::warn!(local_id = %grant.local_id, error = %e, "Assignment lookup failed");
                    assignment_error = Some(ChatError::Assignment(e.to_string()));
                    grant.peer_id
                }
            },
        };

        let pairing = Pairing::new(grant.local_id, role, peer_id);
        tracing::info!(
            local_id = %pairing.local_id(),
            %role,
            peer_id = ?pairing.peer_id(),
            "Pairing resolved"
        );

        Ok(Resolution {
            pairing,
            assignment_error,
        })
    }

    /// Release `pairing` with the assignment service
    ///
    /// # Errors
    ///
    /// Returns the service failure; callers log it and move on.
    pub async fn release(&self, pairing: &Pairing) -> Result<(), ServiceError> {
        self.assignment
            .release_assignment(pairing.local_id(), pairing.role())
            .await
    }
}
