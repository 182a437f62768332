//! Fixed Collaborators
//!
//! In-process stand-in for the identity, assignment and history services.
//! Answers come from values set up front (and adjustable later); every call
//! is recorded so callers can check what a session asked for.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{AssignmentService, HistoryService, IdentityGrant, IdentityService, ServiceError};
use crate::messages::{ChatMessage, Role};

struct FixedState {
    identity: Result<IdentityGrant, ServiceError>,
    assignment: Result<Option<String>, ServiceError>,
    history: Result<Vec<ChatMessage>, ServiceError>,
    history_gate: Option<Arc<Notify>>,
    identity_requests: Vec<Role>,
    history_requests: Vec<String>,
    releases: Vec<(String, Role)>,
}

/// Collaborators with scripted answers
pub struct FixedServices {
    state: Mutex<FixedState>,
}

impl FixedServices {
    /// Answer identity requests with `identity`
    pub fn new(identity: Result<IdentityGrant, ServiceError>) -> Self {
        Self {
            state: Mutex::new(FixedState {
                identity,
                assignment: Ok(None),
                history: Ok(Vec::new()),
                history_gate: None,
                identity_requests: Vec::new(),
                history_requests: Vec::new(),
                releases: Vec::new(),
            }),
        }
    }

    /// Issue `local_id`, paired with `peer_id` if given
    pub fn granting(local_id: &str, peer_id: Option<&str>) -> Self {
        Self::new(Ok(IdentityGrant {
            local_id: local_id.to_string(),
            peer_id: peer_id.map(str::to_string),
        }))
    }

    /// Set the assignment lookup answer
    #[must_use]
    pub fn with_assignment(self, result: Result<Option<String>, ServiceError>) -> Self {
        self.state.lock().assignment = result;
        self
    }

    /// Set the stored history
    #[must_use]
    pub fn with_history(self, messages: Vec<ChatMessage>) -> Self {
        self.set_history(Ok(messages));
        self
    }

    /// Replace the history answer
    pub fn set_history(&self, result: Result<Vec<ChatMessage>, ServiceError>) {
        self.state.lock().history = result;
    }

    /// Replace the identity answer
    pub fn set_identity(&self, result: Result<IdentityGrant, ServiceError>) {
        self.state.lock().identity = result;
    }

    /// Hold history answers until the returned gate is notified
    ///
    /// Each `notify_one` releases one pending (or the next) request.
    pub fn gate_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().history_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Roles identity was requested for, in order
    pub fn identity_requests(&self) -> Vec<Role> {
        self.state.lock().identity_requests.clone()
    }

    /// Local IDs history was requested for, in order
    pub fn history_requests(&self) -> Vec<String> {
        self.state.lock().history_requests.clone()
    }

    /// Releases received, in order
    pub fn releases(&self) -> Vec<(String, Role)> {
        self.state.lock().releases.clone()
    }
}

#[async_trait]
impl IdentityService for FixedServices {
    async fn create_identity(&self, role: Role) -> Result<IdentityGrant, ServiceError> {
        let mut state = self.state.lock();
        state.identity_requests.push(role);
        state.identity.clone()
    }
}

#[async_trait]
impl AssignmentService for FixedServices {
    async fn get_assignment(&self, _local_id: &str) -> Result<Option<String>, ServiceError> {
        self.state.lock().assignment.clone()
    }

    async fn release_assignment(&self, local_id: &str, role: Role) -> Result<(), ServiceError> {
        self.state.lock().releases.push((local_id.to_string(), role));
        Ok(())
    }
}

#[async_trait]
impl HistoryService for FixedServices {
    async fn get_history(&self, local_id: &str) -> Result<Vec<ChatMessage>, ServiceError> {
        let gate = {
            let mut state = self.state.lock();
            state.history_requests.push(local_id.to_string());
            state.history_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state.lock().history.clone()
    }
}
