//! Message Stream Consumer
//!
//! Turns inbound frames into session changes. Two standing subscriptions
//! feed it:
//!
//! - the private message queue: decode, append, and let a waiting responder
//!   adopt the first foreign sender as its counterpart
//! - the private assignment queue: decode and update the counterpart
//!
//! Undecodable frames are logged and dropped.

use crate::messages::{AssignmentNotice, ChatMessage, Role, Topics};
use crate::pairing::PairingStatus;
use crate::session::Session;
use crate::transport::SubscriptionId;

/// Which standing subscription a frame arrived on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// Private message queue
    Messages,
    /// Private assignment-notification queue
    Assignment,
}

/// The standing subscriptions for one session, in install order
#[must_use]
pub fn standing_topics(local_id: &str) -> [(StreamKind, String); 2] {
    let topics = Topics::for_participant(local_id);
    [
        (StreamKind::Messages, topics.messages),
        (StreamKind::Assignment, topics.assignment),
    ]
}

/// Subscription IDs issued on the current channel
///
/// Cleared on every teardown; subscriptions never outlive their channel.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: Vec<(SubscriptionId, StreamKind)>,
}

impl SubscriptionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription
    pub fn insert(&mut self, id: SubscriptionId, kind: StreamKind) {
        self.entries.push((id, kind));
    }

    /// Stream a subscription feeds
    #[must_use]
    pub fn kind_of(&self, id: &SubscriptionId) -> Option<StreamKind> {
        self.entries
            .iter()
            .find(|(sub, _)| sub == id)
            .map(|(_, kind)| *kind)
    }

    /// Forget all subscriptions
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What consuming a frame did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Consumed {
    /// A message was appended
    Appended {
        /// The appended message
        message: ChatMessage,
        /// Counterpart adopted from the sender, if this message paired us
        discovered_peer: Option<String>,
    },
    /// A counterpart was assigned; the log should be reloaded for it
    Assigned {
        /// New counterpart
        peer_id: String,
    },
    /// The counterpart was released
    Unassigned {
        /// Waiting text for the local role
        status_text: &'static str,
    },
    /// The frame could not be decoded
    Dropped,
}

/// Consume one frame from `kind`
pub fn consume(session: &mut Session, kind: StreamKind, body: &str) -> Consumed {
    match kind {
        StreamKind::Messages => consume_message(session, body),
        StreamKind::Assignment => consume_assignment(session, body),
    }
}

/// Consume a message-queue frame
pub fn consume_message(session: &mut Session, body: &str) -> Consumed {
    let message = match ChatMessage::decode(body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(local_id = %session.local_id(), error = %e, "Dropping undecodable message frame");
            return Consumed::Dropped;
        }
    };

    let mut discovered_peer = None;
    if session.role() == Role::Responder
        && session.peer_id().is_none()
        && message.sender != session.local_id()
    {
        tracing::info!(
            local_id = %session.local_id(),
            peer_id = %message.sender,
            "Counterpart discovered from first inbound message"
        );
        session.pairing_mut().update_peer(Some(message.sender.clone()));
        discovered_peer = Some(message.sender.clone());
    }

    session.append_message(message.clone());
    Consumed::Appended {
        message,
        discovered_peer,
    }
}

/// Consume an assignment-queue frame
pub fn consume_assignment(session: &mut Session, body: &str) -> Consumed {
    let notice = match AssignmentNotice::decode(body) {
        Ok(notice) => notice,
        Err(e) => {
            tracing::warn!(local_id = %session.local_id(), error = %e, "Dropping undecodable assignment frame");
            return Consumed::Dropped;
        }
    };

    match session.pairing_mut().update_peer(notice.peer_id) {
        PairingStatus::Paired(peer_id) => Consumed::Assigned { peer_id },
        PairingStatus::Waiting => Consumed::Unassigned {
            status_text: session.role().waiting_message(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RetryPolicy;
    use crate::pairing::Pairing;
    use pretty_assertions::assert_eq;

    fn session(local_id: &str, role: Role, peer: Option<&str>) -> Session {
        Session::new(
            Pairing::new(local_id, role, peer.map(str::to_string)),
            RetryPolicy::default(),
        )
    }

    fn frame(sender: &str, recipient: &str, content: &str, role: &str) -> String {
        format!(
            r#"{{"sender":"{sender}","recipient":"{recipient}","content":"{content}","senderType":"{role}","timestamp":"2024-05-01T10:00:00Z"}}"#
        )
    }

    #[test]
    fn test_standing_topics() {
        let topics = standing_topics("guest-1");
        assert_eq!(topics[0], (StreamKind::Messages, "/user/guest-1/queue/messages".to_string()));
        assert_eq!(
            topics[1],
            (StreamKind::Assignment, "/user/guest-1/queue/assignment".to_string())
        );
    }

    #[test]
    fn test_subscription_table() {
        let mut table = SubscriptionTable::new();
        table.insert(SubscriptionId("sub-0".into()), StreamKind::Messages);
        table.insert(SubscriptionId("sub-1".into()), StreamKind::Assignment);

        assert_eq!(
            table.kind_of(&SubscriptionId("sub-1".into())),
            Some(StreamKind::Assignment)
        );
        assert_eq!(table.kind_of(&SubscriptionId("sub-9".into())), None);

        table.clear();
        assert_eq!(table.kind_of(&SubscriptionId("sub-0".into())), None);
    }

    #[test]
    fn test_waiting_responder_adopts_first_sender() {
        let mut session = session("agent1", Role::Responder, None);
        let consumed = consume_message(&mut session, &frame("guest-42", "agent1", "help", "GUEST"));

        match consumed {
            Consumed::Appended {
                discovered_peer, ..
            } => assert_eq!(discovered_peer.as_deref(), Some("guest-42")),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(session.peer_id(), Some("guest-42"));
        assert_eq!(session.log().len(), 1);
    }

    #[test]
    fn test_own_echo_does_not_pair_responder() {
        let mut session = session("agent1", Role::Responder, None);
        consume_message(&mut session, &frame("agent1", "", "anyone?", "SUPPORT_AGENT"));
        assert_eq!(session.peer_id(), None);
        assert_eq!(session.log().len(), 1);
    }

    #[test]
    fn test_paired_responder_keeps_peer() {
        let mut session = session("agent1", Role::Responder, Some("guest-1"));
        consume_message(&mut session, &frame("guest-2", "agent1", "hi", "GUEST"));
        assert_eq!(session.peer_id(), Some("guest-1"));
    }

    #[test]
    fn test_requester_never_infers_peer() {
        let mut session = session("guest-1", Role::Requester, None);
        consume_message(&mut session, &frame("agent1", "guest-1", "hi", "SUPPORT_AGENT"));
        assert_eq!(session.peer_id(), None);
    }

    #[test]
    fn test_bad_frames_are_dropped() {
        let mut session = session("agent1", Role::Responder, None);
        assert_eq!(consume_message(&mut session, "not json"), Consumed::Dropped);
        assert_eq!(consume_assignment(&mut session, "[1,2]"), Consumed::Dropped);
        assert!(session.log().is_empty());
        assert_eq!(session.peer_id(), None);
    }

    #[test]
    fn test_assignment_updates_pairing() {
        let mut session = session("guest-1", Role::Requester, None);

        let consumed = consume(&mut session, StreamKind::Assignment, r#"{"agentId":"agent1"}"#);
        assert_eq!(
            consumed,
            Consumed::Assigned {
                peer_id: "agent1".to_string()
            }
        );
        assert_eq!(session.peer_id(), Some("agent1"));

        let consumed = consume(&mut session, StreamKind::Assignment, r#"{"agentId":""}"#);
        assert_eq!(
            consumed,
            Consumed::Unassigned {
                status_text: "No agents available. Waiting for an agent..."
            }
        );
        assert_eq!(session.peer_id(), None);
    }
}
