//! Wire Messages
//!
//! Types that travel over the duplex channel between a session and the chat
//! backend, plus the topic naming scheme both sides agree on.
//!
//! # Compatibility
//!
//! The backend speaks the field names of its own DTOs, so messages go out
//! with `senderType` and role values `GUEST` / `SUPPORT_AGENT`. Decoding is
//! lenient and also accepts `senderRole` and `REQUESTER` / `RESPONDER`.
//! Assignment notifications carry `agentId`; an empty string means "no
//! counterpart".

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Destination every outbound message is published to
pub const DEFAULT_SEND_DESTINATION: &str = "/app/chat";

/// Which side of the conversation a participant is on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Anonymous visitor asking for help
    #[serde(rename = "GUEST", alias = "REQUESTER", alias = "CUSTOMER")]
    Requester,
    /// Designated agent answering requesters
    #[serde(rename = "SUPPORT_AGENT", alias = "RESPONDER")]
    Responder,
}

impl Role {
    /// Status text shown while no counterpart is assigned
    #[must_use]
    pub fn waiting_message(self) -> &'static str {
        match self {
            Self::Requester => "No agents available. Waiting for an agent...",
            Self::Responder => "No guests available. Waiting for a guest...",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requester => write!(f, "requester"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "requester" | "guest" | "customer" => Ok(Self::Requester),
            "responder" | "agent" | "support_agent" => Ok(Self::Responder),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A chat message
///
/// Immutable once constructed: the session only ever appends whole messages
/// to its log and never edits one in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned ID, present only on history-loaded messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Participant who wrote the message
    pub sender: String,
    /// Participant the message is addressed to
    pub recipient: String,
    /// Message body
    pub content: String,
    /// Role of the sender
    #[serde(rename = "senderType", alias = "senderRole")]
    pub sender_role: Role,
    /// ISO-8601 creation time
    pub timestamp: String,
}

impl ChatMessage {
    /// Build an outbound message (no server ID yet)
    pub fn outbound(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
        sender_role: Role,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            sender_role,
            timestamp: timestamp.into(),
        }
    }

    /// Decode a message frame body
    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Encode for publishing
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Assignment notification delivered on the private assignment queue
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentNotice {
    /// The newly assigned counterpart, `None` when the pairing was released
    #[serde(
        rename = "agentId",
        alias = "peerId",
        default,
        deserialize_with = "empty_as_none"
    )]
    pub peer_id: Option<String>,
}

impl AssignmentNotice {
    /// Decode an assignment frame body
    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Topic names for one participant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    /// Private queue carrying chat messages for this participant
    pub messages: String,
    /// Private queue carrying assignment notifications for this participant
    pub assignment: String,
}

impl Topics {
    /// Topics keyed by the participant's local ID
    #[must_use]
    pub fn for_participant(local_id: &str) -> Self {
        Self {
            messages: format!("/user/{local_id}/queue/messages"),
            assignment: format!("/user/{local_id}/queue/assignment"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_outbound_message_wire_shape() {
        let msg = ChatMessage::outbound(
            "guest-1",
            "agent1",
            "hello",
            Role::Requester,
            "2024-05-01T10:00:00.000Z",
        );
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "sender": "guest-1",
                "recipient": "agent1",
                "content": "hello",
                "senderType": "GUEST",
                "timestamp": "2024-05-01T10:00:00.000Z",
            })
        );
    }

    #[test]
    fn test_decode_history_message_with_id() {
        let body = r#"{"id":7,"sender":"agent1","recipient":"guest-1","content":"hi",
            "senderType":"SUPPORT_AGENT","timestamp":"2024-05-01T10:00:01"}"#;
        let msg = ChatMessage::decode(body).unwrap();

        assert_eq!(msg.id, Some(7));
        assert_eq!(msg.sender_role, Role::Responder);
    }

    #[test]
    fn test_decode_accepts_sender_role_alias() {
        let body = r#"{"sender":"a","recipient":"b","content":"x",
            "senderRole":"REQUESTER","timestamp":"t"}"#;
        let msg = ChatMessage::decode(body).unwrap();
        assert_eq!(msg.sender_role, Role::Requester);
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        assert!(ChatMessage::decode(r#"{"sender":"a"}"#).is_err());
        assert!(ChatMessage::decode("not json").is_err());
    }

    #[test]
    fn test_assignment_notice_empty_means_absent() {
        assert_eq!(AssignmentNotice::decode(r#"{"agentId":""}"#).unwrap().peer_id, None);
        assert_eq!(AssignmentNotice::decode("{}").unwrap().peer_id, None);
        assert_eq!(
            AssignmentNotice::decode(r#"{"agentId":"agent1"}"#).unwrap().peer_id,
            Some("agent1".to_string())
        );
        assert_eq!(
            AssignmentNotice::decode(r#"{"peerId":"guest-9"}"#).unwrap().peer_id,
            Some("guest-9".to_string())
        );
    }

    #[test]
    fn test_topics_keyed_by_local_id() {
        let topics = Topics::for_participant("guest-1");
        assert_eq!(topics.messages, "/user/guest-1/queue/messages");
        assert_eq!(topics.assignment, "/user/guest-1/queue/assignment");
    }

    #[test]
    fn test_role_parsing_and_waiting_text() {
        assert_eq!("agent".parse::<Role>().unwrap(), Role::Responder);
        assert_eq!("Requester".parse::<Role>().unwrap(), Role::Requester);
        assert!("nobody".parse::<Role>().is_err());
        assert!(Role::Requester.waiting_message().contains("agent"));
    }
}
