//! Outbound Dispatcher
//!
//! Validates a locally authored message and publishes it. The message is not
//! appended locally; the backend echoes it to the sender's private queue and
//! that copy is the one that lands in the log.

use chrono::{SecondsFormat, Utc};

use crate::error::ChatError;
use crate::messages::ChatMessage;
use crate::session::Session;
use crate::transport::{ChannelTransport, TransportError};

/// A validated message ready to publish
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Destination topic
    pub destination: String,
    /// The message
    pub message: ChatMessage,
}

/// Current time as an ISO-8601 string with millisecond precision
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build an outbound message for `content`
///
/// # Errors
///
/// - `ChatError::Validation` if `content` is empty or whitespace
/// - `ChatError::NotReady` if the session is not connected or not paired
pub fn compose(
    session: &Session,
    content: &str,
    destination: &str,
    timestamp: String,
) -> Result<Outbound, ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation("message is empty".to_string()));
    }
    if !session.is_connected() {
        return Err(ChatError::NotReady(format!(
            "connection is {}",
            session.connection_state()
        )));
    }
    let Some(peer_id) = session.peer_id() else {
        return Err(ChatError::NotReady("no counterpart assigned".to_string()));
    };

    Ok(Outbound {
        destination: destination.to_string(),
        message: ChatMessage::outbound(
            session.local_id(),
            peer_id,
            content,
            session.role(),
            timestamp,
        ),
    })
}

/// Publish a composed message
///
/// # Errors
///
/// Returns `ChatError::NotConnected` if the channel went away, or the
/// transport's error for anything else.
pub async fn dispatch<T>(transport: &mut T, outbound: &Outbound) -> Result<(), ChatError>
where
    T: ChannelTransport + ?Sized,
{
    let payload = outbound
        .message
        .encode()
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;

    match transport.publish(&outbound.destination, payload).await {
        Ok(()) => {
            tracing::debug!(
                destination = %outbound.destination,
                recipient = %outbound.message.recipient,
                "Message published"
            );
            Ok(())
        }
        Err(TransportError::NotConnected) => Err(ChatError::NotConnected),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvent, RetryPolicy};
    use crate::messages::{Role, DEFAULT_SEND_DESTINATION};
    use crate::pairing::Pairing;
    use crate::transport::InMemoryTransport;
    use tokio::sync::mpsc;

    const TS: &str = "2024-05-01T10:00:00.000Z";

    fn connected(peer: Option<&str>) -> Session {
        let mut session = Session::new(
            Pairing::new("guest-1", Role::Requester, peer.map(str::to_string)),
            RetryPolicy::default(),
        );
        session
            .apply(ConnectionEvent::Start {
                local_id: "guest-1".to_string(),
            })
            .unwrap();
        session.apply(ConnectionEvent::Opened).unwrap();
        session
    }

    #[test]
    fn test_blank_content_rejected() {
        let session = connected(Some("agent1"));
        for content in ["", "   ", "\n\t"] {
            let result = compose(&session, content, DEFAULT_SEND_DESTINATION, TS.into());
            assert!(matches!(result, Err(ChatError::Validation(_))));
        }
    }

    #[test]
    fn test_not_ready_when_disconnected() {
        let session = Session::new(
            Pairing::new("guest-1", Role::Requester, Some("agent1".into())),
            RetryPolicy::default(),
        );
        let result = compose(&session, "hi", DEFAULT_SEND_DESTINATION, TS.into());
        assert!(matches!(result, Err(ChatError::NotReady(_))));
    }

    #[test]
    fn test_not_ready_without_peer() {
        let session = connected(None);
        let result = compose(&session, "hi", DEFAULT_SEND_DESTINATION, TS.into());
        assert!(matches!(result, Err(ChatError::NotReady(_))));
    }

    #[test]
    fn test_compose_addresses_peer() {
        let session = connected(Some("agent1"));
        let outbound = compose(&session, "hello", DEFAULT_SEND_DESTINATION, TS.into()).unwrap();

        assert_eq!(outbound.destination, "/app/chat");
        assert_eq!(outbound.message.sender, "guest-1");
        assert_eq!(outbound.message.recipient, "agent1");
        assert_eq!(outbound.message.sender_role, Role::Requester);
        assert_eq!(outbound.message.id, None);
        assert!(session.log().is_empty());
    }

    #[test]
    fn test_timestamp_format() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_publishes_without_id() {
        let (mut transport, broker) = InMemoryTransport::new_pair();
        let (tx, _rx) = mpsc::channel(4);
        transport.open(tx).await.unwrap();

        let session = connected(Some("agent1"));
        let outbound = compose(&session, "hello", DEFAULT_SEND_DESTINATION, TS.into()).unwrap();
        dispatch(&mut transport, &outbound).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "/app/chat");
        assert!(published[0].1.contains("\"senderType\":\"GUEST\""));
        assert!(!published[0].1.contains("\"id\""));
    }

    #[tokio::test]
    async fn test_dispatch_without_channel() {
        let (mut transport, _broker) = InMemoryTransport::new_pair();
        let session = connected(Some("agent1"));
        let outbound = compose(&session, "hello", DEFAULT_SEND_DESTINATION, TS.into()).unwrap();

        let result = dispatch(&mut transport, &outbound).await;
        assert!(matches!(result, Err(ChatError::NotConnected)));
    }
}
