//! End-to-end session scenarios
//!
//! Each test runs a real session actor against the in-memory transport and
//! fixed collaborators, then drives it the way a backend would: delivering
//! frames, dropping the channel, refusing opens.
//!
//! Retry timing tests run on a paused clock so backoff delays are exact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use switchboard_core::services::FixedServices;
use switchboard_core::transport::SubscriptionId;
use switchboard_core::{
    ChannelTransport, ChatError, ChatMessage, ConnectionState, FailureKind, FailureSignal,
    IdentityGrant, InMemoryHandle, InMemoryTransport, PairingResolver, Role, ServiceError,
    Services, SessionConfig, SessionHandle, SessionStatus, SessionUpdate, TransportError,
    TransportEvent,
};

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    handle: SessionHandle,
    broker: InMemoryHandle,
    services: Arc<FixedServices>,
    updates: broadcast::Receiver<SessionUpdate>,
}

async fn start(services: FixedServices, role: Role) -> Harness {
    start_with(services, role, |_| {}).await
}

async fn start_with<F>(services: FixedServices, role: Role, setup: F) -> Harness
where
    F: FnOnce(&InMemoryHandle),
{
    let services = Arc::new(services);
    let (transport, broker) = InMemoryTransport::new_pair();
    setup(&broker);

    let handle = SessionHandle::start(
        role,
        Services::from_backend(Arc::clone(&services)),
        transport,
        SessionConfig::default(),
    )
    .await
    .expect("session should start");

    // The actor has not run yet on a current-thread runtime, so nothing is missed
    let updates = handle.subscribe();
    Harness {
        handle,
        broker,
        services,
        updates,
    }
}

async fn next_matching<F>(updates: &mut broadcast::Receiver<SessionUpdate>, mut check: F) -> SessionUpdate
where
    F: FnMut(&SessionUpdate) -> bool,
{
    let wait = async {
        loop {
            match updates.recv().await {
                Ok(update) if check(&update) => return update,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("update stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("expected update never arrived")
}

async fn until_status(updates: &mut broadcast::Receiver<SessionUpdate>, wanted: SessionStatus) {
    next_matching(updates, |u| {
        matches!(u, SessionUpdate::StatusChanged { status, .. } if *status == wanted)
    })
    .await;
}

async fn until_history(updates: &mut broadcast::Receiver<SessionUpdate>) -> Vec<ChatMessage> {
    match next_matching(updates, |u| matches!(u, SessionUpdate::HistoryReplaced(_))).await {
        SessionUpdate::HistoryReplaced(messages) => messages,
        _ => unreachable!(),
    }
}

fn frame(sender: &str, recipient: &str, content: &str, role: Role) -> String {
    ChatMessage::outbound(sender, recipient, content, role, "2024-05-01T10:00:00.000Z")
        .encode()
        .unwrap()
}

fn contents(messages: &[ChatMessage]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

/// A channel whose open never completes
struct HangingTransport;

#[async_trait]
impl ChannelTransport for HangingTransport {
    async fn open(&mut self, _events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn subscribe(&mut self, _topic: &str) -> Result<SubscriptionId, TransportError> {
        Err(TransportError::NotConnected)
    }

    async fn publish(&mut self, _topic: &str, _payload: String) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    async fn close(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }
}

fn history_message(id: i64, content: &str) -> ChatMessage {
    let mut message = ChatMessage::outbound(
        "agent1",
        "guest-1",
        content,
        Role::Responder,
        "2024-05-01T09:00:00",
    );
    message.id = Some(id);
    message
}

// =============================================================================
// Pairing
// =============================================================================

#[tokio::test]
async fn test_waiting_responder_paired_by_first_message() {
    let services = FixedServices::granting("agent1", None).with_assignment(Ok(None));
    let mut h = start(services, Role::Responder).await;

    until_status(&mut h.updates, SessionStatus::Waiting).await;
    until_history(&mut h.updates).await;

    assert!(
        h.broker
            .deliver(
                "/user/agent1/queue/messages",
                frame("guest-42", "agent1", "hello?", Role::Requester),
            )
            .await
    );

    let update = next_matching(&mut h.updates, |u| matches!(u, SessionUpdate::PeerChanged(_))).await;
    assert_eq!(update, SessionUpdate::PeerChanged(Some("guest-42".to_string())));
    until_status(&mut h.updates, SessionStatus::Ready).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.peer_id.as_deref(), Some("guest-42"));
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "hello?");
}

#[tokio::test]
async fn test_requester_without_counterpart_waits() {
    let queued = || {
        FixedServices::new(Err(ServiceError::Unavailable {
            local_id: Some("guest-1".to_string()),
            detail: "No agents available, you are in the queue".to_string(),
        }))
    };

    let services = Arc::new(queued());
    let resolver = PairingResolver::new(services.clone(), services);
    let resolution = resolver.resolve(Role::Requester).await.unwrap();
    assert_eq!(resolution.pairing.local_id(), "guest-1");
    assert_eq!(resolution.pairing.peer_id(), None);
    assert!(resolution.assignment_error.is_none());

    let mut h = start(queued(), Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Waiting).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.status_text, "No agents available. Waiting for an agent...");
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test]
async fn test_assignment_notification_reloads_history() {
    let services = FixedServices::granting("guest-1", None);
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Waiting).await;
    assert!(until_history(&mut h.updates).await.is_empty());

    h.services
        .set_history(Ok(vec![history_message(1, "earlier"), history_message(2, "reply")]));
    h.broker
        .deliver("/user/guest-1/queue/assignment", r#"{"agentId":"agent1"}"#)
        .await;

    until_status(&mut h.updates, SessionStatus::Ready).await;
    let history = until_history(&mut h.updates).await;
    assert_eq!(history.len(), 2);
    assert_eq!(h.services.history_requests().len(), 2);

    h.broker
        .deliver("/user/guest-1/queue/assignment", r#"{"agentId":""}"#)
        .await;
    until_status(&mut h.updates, SessionStatus::Waiting).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.peer_id, None);
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("No agents available. Waiting for an agent...")
    );
}

#[tokio::test]
async fn test_undecodable_frames_are_dropped() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;
    until_history(&mut h.updates).await;

    h.broker.deliver("/user/guest-1/queue/messages", "{oops").await;
    h.broker.deliver("/user/guest-1/queue/assignment", "42").await;
    h.broker
        .deliver(
            "/user/guest-1/queue/messages",
            frame("agent1", "guest-1", "still here", Role::Responder),
        )
        .await;

    next_matching(&mut h.updates, |u| matches!(u, SessionUpdate::MessageAppended(_))).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert_eq!(snapshot.peer_id.as_deref(), Some("agent1"));
    assert_eq!(snapshot.messages.len(), 1);
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_messages_appended_in_arrival_order() {
    let services = FixedServices::granting("guest-1", Some("agent1"))
        .with_history(vec![history_message(1, "h1"), history_message(2, "h2")]);
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;
    until_history(&mut h.updates).await;

    for i in 0..20 {
        let sender = if i % 2 == 0 { "agent1" } else { "guest-1" };
        h.broker
            .deliver(
                "/user/guest-1/queue/messages",
                frame(sender, "x", &format!("m{i}"), Role::Responder),
            )
            .await;
    }

    let mut received = 0;
    while received < 20 {
        next_matching(&mut h.updates, |u| matches!(u, SessionUpdate::MessageAppended(_))).await;
        received += 1;
    }

    let snapshot = h.handle.snapshot().await.unwrap();
    let contents: Vec<_> = snapshot.messages.iter().map(|m| m.content.clone()).collect();
    let mut expected = vec!["h1".to_string(), "h2".to_string()];
    expected.extend((0..20).map(|i| format!("m{i}")));
    assert_eq!(contents, expected);
}

/// A history load that lands after live frames keeps those frames behind it
#[tokio::test]
async fn test_live_messages_survive_late_history() {
    let services = FixedServices::granting("guest-1", Some("agent1"))
        .with_history(vec![history_message(1, "earlier")]);
    let gate = services.gate_history();
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;

    h.broker
        .deliver(
            "/user/guest-1/queue/messages",
            frame("agent1", "guest-1", "live", Role::Responder),
        )
        .await;
    next_matching(&mut h.updates, |u| matches!(u, SessionUpdate::MessageAppended(_))).await;
    assert_eq!(h.handle.snapshot().await.unwrap().messages.len(), 1);

    gate.notify_one();
    let log = until_history(&mut h.updates).await;
    assert_eq!(contents(&log), vec!["earlier", "live"]);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(contents(&snapshot.messages), vec!["earlier", "live"]);
}

// =============================================================================
// Outbound
// =============================================================================

#[tokio::test]
async fn test_send_rejects_blank_content() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;

    assert!(matches!(h.handle.send("").await, Err(ChatError::Validation(_))));
    assert!(matches!(h.handle.send("   ").await, Err(ChatError::Validation(_))));

    assert!(h.broker.published().is_empty());
    assert!(h.handle.snapshot().await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_send_requires_counterpart() {
    let services = FixedServices::granting("guest-1", None);
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Waiting).await;

    let err = assert_err!(h.handle.send("hello").await);
    assert!(matches!(err, ChatError::NotReady(_)));
    assert!(h.broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_while_reconnecting_is_not_ready() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start_with(services, Role::Requester, |broker| {
        broker.fail_next_opens(1, "refused");
    })
    .await;
    until_status(
        &mut h.updates,
        SessionStatus::Reconnecting {
            attempt: 1,
            max_attempts: 5,
        },
    )
    .await;

    assert!(matches!(h.handle.send("hello").await, Err(ChatError::NotReady(_))));
    assert!(h.broker.published().is_empty());
    assert!(h.handle.snapshot().await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_send_publishes_and_waits_for_echo() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;
    until_history(&mut h.updates).await;

    assert_ok!(h.handle.send("hi there").await);

    let published = h.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "/app/chat");
    let sent = ChatMessage::decode(&published[0].1).unwrap();
    assert_eq!(sent.sender, "guest-1");
    assert_eq!(sent.recipient, "agent1");
    assert_eq!(sent.content, "hi there");
    assert_eq!(sent.id, None);

    // Not appended until the backend echoes it
    assert!(h.handle.snapshot().await.unwrap().messages.is_empty());

    h.broker
        .deliver("/user/guest-1/queue/messages", published[0].1.clone())
        .await;
    next_matching(&mut h.updates, |u| matches!(u, SessionUpdate::MessageAppended(_))).await;
    assert_eq!(h.handle.snapshot().await.unwrap().messages, vec![sent]);
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_linear_backoff_until_exhausted() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start_with(services, Role::Requester, |broker| {
        broker.fail_next_opens(5, "connection refused");
    })
    .await;

    let started = Instant::now();
    let mut marks = Vec::new();
    loop {
        let update = next_matching(&mut h.updates, |u| {
            matches!(
                u,
                SessionUpdate::StatusChanged {
                    status: SessionStatus::Reconnecting { .. } | SessionStatus::Exhausted { .. },
                    ..
                }
            )
        })
        .await;
        marks.push(started.elapsed().as_secs());
        if matches!(
            update,
            SessionUpdate::StatusChanged {
                status: SessionStatus::Exhausted { attempts: 5 },
                ..
            }
        ) {
            break;
        }
    }

    let delays: Vec<u64> = marks.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(delays, vec![3, 6, 9, 12]);
    assert_eq!(h.broker.open_count(), 5);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Exhausted);
    assert_eq!(snapshot.retry_count, 5);
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("Connection retries exhausted after 5 attempts")
    );

    // Terminal: no further attempts
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.broker.open_count(), 5);

    // Restart re-resolves and connects again
    h.handle.restart().await.unwrap();
    until_status(&mut h.updates, SessionStatus::Ready).await;
    assert_eq!(h.services.identity_requests().len(), 2);
    assert_eq!(h.handle.snapshot().await.unwrap().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resets_retry_count() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start_with(services, Role::Requester, |broker| {
        broker.fail_next_opens(2, "connection refused");
    })
    .await;

    until_status(&mut h.updates, SessionStatus::Ready).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(h.broker.open_count(), 3);

    // Subscriptions are reinstalled on the new channel
    assert_eq!(h.broker.subscribed_topics().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_every_failure_signal_drives_retry() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start(services, Role::Requester).await;

    for kind in [FailureKind::Protocol, FailureKind::Transport, FailureKind::Closed] {
        until_status(&mut h.updates, SessionStatus::Ready).await;
        assert!(h.broker.fail(FailureSignal::new(kind, "dropped")).await);

        until_status(
            &mut h.updates,
            SessionStatus::Reconnecting {
                attempt: 1,
                max_attempts: 5,
            },
        )
        .await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("(Retry 1/5)")));
    }

    until_status(&mut h.updates, SessionStatus::Ready).await;
    assert_eq!(h.broker.open_count(), 4);
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_twice_is_idle() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;

    assert_ok!(h.handle.close().await);
    assert_ok!(h.handle.close().await);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Idle);
    assert_eq!(snapshot.status, SessionStatus::Idle);
    assert!(!h.broker.is_connected());

    next_matching(&mut h.updates, |u| matches!(u, SessionUpdate::Closed)).await;
    assert!(matches!(h.handle.send("hi").await, Err(ChatError::NotReady(_))));
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_retry() {
    let services = FixedServices::granting("agent1", None);
    let mut h = start_with(services, Role::Responder, |broker| {
        broker.fail_next_opens(1, "connection refused");
    })
    .await;
    until_status(
        &mut h.updates,
        SessionStatus::Reconnecting {
            attempt: 1,
            max_attempts: 5,
        },
    )
    .await;

    h.handle.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.broker.open_count(), 1);
    assert_eq!(
        h.handle.snapshot().await.unwrap().connection,
        ConnectionState::Idle
    );
    assert_eq!(h.services.releases(), vec![("agent1".to_string(), Role::Responder)]);
}

#[tokio::test]
async fn test_history_arriving_after_close_is_ignored() {
    let services = FixedServices::granting("guest-1", Some("agent1"))
        .with_history(vec![history_message(1, "late")]);
    let gate = services.gate_history();
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;

    h.handle.close().await.unwrap();
    gate.notify_one();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.services.history_requests().len(), 1);
    assert!(h.handle.snapshot().await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_identity_failure_is_surfaced() {
    let services = Arc::new(FixedServices::new(Err(ServiceError::Unavailable {
        local_id: None,
        detail: "No agents available, you are in the queue".to_string(),
    })));
    let (transport, broker) = InMemoryTransport::new_pair();

    let result = SessionHandle::start(
        Role::Requester,
        Services::from_backend(services),
        transport,
        SessionConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(ChatError::Identity(_))));
    assert_eq!(broker.open_count(), 0);
}

/// Close answers at once even while the channel is still opening
#[tokio::test(start_paused = true)]
async fn test_close_interrupts_open_in_progress() {
    let services = Arc::new(FixedServices::granting("guest-1", Some("agent1")));
    let config = SessionConfig {
        connect_timeout: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let handle = SessionHandle::start(
        Role::Requester,
        Services::from_backend(Arc::clone(&services)),
        HangingTransport,
        config,
    )
    .await
    .unwrap();

    let started = Instant::now();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Connecting);
    let err = assert_err!(handle.send("hi").await);
    assert!(matches!(err, ChatError::NotReady(_)));

    assert_ok!(handle.close().await);
    assert!(started.elapsed() < Duration::from_secs(1));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Idle);
    assert!(matches!(handle.restart().await, Err(ChatError::SessionClosed)));
    assert_eq!(services.identity_requests().len(), 1);
}

// =============================================================================
// Restart
// =============================================================================

/// Restarting into a new identity gives the old one back to the backend
#[tokio::test]
async fn test_restart_with_new_identity_releases_previous() {
    let services = FixedServices::granting("guest-1", Some("agent1"));
    let mut h = start(services, Role::Requester).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;

    h.services.set_identity(Ok(IdentityGrant {
        local_id: "guest-2".to_string(),
        peer_id: Some("agent1".to_string()),
    }));
    assert_ok!(h.handle.restart().await);
    until_status(&mut h.updates, SessionStatus::Ready).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.local_id, "guest-2");
    assert!(h
        .broker
        .subscribed_topics()
        .contains(&"/user/guest-2/queue/messages".to_string()));

    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.services.releases(), vec![("guest-1".to_string(), Role::Requester)]);
}

/// Restarting into the same identity keeps its pairing
#[tokio::test]
async fn test_restart_with_same_identity_releases_nothing() {
    let services = FixedServices::granting("agent1", Some("guest-7"));
    let mut h = start(services, Role::Responder).await;
    until_status(&mut h.updates, SessionStatus::Ready).await;

    assert_ok!(h.handle.restart().await);
    until_status(&mut h.updates, SessionStatus::Ready).await;

    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(h.services.releases().is_empty());
}
