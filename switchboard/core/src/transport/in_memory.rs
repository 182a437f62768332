//! In-Memory Transport
//!
//! Channel-backed transport with no network underneath. The session drives
//! it exactly like a real channel, while the paired [`InMemoryHandle`] plays
//! the broker: it decides whether opens succeed, delivers frames to
//! subscribed topics, fires failure signals and records everything published.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, broker) = InMemoryTransport::new_pair();
//!
//! // Hand `transport` to a session, keep `broker`
//! broker.fail_next_opens(2, "refused");
//! broker.deliver("/user/guest-1/queue/messages", body).await;
//! assert_eq!(broker.published().len(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{
    ChannelTransport, FailureSignal, InboundFrame, SubscriptionId, TransportError, TransportEvent,
};

#[derive(Default)]
struct Broker {
    connected: bool,
    events: Option<mpsc::Sender<TransportEvent>>,
    scripted_failures: VecDeque<String>,
    subscriptions: Vec<(SubscriptionId, String)>,
    published: Vec<(String, String)>,
    next_subscription: u64,
    opens: u32,
    closes: u32,
}

/// Session side of the in-memory channel
pub struct InMemoryTransport {
    broker: Arc<Mutex<Broker>>,
}

/// Broker side of the in-memory channel
#[derive(Clone)]
pub struct InMemoryHandle {
    broker: Arc<Mutex<Broker>>,
}

impl InMemoryTransport {
    /// Create a transport and the handle that controls it
    #[must_use]
    pub fn new_pair() -> (Self, InMemoryHandle) {
        let broker = Arc::new(Mutex::new(Broker::default()));
        (
            Self {
                broker: Arc::clone(&broker),
            },
            InMemoryHandle { broker },
        )
    }
}

#[async_trait]
impl ChannelTransport for InMemoryTransport {
    async fn open(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        let mut broker = self.broker.lock();
        broker.opens += 1;
        if let Some(detail) = broker.scripted_failures.pop_front() {
            return Err(TransportError::ConnectionFailed(detail));
        }
        broker.connected = true;
        broker.events = Some(events);
        broker.subscriptions.clear();
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId, TransportError> {
        let mut broker = self.broker.lock();
        if !broker.connected {
            return Err(TransportError::NotConnected);
        }
        let id = SubscriptionId(format!("sub-{}", broker.next_subscription));
        broker.next_subscription += 1;
        broker.subscriptions.push((id.clone(), topic.to_string()));
        Ok(id)
    }

    async fn publish(&mut self, topic: &str, payload: String) -> Result<(), TransportError> {
        let mut broker = self.broker.lock();
        if !broker.connected {
            return Err(TransportError::NotConnected);
        }
        broker.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&mut self) {
        let mut broker = self.broker.lock();
        broker.connected = false;
        broker.events = None;
        broker.subscriptions.clear();
        broker.closes += 1;
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().connected
    }
}

impl InMemoryHandle {
    /// Make the next `count` opens fail with `detail`
    pub fn fail_next_opens(&self, count: usize, detail: &str) {
        let mut broker = self.broker.lock();
        for _ in 0..count {
            broker.scripted_failures.push_back(detail.to_string());
        }
    }

    /// Deliver a frame to whoever is subscribed to `topic`
    ///
    /// Returns `false` if nothing is subscribed or the channel is closed.
    pub async fn deliver(&self, topic: &str, body: impl Into<String>) -> bool {
        let target = {
            let broker = self.broker.lock();
            let subscription = broker
                .subscriptions
                .iter()
                .find(|(_, t)| t == topic)
                .map(|(id, _)| id.clone());
            match (subscription, broker.events.clone()) {
                (Some(id), Some(tx)) => Some((id, tx)),
                _ => None,
            }
        };

        let Some((subscription, tx)) = target else {
            return false;
        };
        tx.send(TransportEvent::Frame(InboundFrame {
            subscription,
            topic: topic.to_string(),
            body: body.into(),
        }))
        .await
        .is_ok()
    }

    /// Fire a failure signal and drop the channel
    pub async fn fail(&self, signal: FailureSignal) -> bool {
        let tx = {
            let mut broker = self.broker.lock();
            broker.connected = false;
            broker.subscriptions.clear();
            broker.events.take()
        };
        match tx {
            Some(tx) => tx.send(TransportEvent::Failure(signal)).await.is_ok(),
            None => false,
        }
    }

    /// Everything published so far as `(topic, payload)`
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.broker.lock().published.clone()
    }

    /// Topics currently subscribed
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.broker
            .lock()
            .subscriptions
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Number of open attempts
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.broker.lock().opens
    }

    /// Number of close calls
    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.broker.lock().closes
    }

    /// Check if the session side is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.broker.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FailureKind;

    #[tokio::test]
    async fn test_subscribe_requires_open() {
        let (mut transport, _broker) = InMemoryTransport::new_pair();
        let result = transport.subscribe("/topic").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_publish_requires_open() {
        let (mut transport, broker) = InMemoryTransport::new_pair();
        let result = transport.publish("/app/chat", "{}".into()).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_open_failure() {
        let (mut transport, broker) = InMemoryTransport::new_pair();
        broker.fail_next_opens(1, "refused");
        let (tx, _rx) = mpsc::channel(8);

        assert!(transport.open(tx.clone()).await.is_err());
        assert!(transport.open(tx).await.is_ok());
        assert_eq!(broker.open_count(), 2);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_deliver_routes_to_subscription() {
        let (mut transport, broker) = InMemoryTransport::new_pair();
        let (tx, mut rx) = mpsc::channel(8);
        transport.open(tx).await.unwrap();
        let id = transport.subscribe("/user/a/queue/messages").await.unwrap();

        assert!(broker.deliver("/user/a/queue/messages", "hi").await);
        assert!(!broker.deliver("/user/b/queue/messages", "nope").await);

        match rx.recv().await.unwrap() {
            TransportEvent::Frame(frame) => {
                assert_eq!(frame.subscription, id);
                assert_eq!(frame.body, "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_drops_channel() {
        let (mut transport, broker) = InMemoryTransport::new_pair();
        let (tx, mut rx) = mpsc::channel(8);
        transport.open(tx).await.unwrap();

        assert!(broker.fail(FailureSignal::new(FailureKind::Closed, "gone")).await);
        assert!(!transport.is_connected());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Failure(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut transport, broker) = InMemoryTransport::new_pair();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_connected());
        assert_eq!(broker.close_count(), 2);
    }
}
