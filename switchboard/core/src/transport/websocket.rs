//! STOMP-over-WebSocket Transport
//!
//! Client-side transport for the chat backend. Opens a WebSocket, performs
//! the STOMP handshake, then runs two tasks:
//!
//! - a read task decoding STOMP frames into [`TransportEvent`]s
//! - a write task draining an outbound queue into the socket
//!
//! Broker `ERROR` frames become the protocol-error signal, socket errors the
//! transport-error signal, and a close frame or EOF the closure signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::stomp::{StompCommand, StompDecoder, StompFrame};
use super::traits::{
    ChannelTransport, FailureKind, FailureSignal, InboundFrame, SubscriptionId, TransportError,
    TransportEvent,
};

/// Outbound queue depth per connection
const OUTBOUND_CAPACITY: usize = 100;

/// Settings for one WebSocket endpoint
#[derive(Clone, Debug)]
pub struct WebSocketSettings {
    /// WebSocket URL (e.g. `ws://localhost:8080/chat/websocket`)
    pub url: String,
    /// Optional STOMP login/passcode
    pub credentials: Option<(String, String)>,
    /// Budget for socket connect plus STOMP handshake
    pub connect_timeout: Duration,
}

/// STOMP client over a WebSocket
pub struct StompWebSocketTransport {
    settings: WebSocketSettings,
    outbound: Option<mpsc::Sender<WsMessage>>,
    connected: Arc<AtomicBool>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
    next_subscription: u64,
}

impl StompWebSocketTransport {
    /// Create a new, unopened transport
    #[must_use]
    pub fn new(settings: WebSocketSettings) -> Self {
        Self {
            settings,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            read_task: None,
            write_task: None,
            next_subscription: 0,
        }
    }

    /// Get the endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.settings.url
    }

    fn virtual_host(&self) -> String {
        self.settings
            .url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.authority().map(|a| a.as_str().to_string()))
            .unwrap_or_else(|| "localhost".to_string())
    }

    async fn queue(&self, frame: StompFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let Some(ref tx) = self.outbound else {
            return Err(TransportError::NotConnected);
        };
        tx.send(WsMessage::Text(frame.encode()))
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }
}

#[async_trait]
impl ChannelTransport for StompWebSocketTransport {
    async fn open(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "Already connected".to_string(),
            ));
        }
        // Leftovers from a channel that failed on its own
        self.close().await;

        let timeout_ms = u64::try_from(self.settings.connect_timeout.as_millis()).unwrap_or(u64::MAX);
        let host = self.virtual_host();
        let credentials = self
            .settings
            .credentials
            .as_ref()
            .map(|(l, p)| (l.as_str(), p.as_str()));
        let connect_frame = StompFrame::connect(&host, credentials);
        let url = self.settings.url.clone();

        let handshake = async {
            let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| {
                    TransportError::ConnectionFailed(format!("Failed to connect to {url}: {e}"))
                })?;
            let (mut sink, mut stream) = ws.split();

            sink.send(WsMessage::Text(connect_frame.encode()))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;

            let mut decoder = StompDecoder::new();
            loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        decoder.push(&text);
                        while let Some(frame) = decoder.decode()? {
                            match frame.command {
                                StompCommand::Connected => {
                                    return Ok::<_, TransportError>((sink, stream, decoder));
                                }
                                StompCommand::Error => {
                                    return Err(TransportError::Protocol(
                                        frame.get("message").unwrap_or("handshake rejected").to_string(),
                                    ));
                                }
                                other => {
                                    tracing::debug!(command = %other, "Ignoring frame before CONNECTED");
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Err(TransportError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(TransportError::ConnectionFailed(e.to_string()));
                    }
                }
            }
        };

        let (mut sink, mut stream, mut decoder) =
            tokio::time::timeout(self.settings.connect_timeout, handshake)
                .await
                .map_err(|_| TransportError::Timeout(timeout_ms))??;

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_CAPACITY);
        self.connected.store(true, Ordering::SeqCst);
        self.next_subscription = 0;

        // Read task: socket -> STOMP frames -> events
        let connected_read = Arc::clone(&self.connected);
        let read_events = events.clone();
        let read_task = tokio::spawn(async move {
            let signal = 'read: loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        decoder.push(&text);
                        loop {
                            match decoder.decode() {
                                Ok(Some(frame)) => match frame.command {
                                    StompCommand::Message => {
                                        let inbound = InboundFrame {
                                            subscription: SubscriptionId(
                                                frame.get("subscription").unwrap_or_default().to_string(),
                                            ),
                                            topic: frame.get("destination").unwrap_or_default().to_string(),
                                            body: frame.body,
                                        };
                                        if read_events.send(TransportEvent::Frame(inbound)).await.is_err() {
                                            tracing::debug!("Event receiver dropped");
                                            break 'read None;
                                        }
                                    }
                                    StompCommand::Error => {
                                        let detail = frame
                                            .get("message")
                                            .map_or_else(|| frame.body.clone(), str::to_string);
                                        break 'read Some(FailureSignal::new(FailureKind::Protocol, detail));
                                    }
                                    other => {
                                        tracing::trace!(command = %other, "Ignoring frame");
                                    }
                                },
                                Ok(None) => break,
                                Err(e) => {
                                    // A bad frame poisons the rest of the buffer
                                    tracing::warn!(error = %e, "Frame decode error");
                                    decoder = StompDecoder::new();
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(close))) => {
                        let detail = close
                            .map(|c| format!("code {}: {}", u16::from(c.code), c.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                        break Some(FailureSignal::new(FailureKind::Closed, detail));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break Some(FailureSignal::new(FailureKind::Transport, e.to_string()));
                    }
                    None => {
                        break Some(FailureSignal::new(FailureKind::Closed, "end of stream"));
                    }
                }
            };

            connected_read.store(false, Ordering::SeqCst);
            if let Some(signal) = signal {
                tracing::info!(signal = %signal, "Channel lost");
                let _ = read_events.send(TransportEvent::Failure(signal)).await;
            }
        });

        // Write task: outbound queue -> socket
        let connected_write = Arc::clone(&self.connected);
        let write_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(error = %e, "Write error");
                    if connected_write.swap(false, Ordering::SeqCst) {
                        let signal = FailureSignal::new(FailureKind::Transport, e.to_string());
                        let _ = events.send(TransportEvent::Failure(signal)).await;
                    }
                    return;
                }
            }
            let _ = sink.close().await;
        });

        self.outbound = Some(out_tx);
        self.read_task = Some(read_task);
        self.write_task = Some(write_task);

        tracing::info!(url = %self.settings.url, "STOMP session established");
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId, TransportError> {
        let id = SubscriptionId(format!("sub-{}", self.next_subscription));
        self.queue(StompFrame::subscribe(&id.0, topic)).await?;
        self.next_subscription += 1;
        tracing::debug!(subscription = %id, topic, "Subscribed");
        Ok(id)
    }

    async fn publish(&mut self, topic: &str, payload: String) -> Result<(), TransportError> {
        self.queue(StompFrame::send(topic, payload)).await
    }

    async fn close(&mut self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(tx) = self.outbound.take() {
            if was_connected {
                let _ = tx.try_send(WsMessage::Text(StompFrame::disconnect().encode()));
            }
            // Dropping the sender lets the write task flush and close the socket
        }
        self.write_task = None;

        if was_connected {
            tracing::info!(url = %self.settings.url, "Disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
