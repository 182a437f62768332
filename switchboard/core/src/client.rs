//! Session Actor
//!
//! Runs one [`Session`] as a single tokio task and exposes it through a
//! cloneable [`SessionHandle`].
//!
//! # Architecture
//!
//! ```text
//!  SessionHandle ──Command──┐
//!                           ▼
//!  transport ──Event──> SessionActor ──SessionUpdate──> broadcast
//!  retry timer ───────>    │
//!  history task ──Done──>  │ owns Session + transport
//! ```
//!
//! The actor is the only writer of its session. Every input (commands,
//! transport events, the retry timer, finished collaborator calls) is handled
//! to completion before the next one is looked at, so per-session ordering is
//! the arrival order of each input stream.
//!
//! Collaborator calls made on the session's behalf carry the epoch they were
//! started in. `close()` and `restart()` bump the epoch, and results from an
//! older epoch are discarded. Opening the channel is the one long wait inside
//! an input; commands are still answered during it, and `close()` cuts it
//! short.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::Instrument;

use crate::connection::{ConnectionEvent, ConnectionState, Effect, RetryPolicy};
use crate::consumer::{self, Consumed, StreamKind, SubscriptionTable};
use crate::dispatcher;
use crate::error::ChatError;
use crate::messages::{ChatMessage, Role, DEFAULT_SEND_DESTINATION};
use crate::pairing::{Pairing, PairingResolver, Resolution};
use crate::services::{HistoryService, ServiceError, Services};
use crate::session::{Session, SessionId, SessionSnapshot, SessionStatus, SessionUpdate};
use crate::transport::{
    ChannelTransport, FailureKind, FailureSignal, InboundFrame, TransportEvent,
};

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for one session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Backoff and retry ceiling
    pub policy: RetryPolicy,
    /// Budget for one open attempt
    pub connect_timeout: Duration,
    /// Topic outbound messages are published to
    pub send_destination: String,
    /// Transport event queue depth
    pub event_capacity: usize,
    /// Command queue depth
    pub command_capacity: usize,
    /// Update broadcast buffer per observer
    pub update_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_destination: DEFAULT_SEND_DESTINATION.to_string(),
            event_capacity: 256,
            command_capacity: 32,
            update_capacity: 256,
        }
    }
}

enum Command {
    Send {
        content: String,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Restart {
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    History {
        epoch: u64,
        since: u64,
        result: Result<Vec<ChatMessage>, ServiceError>,
    },
    Resolved {
        result: Result<Resolution, ChatError>,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
}

/// Handle to a running session
///
/// Cheap to clone. The session keeps running until [`SessionHandle::close`]
/// is called and every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<SessionUpdate>,
    session_id: SessionId,
    role: Role,
}

impl SessionHandle {
    /// Resolve identity for `role` and start a session over `transport`
    ///
    /// Connecting starts immediately; watch [`SessionHandle::subscribe`] or
    /// poll [`SessionHandle::snapshot`] for progress.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Identity` if no identity could be established.
    /// A missing counterpart is not an error.
    pub async fn start<T>(
        role: Role,
        services: Services,
        transport: T,
        config: SessionConfig,
    ) -> Result<Self, ChatError>
    where
        T: ChannelTransport + 'static,
    {
        let resolver = PairingResolver::new(
            Arc::clone(&services.identity),
            Arc::clone(&services.assignment),
        );
        let resolution = resolver.resolve(role).await?;

        let mut session = Session::new(resolution.pairing, config.policy);
        if let Some(ref err) = resolution.assignment_error {
            session.set_error(err.to_string());
        }
        let session_id = session.id();

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (update_tx, _) = broadcast::channel(config.update_capacity.max(1));
        let (completion_tx, completion_rx) = mpsc::channel(16);

        let actor = SessionActor {
            session,
            transport,
            resolver,
            history: services.history,
            config,
            commands: command_rx,
            updates: update_tx.clone(),
            events: None,
            subscriptions: SubscriptionTable::new(),
            retry_at: None,
            epoch: 0,
            closed: false,
            pending_close: None,
            completion_tx,
            completion_rx,
        };

        let span = tracing::info_span!("session", session_id = %session_id, %role);
        tokio::spawn(actor.run().instrument(span));

        Ok(Self {
            commands: command_tx,
            updates: update_tx,
            session_id,
            role,
        })
    }

    /// Session instance ID
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Local participant role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Receive future updates
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Send a message to the current counterpart
    ///
    /// # Errors
    ///
    /// - `ChatError::Validation` for empty content
    /// - `ChatError::NotReady` if not connected or not paired
    /// - `ChatError::SessionClosed` if the session task is gone
    pub async fn send(&self, content: impl Into<String>) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Send {
            content: content.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    /// Copy out the session state
    ///
    /// # Errors
    ///
    /// Returns `ChatError::SessionClosed` if the session task is gone.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Re-resolve identity and pairing, then reconnect from scratch
    ///
    /// This is the way out of the exhausted state. A previous identity that
    /// differs from the new one is released.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Identity` if re-resolution fails (the session is
    /// left as it was), or `ChatError::SessionClosed` after `close()`. A
    /// closed session never contacts the identity service.
    pub async fn restart(&self) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Restart { reply }).await?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    /// End the session
    ///
    /// Forces the connection idle, abandons an open in progress, cancels any
    /// pending retry and releases the pairing with the assignment service in
    /// the background. Idempotent.
    pub async fn close(&self) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn request(&self, command: Command) -> Result<(), ChatError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::SessionClosed)
    }
}

struct SessionActor<T> {
    session: Session,
    transport: T,
    resolver: PairingResolver,
    history: Arc<dyn HistoryService>,
    config: SessionConfig,
    commands: mpsc::Receiver<Command>,
    updates: broadcast::Sender<SessionUpdate>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    subscriptions: SubscriptionTable,
    retry_at: Option<Instant>,
    epoch: u64,
    closed: bool,
    // Close requested while an open was in flight
    pending_close: Option<oneshot::Sender<()>>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolve a fresh pairing off the actor and hand it back as a completion
fn spawn_resolution(
    resolver: &PairingResolver,
    role: Role,
    done: &mpsc::Sender<Completion>,
    reply: oneshot::Sender<Result<(), ChatError>>,
) {
    let resolver = resolver.clone();
    let done = done.clone();
    tokio::spawn(
        async move {
            let result = resolver.resolve(role).await;
            let _ = done.send(Completion::Resolved { result, reply }).await;
        }
        .in_current_span(),
    );
}

/// Release `pairing` in the background; failures are reported, not retried
fn spawn_release(
    resolver: &PairingResolver,
    pairing: Pairing,
    updates: &broadcast::Sender<SessionUpdate>,
) {
    let resolver = resolver.clone();
    let updates = updates.clone();
    tokio::spawn(
        async move {
            match resolver.release(&pairing).await {
                Ok(()) => tracing::info!(local_id = %pairing.local_id(), "Pairing released"),
                Err(e) => {
                    tracing::warn!(local_id = %pairing.local_id(), error = %e, "Failed to release pairing");
                    let _ = updates.send(SessionUpdate::Error(format!(
                        "Failed to release pairing: {e}"
                    )));
                }
            }
        }
        .in_current_span(),
    );
}

/// Answer a command that arrives while an open is in flight
///
/// Returns the reply channel of a `Close`, which abandons the open.
fn answer_while_opening(
    command: Command,
    session: &Session,
    config: &SessionConfig,
    resolver: &PairingResolver,
    done: &mpsc::Sender<Completion>,
) -> Option<oneshot::Sender<()>> {
    match command {
        Command::Send { content, reply } => {
            let result = dispatcher::compose(
                session,
                &content,
                &config.send_destination,
                dispatcher::now_timestamp(),
            )
            .and_then(|_| Err(ChatError::NotConnected));
            let _ = reply.send(result);
            None
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
            None
        }
        Command::Restart { reply } => {
            spawn_resolution(resolver, session.role(), done, reply);
            None
        }
        Command::Close { reply } => Some(reply),
    }
}

impl<T: ChannelTransport> SessionActor<T> {
    async fn run(mut self) {
        tracing::info!(
            local_id = %self.session.local_id(),
            peer_id = ?self.session.peer_id(),
            "Session started"
        );

        if let Some(err) = self.session.last_error().map(str::to_string) {
            self.emit(SessionUpdate::Error(err));
        }
        self.fetch_history();
        let local_id = self.session.local_id().to_string();
        self.drive(ConnectionEvent::Start { local_id }).await;

        loop {
            if let Some(reply) = self.pending_close.take() {
                self.close().await;
                let _ = reply.send(());
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("All handles dropped");
                        self.close().await;
                        break;
                    }
                },

                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        self.events = None;
                        let signal = FailureSignal::new(FailureKind::Closed, "event stream ended");
                        self.drive(ConnectionEvent::Failed(signal)).await;
                    }
                },

                () = retry_elapsed(self.retry_at) => {
                    self.retry_at = None;
                    self.drive(ConnectionEvent::RetryElapsed).await;
                }

                Some(done) = self.completion_rx.recv() => self.handle_completion(done).await,
            }
        }

        tracing::info!("Session ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { content, reply } => {
                let result = self.send(&content).await;
                if let Err(ref e) = result {
                    tracing::debug!(error = %e, "Send rejected");
                }
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            Command::Restart { reply } => {
                if self.closed {
                    let _ = reply.send(Err(ChatError::SessionClosed));
                } else {
                    spawn_resolution(&self.resolver, self.session.role(), &self.completion_tx, reply);
                }
            }
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    async fn send(&mut self, content: &str) -> Result<(), ChatError> {
        let outbound = dispatcher::compose(
            &self.session,
            content,
            &self.config.send_destination,
            dispatcher::now_timestamp(),
        )?;
        dispatcher::dispatch(&mut self.transport, &outbound).await
    }

    async fn restart(&mut self, resolution: Resolution) {
        match self.session.connection_state() {
            ConnectionState::Exhausted => self.drive(ConnectionEvent::Reset).await,
            ConnectionState::Idle => {}
            _ => self.drive(ConnectionEvent::Close).await,
        }

        if resolution.pairing.local_id() != self.session.local_id() {
            tracing::info!(
                previous = %self.session.local_id(),
                local_id = %resolution.pairing.local_id(),
                "Identity changed, releasing previous pairing"
            );
            spawn_release(&self.resolver, self.session.pairing().clone(), &self.updates);
        }

        self.epoch += 1;
        self.session.replace_pairing(resolution.pairing);
        match resolution.assignment_error {
            Some(err) => {
                self.session.set_error(err.to_string());
                self.emit(SessionUpdate::Error(err.to_string()));
            }
            None => self.session.clear_error(),
        }
        tracing::info!(
            local_id = %self.session.local_id(),
            peer_id = ?self.session.peer_id(),
            "Session restarted"
        );
        self.emit(SessionUpdate::HistoryReplaced(Vec::new()));
        self.emit(SessionUpdate::PeerChanged(
            self.session.peer_id().map(str::to_string),
        ));

        self.fetch_history();
        let local_id = self.session.local_id().to_string();
        self.drive(ConnectionEvent::Start { local_id }).await;
    }

    async fn close(&mut self) {
        if self.closed {
            tracing::debug!("Close on closed session");
            return;
        }
        self.closed = true;
        self.epoch += 1;
        self.drive(ConnectionEvent::Close).await;

        spawn_release(&self.resolver, self.session.pairing().clone(), &self.updates);

        tracing::info!(local_id = %self.session.local_id(), "Session closed");
        self.emit(SessionUpdate::Closed);
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.handle_frame(frame),
            TransportEvent::Failure(signal) => {
                tracing::warn!(
                    signal = %signal,
                    retry_count = self.session.retry_count(),
                    "Channel failure"
                );
                self.drive(ConnectionEvent::Failed(signal)).await;
            }
        }
    }

    fn stream_kind(&self, frame: &InboundFrame) -> Option<StreamKind> {
        self.subscriptions.kind_of(&frame.subscription).or_else(|| {
            consumer::standing_topics(self.session.local_id())
                .into_iter()
                .find(|(_, topic)| *topic == frame.topic)
                .map(|(kind, _)| kind)
        })
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        let Some(kind) = self.stream_kind(&frame) else {
            tracing::debug!(subscription = %frame.subscription, topic = %frame.topic, "Frame for unknown subscription");
            return;
        };

        let before = self.session.status();
        match consumer::consume(&mut self.session, kind, &frame.body) {
            Consumed::Appended {
                message,
                discovered_peer,
            } => {
                tracing::debug!(sender = %message.sender, "Message received");
                if let Some(peer) = discovered_peer {
                    self.emit(SessionUpdate::PeerChanged(Some(peer)));
                }
                self.emit(SessionUpdate::MessageAppended(message));
            }
            Consumed::Assigned { peer_id } => {
                self.session.clear_error();
                self.emit(SessionUpdate::PeerChanged(Some(peer_id)));
                self.fetch_history();
            }
            Consumed::Unassigned { status_text } => {
                self.session.set_error(status_text);
                self.emit(SessionUpdate::PeerChanged(None));
            }
            Consumed::Dropped => {}
        }
        self.emit_status_change(&before);
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History {
                epoch,
                since,
                result,
            } => {
                if epoch != self.epoch {
                    tracing::debug!(epoch, current = self.epoch, "Discarding stale history");
                    return;
                }
                match result {
                    Ok(messages) => {
                        tracing::debug!(count = messages.len(), "History loaded");
                        self.session.load_history(messages, since);
                        self.emit(SessionUpdate::HistoryReplaced(
                            self.session.log().messages().to_vec(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to load history");
                        let text = format!("Failed to load history: {e}");
                        self.session.set_error(text.clone());
                        self.emit(SessionUpdate::Error(text));
                    }
                }
            }
            Completion::Resolved { result, reply } => {
                let outcome = match result {
                    Ok(resolution) if self.closed => {
                        // Closed while resolving; the new identity is not ours to keep
                        spawn_release(&self.resolver, resolution.pairing, &self.updates);
                        Err(ChatError::SessionClosed)
                    }
                    Ok(resolution) => {
                        self.restart(resolution).await;
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Restart resolution failed");
                        Err(e)
                    }
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn fetch_history(&self) {
        let epoch = self.epoch;
        let since = self.session.log().mark();
        let local_id = self.session.local_id().to_string();
        let history = Arc::clone(&self.history);
        let done = self.completion_tx.clone();
        tokio::spawn(
            async move {
                let result = history.get_history(&local_id).await;
                let _ = done
                    .send(Completion::History {
                        epoch,
                        since,
                        result,
                    })
                    .await;
            }
            .in_current_span(),
        );
    }

    /// Run an event and every follow-up event its effects produce
    async fn drive(&mut self, event: ConnectionEvent) {
        let before = self.session.status();
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let effects = match self.session.apply(event) {
                Ok(effects) => effects,
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring connection event");
                    continue;
                }
            };
            for effect in effects {
                if let Some(next) = self.execute(effect).await {
                    pending.push_back(next);
                }
            }
        }

        self.emit_status_change(&before);
    }

    async fn execute(&mut self, effect: Effect) -> Option<ConnectionEvent> {
        match effect {
            Effect::OpenTransport => Some(self.open().await),

            Effect::InstallSubscriptions => {
                self.subscriptions.clear();
                for (kind, topic) in consumer::standing_topics(self.session.local_id()) {
                    match self.transport.subscribe(&topic).await {
                        Ok(id) => {
                            tracing::debug!(subscription = %id, %topic, "Subscription installed");
                            self.subscriptions.insert(id, kind);
                        }
                        Err(e) => {
                            tracing::warn!(%topic, error = %e, "Subscribe failed");
                            return Some(ConnectionEvent::Failed(FailureSignal::new(
                                FailureKind::Transport,
                                e.to_string(),
                            )));
                        }
                    }
                }
                None
            }

            Effect::ScheduleRetry { attempt, delay } => {
                self.retry_at = Some(Instant::now() + delay);
                let detail = self
                    .session
                    .last_failure_detail()
                    .unwrap_or_else(|| "unknown".to_string());
                let max = self.session.policy().max_attempts;
                tracing::info!(
                    attempt,
                    max_attempts = max,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconnect scheduled"
                );
                let text = format!("Connection failed: {detail} (Retry {attempt}/{max})");
                self.session.set_error(text.clone());
                self.emit(SessionUpdate::Error(text));
                None
            }

            Effect::CancelRetry => {
                self.retry_at = None;
                None
            }

            Effect::TeardownTransport => {
                self.events = None;
                self.subscriptions.clear();
                self.transport.close().await;
                None
            }

            Effect::ReportExhausted { attempts } => {
                let err = ChatError::RetryExhausted { attempts };
                tracing::error!(attempts, "Giving up on connection");
                self.session.set_error(err.to_string());
                self.emit(SessionUpdate::Error(err.to_string()));
                None
            }

            Effect::ClearError => {
                self.session.clear_error();
                None
            }
        }
    }

    /// Open the transport while still answering commands
    ///
    /// A `Close` (or every handle going away) abandons the open and yields
    /// `ConnectionEvent::Close`; the close itself runs on the next loop turn.
    async fn open(&mut self) -> ConnectionEvent {
        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
        self.events = Some(rx);

        let timeout = self.config.connect_timeout;
        let outcome = {
            let open = tokio::time::timeout(timeout, self.transport.open(tx));
            tokio::pin!(open);
            loop {
                tokio::select! {
                    result = &mut open => break Some(result),
                    command = self.commands.recv() => match command {
                        Some(command) => {
                            if let Some(reply) = answer_while_opening(
                                command,
                                &self.session,
                                &self.config,
                                &self.resolver,
                                &self.completion_tx,
                            ) {
                                self.pending_close = Some(reply);
                                break None;
                            }
                        }
                        None => break None,
                    },
                }
            }
        };

        let failure = match outcome {
            None => {
                tracing::info!("Open abandoned by close");
                return ConnectionEvent::Close;
            }
            Some(Ok(Ok(()))) => {
                tracing::info!(local_id = %self.session.local_id(), "Channel open");
                return ConnectionEvent::Opened;
            }
            Some(Ok(Err(e))) => e.to_string(),
            Some(Err(_)) => {
                self.transport.close().await;
                format!("timed out after {} ms", timeout.as_millis())
            }
        };

        tracing::warn!(error = %failure, "Open failed");
        self.events = None;
        ConnectionEvent::Failed(FailureSignal::new(FailureKind::OpenFailed, failure))
    }

    fn emit_status_change(&self, before: &SessionStatus) {
        let status = self.session.status();
        if status != *before {
            let text = status.describe(self.session.role());
            self.emit(SessionUpdate::StatusChanged { status, text });
        }
    }

    fn emit(&self, update: SessionUpdate) {
        // No observers is fine
        let _ = self.updates.send(update);
    }
}
