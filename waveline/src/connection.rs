//! Connection supervisor: the single-writer engine task.
//!
//! One task owns the connection state, the socket, the heartbeat monitor,
//! the subscription registry, the message ledger, and fallback-poller
//! activation. Every mutation flows through its `select!` loop — commands
//! from the facade, inbound frames, timer deadlines, and results from the
//! poller and REST-send tasks — so state transitions and their side effects
//! are strictly ordered.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use waveline_proto::frame::{Frame, Inbound, OpaqueFrame};
use waveline_proto::message::{
    ClientNonce, ConversationId, DeliveryState, MessageId, ServerMessage, Timestamp, UserId,
};

use crate::config::TransportConfig;
use crate::facade::TransportEvent;
use crate::heartbeat::{HeartbeatDue, HeartbeatMonitor};
use crate::ledger::{IncomingOutcome, MessageLedger, OutboundEnvelope, RetryError};
use crate::poller::PollPlan;
use crate::registry::ChannelRegistry;
use crate::rest::{ApiError, MessageApi};
use crate::socket::{Connector, Socket, SocketError};

/// Push-channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and none wanted.
    #[default]
    Disconnected,
    /// Initial connection attempt in flight.
    Connecting,
    /// Healthy push channel.
    Connected,
    /// Connection lost; automatic reattempts in progress.
    Reconnecting,
    /// Initial connect failed or the reattempt budget is spent. Terminal
    /// until an explicit `connect()`.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Facade-to-engine commands.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(OutboundEnvelope),
    Retry(ClientNonce),
    Join(ConversationId),
    Leave(ConversationId),
    RotateToken(String),
    Shutdown,
}

/// Results fed back from helper tasks.
#[derive(Debug)]
pub(crate) enum Internal {
    /// A fallback poll round produced messages.
    Polled {
        conversation: ConversationId,
        messages: Vec<ServerMessage>,
    },
    /// A degraded REST send completed.
    RestSent {
        client_nonce: ClientNonce,
        result: Result<ServerMessage, ApiError>,
    },
}

/// Channel endpoints the engine task communicates through.
pub(crate) struct EngineChannels {
    pub commands: mpsc::Receiver<Command>,
    pub internal_tx: mpsc::Sender<Internal>,
    pub internal_rx: mpsc::Receiver<Internal>,
    pub events: mpsc::Sender<TransportEvent>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub plan_tx: watch::Sender<PollPlan>,
    pub game_sink: Option<mpsc::Sender<OpaqueFrame>>,
}

/// What the next loop iteration should do. Produced by `next_step` so the
/// handlers below get the full `&mut self`.
enum Step<S> {
    Command(Option<Command>),
    ConnectOutcome(Result<S, SocketError>),
    Inbound(Option<Result<Inbound, SocketError>>),
    HeartbeatDeadline,
    BackoffElapsed,
    GraceElapsed,
    SweepDue,
    Internal(Option<Internal>),
}

pub(crate) struct Supervisor<C: Connector, A: MessageApi> {
    config: TransportConfig,
    connector: Arc<C>,
    api: Arc<A>,
    token: String,
    state: ConnectionState,
    socket: Option<C::Socket>,
    pending_connect: Option<oneshot::Receiver<Result<C::Socket, SocketError>>>,
    /// Consecutive failed reconnection attempts since the connection was
    /// lost. Reset on CONNECTED and on explicit disconnect/connect.
    failures: u32,
    backoff_until: Option<Instant>,
    grace_until: Option<Instant>,
    heartbeat: HeartbeatMonitor,
    registry: ChannelRegistry,
    ledger: MessageLedger,
    channels: EngineChannels,
}

impl<C, A> Supervisor<C, A>
where
    C: Connector + 'static,
    A: MessageApi + 'static,
{
    pub(crate) fn new(
        config: TransportConfig,
        connector: Arc<C>,
        api: Arc<A>,
        local_user: UserId,
        token: String,
        channels: EngineChannels,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::new(config.heartbeat.interval, config.heartbeat.timeout);
        let ledger = MessageLedger::new(local_user, &config.ledger);
        Self {
            config,
            connector,
            api,
            token,
            state: ConnectionState::Disconnected,
            socket: None,
            pending_connect: None,
            failures: 0,
            backoff_until: None,
            grace_until: None,
            heartbeat,
            registry: ChannelRegistry::new(),
            ledger,
            channels,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            match self.next_step().await {
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::ConnectOutcome(result) => {
                    self.pending_connect = None;
                    self.handle_connect_outcome(result).await;
                }
                Step::Inbound(Some(Ok(inbound))) => self.handle_inbound(inbound).await,
                Step::Inbound(Some(Err(err))) => {
                    tracing::warn!(err = %err, "push channel failed");
                    self.handle_connection_lost().await;
                }
                Step::Inbound(None) => {
                    tracing::info!("push channel closed by peer");
                    self.handle_connection_lost().await;
                }
                Step::HeartbeatDeadline => self.handle_heartbeat_deadline().await,
                Step::BackoffElapsed => {
                    self.backoff_until = None;
                    self.spawn_connect_attempt();
                }
                Step::GraceElapsed => {
                    self.grace_until = None;
                    if self.state != ConnectionState::Connected {
                        tracing::info!("connect grace elapsed, activating fallback poll");
                        self.set_poll_active(true);
                    }
                }
                Step::SweepDue => {
                    let _ = self.ledger.sweep(Instant::now());
                }
                Step::Internal(Some(internal)) => self.handle_internal(internal).await,
                Step::Internal(None) => {}
            }
        }
        self.teardown().await;
    }

    async fn next_step(&mut self) -> Step<C::Socket> {
        tokio::select! {
            command = self.channels.commands.recv() => Step::Command(command),
            result = await_connect(self.pending_connect.as_mut()) => Step::ConnectOutcome(result),
            inbound = next_inbound(self.socket.as_mut()) => Step::Inbound(inbound),
            () = sleep_until_opt(self.heartbeat.deadline()) => Step::HeartbeatDeadline,
            () = sleep_until_opt(self.backoff_until) => Step::BackoffElapsed,
            () = sleep_until_opt(self.grace_until) => Step::GraceElapsed,
            () = sleep_until_opt(self.ledger.next_sweep()) => Step::SweepDue,
            internal = self.channels.internal_rx.recv() => Step::Internal(internal),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => self.disconnect().await,
            Command::Send(envelope) => self.send_message(envelope).await,
            Command::Retry(nonce) => self.retry(nonce).await,
            Command::Join(conversation) => self.join(conversation).await,
            Command::Leave(conversation) => self.leave(conversation).await,
            Command::RotateToken(token) => self.rotate_token(token).await,
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn connect(&mut self) {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                tracing::debug!(state = %self.state, "connect() is a no-op");
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                self.failures = 0;
                self.backoff_until = None;
                self.set_state(ConnectionState::Connecting).await;
                // If the handshake drags past the grace window the fallback
                // poll starts covering for it.
                self.grace_until = Some(Instant::now() + self.config.poll.grace);
                self.spawn_connect_attempt();
            }
        }
    }

    fn spawn_connect_attempt(&mut self) {
        let (tx, rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let url = self.config.url.clone();
        let token = self.token.clone();
        let budget = self.config.connect_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(budget, connector.connect(&url, &token)).await
            {
                Ok(result) => result,
                Err(_) => Err(SocketError::Timeout),
            };
            let _ = tx.send(result);
        });
        self.pending_connect = Some(rx);
    }

    async fn handle_connect_outcome(&mut self, result: Result<C::Socket, SocketError>) {
        match (self.state, result) {
            (ConnectionState::Connecting, Ok(socket)) => {
                self.enter_connected(socket, false).await;
            }
            (ConnectionState::Reconnecting, Ok(socket)) => {
                self.enter_connected(socket, true).await;
            }
            (ConnectionState::Connecting, Err(err)) => {
                tracing::warn!(err = %err, "initial connect failed");
                self.enter_error(false).await;
            }
            (ConnectionState::Reconnecting, Err(err)) => {
                self.failures = self.failures.saturating_add(1);
                tracing::warn!(err = %err, failures = self.failures, "reconnect attempt failed");
                self.schedule_reconnect().await;
            }
            // A disconnect() raced the attempt; discard whatever arrived.
            (_, Ok(mut socket)) => socket.close().await,
            (_, Err(_)) => {}
        }
    }

    async fn enter_connected(&mut self, socket: C::Socket, reconnected: bool) {
        self.socket = Some(socket);
        self.failures = 0;
        self.backoff_until = None;
        self.grace_until = None;
        self.set_state(ConnectionState::Connected).await;
        self.emit(if reconnected {
            TransportEvent::Reconnected
        } else {
            TransportEvent::Connected
        })
        .await;
        self.set_poll_active(false);
        self.heartbeat.start(Instant::now());
        // Re-issue every subscription before flushing queued sends so the
        // acks and broadcasts have somewhere to land.
        for frame in self.registry.join_frames() {
            if !self.send_frame(&frame).await {
                return;
            }
        }
        self.flush_queued().await;
    }

    async fn schedule_reconnect(&mut self) {
        let attempt = self.config.reconnect.attempt(self.failures);
        if attempt.exhausted {
            tracing::warn!(failures = self.failures, "reconnect attempts exhausted");
            self.enter_error(true).await;
            return;
        }
        self.emit(TransportEvent::Reconnecting {
            attempt: attempt.count,
            delay: attempt.delay,
        })
        .await;
        self.backoff_until = Some(Instant::now() + attempt.delay);
    }

    async fn enter_error(&mut self, exhausted: bool) {
        self.pending_connect = None;
        self.backoff_until = None;
        self.grace_until = None;
        self.heartbeat.stop();
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        self.set_state(ConnectionState::Error).await;
        if exhausted {
            self.emit(TransportEvent::ReconnectFailed).await;
        }
        self.set_poll_active(true);
    }

    /// CONNECTED → RECONNECTING on unexpected close, socket failure, or
    /// heartbeat timeout.
    async fn handle_connection_lost(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        if self.state != ConnectionState::Connected {
            return;
        }
        self.heartbeat.stop();
        self.registry.invalidate_all();
        self.failures = 0;
        self.set_state(ConnectionState::Reconnecting).await;
        self.schedule_reconnect().await;
    }

    async fn disconnect(&mut self) {
        self.pending_connect = None;
        self.backoff_until = None;
        self.grace_until = None;
        self.failures = 0;
        self.heartbeat.stop();
        self.set_poll_active(false);
        self.registry.invalidate_all();
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected).await;
            self.emit(TransportEvent::Disconnected).await;
        }
    }

    async fn send_message(&mut self, envelope: OutboundEnvelope) {
        let nonce = envelope.client_nonce.clone();
        if !self.ledger.enqueue(envelope) {
            tracing::warn!(nonce = %nonce, "duplicate client nonce, dropping send");
            return;
        }
        self.transmit(nonce).await;
    }

    async fn transmit(&mut self, nonce: ClientNonce) {
        match self.state {
            ConnectionState::Connected => {
                if let Some(envelope) = self.ledger.begin_attempt(&nonce) {
                    // A send failure flips us into reconnection; the entry
                    // stays queued and is flushed on the next CONNECTED.
                    let _ = self.send_frame(&envelope.to_frame()).await;
                }
            }
            ConnectionState::Error => self.spawn_rest_send(nonce),
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => {
                tracing::debug!(nonce = %nonce, state = %self.state, "send queued");
            }
        }
    }

    fn spawn_rest_send(&mut self, nonce: ClientNonce) {
        let Some(envelope) = self.ledger.begin_attempt(&nonce) else {
            return;
        };
        let api = Arc::clone(&self.api);
        let tx = self.channels.internal_tx.clone();
        tokio::spawn(async move {
            let result = api
                .post_message(
                    &envelope.conversation_id,
                    &envelope.body,
                    &envelope.client_nonce,
                )
                .await;
            let _ = tx
                .send(Internal::RestSent {
                    client_nonce: envelope.client_nonce,
                    result,
                })
                .await;
        });
    }

    async fn retry(&mut self, nonce: ClientNonce) {
        match self.ledger.retry(&nonce) {
            Ok(()) => self.transmit(nonce).await,
            Err(RetryError::AttemptsExhausted) => {
                self.emit(TransportEvent::MessageFailed {
                    client_nonce: nonce,
                    error: "send attempts exhausted".to_string(),
                })
                .await;
            }
            Err(err) => tracing::debug!(nonce = %nonce, err = %err, "retry refused"),
        }
    }

    async fn join(&mut self, conversation: ConversationId) {
        if self.registry.subscribe(&conversation) && self.state == ConnectionState::Connected {
            let frame = Frame::ChatJoin {
                conversation_id: conversation,
            };
            let _ = self.send_frame(&frame).await;
        }
        self.publish_poll_conversations();
    }

    async fn leave(&mut self, conversation: ConversationId) {
        if self.registry.unsubscribe(&conversation) && self.state == ConnectionState::Connected {
            // Best effort; the server garbage-collects idle subscriptions.
            let frame = Frame::ChatLeave {
                conversation_id: conversation,
            };
            let _ = self.send_frame(&frame).await;
        }
        self.publish_poll_conversations();
    }

    async fn rotate_token(&mut self, token: String) {
        self.token = token;
        self.api.set_token(&self.token);
        // An existing or in-flight connection was authenticated with the old
        // token: tear it down and start over from attempt zero.
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            tracing::info!("token rotated, rebuilding connection");
            self.disconnect().await;
            self.connect().await;
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        // Any inbound traffic proves liveness, not just heartbeat echoes.
        self.heartbeat.on_liveness();
        match inbound {
            Inbound::Frame(frame) => self.dispatch_frame(frame).await,
            Inbound::Opaque(opaque) => self.forward_opaque(opaque).await,
        }
    }

    async fn dispatch_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Heartbeat { .. } => {}
            Frame::MessageAck {
                conversation_id,
                client_nonce,
                message_id,
            } => {
                if self
                    .ledger
                    .on_ack(&client_nonce, message_id, conversation_id, Instant::now())
                {
                    self.emit(TransportEvent::MessageSent {
                        client_nonce,
                        message_id,
                    })
                    .await;
                } else {
                    tracing::debug!(nonce = %client_nonce, "ack for unknown or resolved nonce");
                }
            }
            Frame::MessageNew { message } => self.ingest_message(message).await,
            Frame::MessageDelivered {
                message_id,
                user_id,
                ..
            } => {
                self.apply_receipt(message_id, DeliveryState::Delivered, &user_id)
                    .await;
            }
            Frame::MessageRead {
                message_id,
                user_id,
                ..
            } => {
                self.apply_receipt(message_id, DeliveryState::Read, &user_id)
                    .await;
            }
            Frame::ChatJoined { conversation_id } => {
                if !self.registry.confirm(&conversation_id) {
                    tracing::debug!(%conversation_id, "confirmation for untracked conversation");
                }
            }
            Frame::MessageSend { .. } | Frame::ChatJoin { .. } | Frame::ChatLeave { .. } => {
                tracing::warn!(frame_type = frame.frame_type(), "unexpected client frame from server");
            }
        }
    }

    async fn ingest_message(&mut self, message: ServerMessage) {
        match self.ledger.on_incoming(message, Instant::now()) {
            IncomingOutcome::New(message) => {
                self.emit(TransportEvent::MessageNew { message }).await;
            }
            IncomingOutcome::Resolved {
                client_nonce,
                message,
            } => {
                // The broadcast beat the ack frame; treat it as the ack.
                self.emit(TransportEvent::MessageSent {
                    client_nonce,
                    message_id: message.message_id,
                })
                .await;
            }
            IncomingOutcome::Duplicate => {
                tracing::debug!("duplicate message dropped");
            }
        }
    }

    async fn apply_receipt(&mut self, message_id: MessageId, next: DeliveryState, user: &UserId) {
        if let Some(advanced) = self.ledger.on_receipt(message_id, next, user) {
            let event = match advanced {
                DeliveryState::Read => TransportEvent::MessageRead { message_id },
                _ => TransportEvent::MessageDelivered { message_id },
            };
            self.emit(event).await;
        }
    }

    async fn forward_opaque(&mut self, opaque: OpaqueFrame) {
        match &self.channels.game_sink {
            Some(sink) => {
                if sink.send(opaque).await.is_err() {
                    tracing::debug!("opaque sink dropped, discarding further frames");
                    self.channels.game_sink = None;
                }
            }
            None => {
                tracing::debug!(frame_type = %opaque.frame_type, "no sink for opaque frame");
            }
        }
    }

    async fn handle_heartbeat_deadline(&mut self) {
        match self.heartbeat.on_deadline(Instant::now()) {
            Some(HeartbeatDue::Probe) => {
                let frame = Frame::Heartbeat {
                    sent_at: Timestamp::now(),
                };
                let _ = self.send_frame(&frame).await;
            }
            Some(HeartbeatDue::TimedOut) => {
                tracing::warn!("heartbeat watchdog fired, connection is dead");
                self.handle_connection_lost().await;
            }
            None => {}
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Polled { messages, .. } => {
                for message in messages {
                    self.ingest_message(message).await;
                }
            }
            Internal::RestSent {
                client_nonce,
                result,
            } => match result {
                Ok(message) => {
                    if self.ledger.on_ack(
                        &client_nonce,
                        message.message_id,
                        message.conversation_id.clone(),
                        Instant::now(),
                    ) {
                        self.emit(TransportEvent::MessageSent {
                            client_nonce,
                            message_id: message.message_id,
                        })
                        .await;
                    }
                }
                Err(err) => {
                    let error = err.to_string();
                    if self.ledger.fail(&client_nonce, &error, Instant::now()) {
                        self.emit(TransportEvent::MessageFailed {
                            client_nonce,
                            error,
                        })
                        .await;
                    }
                }
            },
        }
    }

    async fn flush_queued(&mut self) {
        for nonce in self.ledger.sendable() {
            let Some(envelope) = self.ledger.begin_attempt(&nonce) else {
                continue;
            };
            if !self.send_frame(&envelope.to_frame()).await {
                return;
            }
        }
    }

    /// Sends one frame over the current socket. On failure the connection
    /// is torn down through the reconnect path and `false` is returned so
    /// the caller stops sending.
    async fn send_frame(&mut self, frame: &Frame) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        match socket.send(frame).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(err = %err, frame_type = frame.frame_type(), "socket send failed");
                self.handle_connection_lost().await;
                false
            }
        }
    }

    async fn set_state(&mut self, new: ConnectionState) {
        if new == self.state {
            return;
        }
        let old = std::mem::replace(&mut self.state, new);
        tracing::info!(%old, %new, "connection state changed");
        let _ = self.channels.state_tx.send(new);
        self.emit(TransportEvent::StateChanged { new, old }).await;
    }

    fn set_poll_active(&mut self, active: bool) {
        let conversations = self.registry.conversations();
        self.channels.plan_tx.send_if_modified(|plan| {
            let changed = plan.active != active || plan.conversations != conversations;
            plan.active = active;
            plan.conversations = conversations;
            changed
        });
    }

    fn publish_poll_conversations(&mut self) {
        let conversations = self.registry.conversations();
        self.channels.plan_tx.send_if_modified(|plan| {
            if plan.conversations == conversations {
                return false;
            }
            plan.conversations = conversations;
            true
        });
    }

    async fn emit(&self, event: TransportEvent) {
        if self.channels.events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    async fn teardown(mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        // Dropping self drops plan_tx, which stops the poller task.
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_inbound<S: Socket>(socket: Option<&mut S>) -> Option<Result<Inbound, SocketError>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn await_connect<S>(
    rx: Option<&mut oneshot::Receiver<Result<S, SocketError>>>,
) -> Result<S, SocketError> {
    match rx {
        Some(rx) => match rx.await {
            Ok(result) => result,
            // The attempt task was dropped mid-handshake (runtime shutdown).
            Err(_) => Err(SocketError::Closed),
        },
        None => std::future::pending().await,
    }
}
