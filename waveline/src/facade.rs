//! Application-facing handle for the transport engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use waveline_proto::frame::OpaqueFrame;
use waveline_proto::message::{ClientNonce, ConversationId, MessageId, ServerMessage, UserId};

use crate::config::TransportConfig;
use crate::connection::{Command, ConnectionState, EngineChannels, Supervisor};
use crate::ledger::OutboundEnvelope;
use crate::poller;
use crate::rest::MessageApi;
use crate::socket::Connector;

/// Events delivered to the application, in the order the engine produced
/// them.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection state changed. Always emitted before any side effect
    /// of the transition (resubscription, queued flushes).
    StateChanged {
        /// The state just entered.
        new: ConnectionState,
        /// The state just left.
        old: ConnectionState,
    },
    /// The initial connection is up.
    Connected,
    /// The connection was explicitly torn down.
    Disconnected,
    /// A reconnection attempt has been scheduled.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Backoff delay before the attempt runs.
        delay: Duration,
    },
    /// The push channel was restored after a loss.
    Reconnected,
    /// The reattempt budget is spent; the engine is in the error state and
    /// the fallback poller has taken over.
    ReconnectFailed,
    /// A message from the push channel or the fallback poller, after dedup.
    MessageNew {
        /// The confirmed message.
        message: ServerMessage,
    },
    /// The server confirmed one of this client's sends.
    MessageSent {
        /// Nonce of the originating send.
        client_nonce: ClientNonce,
        /// The assigned server id.
        message_id: MessageId,
    },
    /// A message this client authored was delivered to another participant.
    MessageDelivered {
        /// The delivered message.
        message_id: MessageId,
    },
    /// A message this client authored was read by another participant.
    MessageRead {
        /// The read message.
        message_id: MessageId,
    },
    /// A send failed terminally (REST path error or retry exhaustion).
    MessageFailed {
        /// Nonce of the failed send.
        client_nonce: ClientNonce,
        /// Human-readable cause.
        error: String,
    },
}

/// Handle to a running transport engine.
///
/// Cheap to construct once; every method is a command enqueued to the
/// single-writer engine task, so none of them block on network activity.
#[derive(Debug)]
pub struct TransportFacade {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    task: tokio::task::JoinHandle<()>,
}

impl TransportFacade {
    /// Spawns the engine task and its fallback poller.
    ///
    /// Returns the facade and the event receiver. Nothing connects until
    /// [`TransportFacade::connect`] is called.
    pub fn spawn<C, A>(
        config: TransportConfig,
        connector: C,
        api: A,
        local_user: UserId,
        token: impl Into<String>,
    ) -> (Self, mpsc::Receiver<TransportEvent>)
    where
        C: Connector + 'static,
        A: MessageApi + 'static,
    {
        Self::spawn_with_game_sink(config, connector, api, local_user, token, None)
    }

    /// Like [`TransportFacade::spawn`], with a sink that receives opaque
    /// (`game.*` and other unknown-type) frames verbatim.
    pub fn spawn_with_game_sink<C, A>(
        config: TransportConfig,
        connector: C,
        api: A,
        local_user: UserId,
        token: impl Into<String>,
        game_sink: Option<mpsc::Sender<OpaqueFrame>>,
    ) -> (Self, mpsc::Receiver<TransportEvent>)
    where
        C: Connector + 'static,
        A: MessageApi + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (internal_tx, internal_rx) = mpsc::channel(config.command_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (plan_tx, plan_rx) = watch::channel(poller::PollPlan::default());

        let api = Arc::new(api);
        tokio::spawn(poller::run(
            Arc::clone(&api),
            config.poll.clone(),
            plan_rx,
            internal_tx.clone(),
        ));

        let supervisor = Supervisor::new(
            config,
            Arc::new(connector),
            api,
            local_user,
            token.into(),
            EngineChannels {
                commands: command_rx,
                internal_tx,
                internal_rx,
                events: event_tx,
                state_tx,
                plan_tx,
                game_sink,
            },
        );
        let task = tokio::spawn(supervisor.run());

        (
            Self {
                commands: command_tx,
                state_rx,
                task,
            },
            event_rx,
        )
    }

    /// Opens the push channel. Idempotent while connecting or connected;
    /// from the error state it starts over from attempt zero.
    pub async fn connect(&self) {
        self.command(Command::Connect).await;
    }

    /// Tears the connection down and cancels every timer. The subscription
    /// set and queued sends survive for the next `connect()`.
    pub async fn disconnect(&self) {
        self.command(Command::Disconnect).await;
    }

    /// Queues `body` for `conversation` and returns its nonce immediately.
    /// Progress is reported through `MessageSent`/`MessageFailed` events.
    pub async fn send(&self, conversation: ConversationId, body: impl Into<String>) -> ClientNonce {
        let envelope = OutboundEnvelope::new(conversation, body.into());
        let nonce = envelope.client_nonce.clone();
        self.command(Command::Send(envelope)).await;
        nonce
    }

    /// Re-attempts a failed send.
    pub async fn retry(&self, nonce: ClientNonce) {
        self.command(Command::Retry(nonce)).await;
    }

    /// Subscribes to a conversation channel. Self-healing across
    /// reconnects; subscribing twice is a no-op.
    pub async fn join(&self, conversation: ConversationId) {
        self.command(Command::Join(conversation)).await;
    }

    /// Unsubscribes from a conversation channel.
    pub async fn leave(&self, conversation: ConversationId) {
        self.command(Command::Leave(conversation)).await;
    }

    /// Swaps the bearer token. Any live connection is torn down and
    /// reconnected with the new credentials.
    pub async fn rotate_token(&self, token: impl Into<String>) {
        self.command(Command::RotateToken(token.into())).await;
    }

    /// The current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A watch receiver for connection state changes, independent of the
    /// event stream.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stops the engine task and waits for it to finish.
    pub async fn teardown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.task.await;
    }

    async fn command(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            tracing::warn!("transport engine is gone, command dropped");
        }
    }
}
