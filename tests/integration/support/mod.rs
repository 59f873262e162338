//! Shared harness for the transport engine integration tests: a scripted
//! connector producing in-process loopback sockets, a scriptable stub of the
//! REST message API, and event-stream helpers.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use waveline::config::TransportConfig;
use waveline::rest::{ApiError, MessageApi};
use waveline::socket::{Connector, LoopbackSocket, SocketError};
use waveline::TransportEvent;
use waveline_proto::message::{
    ClientNonce, ConversationId, MessageId, ServerMessage, Timestamp, UserId,
};

/// What a scripted connection attempt should do.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// Hand the engine a loopback socket; the server half goes to the test.
    Accept,
    /// Fail immediately, as if the endpoint were unreachable.
    Refuse,
    /// Never complete, so the engine's connect timeout fires.
    Hang,
}

struct ConnectorInner {
    script: Mutex<VecDeque<Outcome>>,
    server_tx: mpsc::UnboundedSender<LoopbackSocket>,
    attempts: Mutex<Vec<Instant>>,
    tokens: Mutex<Vec<String>>,
}

/// A connector whose attempts follow a pre-loaded script. Unscripted
/// attempts accept.
#[derive(Clone)]
pub struct ScriptedConnector {
    inner: Arc<ConnectorInner>,
}

impl ScriptedConnector {
    /// Returns the connector and the receiver on which the server halves of
    /// accepted connections arrive.
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> (Self, mpsc::UnboundedReceiver<LoopbackSocket>) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let connector = Self {
            inner: Arc::new(ConnectorInner {
                script: Mutex::new(script.into_iter().collect()),
                server_tx,
                attempts: Mutex::new(Vec::new()),
                tokens: Mutex::new(Vec::new()),
            }),
        };
        (connector, server_rx)
    }

    /// Appends further outcomes to the script.
    pub fn push(&self, outcome: Outcome) {
        self.inner.script.lock().push_back(outcome);
    }

    /// Instants at which connection attempts arrived.
    pub fn attempts(&self) -> Vec<Instant> {
        self.inner.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.inner.attempts.lock().len()
    }

    /// Bearer tokens presented, one per attempt.
    pub fn tokens(&self) -> Vec<String> {
        self.inner.tokens.lock().clone()
    }
}

impl Connector for ScriptedConnector {
    type Socket = LoopbackSocket;

    async fn connect(&self, _url: &str, token: &str) -> Result<LoopbackSocket, SocketError> {
        self.inner.attempts.lock().push(Instant::now());
        self.inner.tokens.lock().push(token.to_string());
        let outcome = self
            .inner
            .script
            .lock()
            .pop_front()
            .unwrap_or(Outcome::Accept);
        match outcome {
            Outcome::Accept => {
                let (engine_half, server_half) = LoopbackSocket::pair(64);
                let _ = self.inner.server_tx.send(server_half);
                Ok(engine_half)
            }
            Outcome::Refuse => Err(SocketError::Unreachable("scripted refusal".into())),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct StubApiInner {
    history: Mutex<HashMap<ConversationId, Vec<ServerMessage>>>,
    fetches: Mutex<Vec<(ConversationId, Option<MessageId>)>>,
    posts: Mutex<Vec<(ConversationId, String, ClientNonce)>>,
    next_id: AtomicU64,
    post_fails: AtomicBool,
}

/// In-memory stand-in for the REST message API.
#[derive(Clone, Default)]
pub struct StubApi {
    inner: Arc<StubApiInner>,
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a message into a conversation's history with an explicit id.
    pub fn seed(&self, conversation: &str, id: u64, sender: &str, body: &str) -> ServerMessage {
        let message = ServerMessage {
            message_id: MessageId::new(id),
            conversation_id: ConversationId::new(conversation),
            sender_id: UserId::new(sender),
            body: body.to_string(),
            client_nonce: None,
            sent_at: Timestamp::from_millis(id),
        };
        self.inner
            .history
            .lock()
            .entry(ConversationId::new(conversation))
            .or_default()
            .push(message.clone());
        let current = self.inner.next_id.load(Ordering::Relaxed);
        self.inner.next_id.store(current.max(id), Ordering::Relaxed);
        message
    }

    /// Makes subsequent posts fail with a server error.
    pub fn set_post_fails(&self, fails: bool) {
        self.inner.post_fails.store(fails, Ordering::Relaxed);
    }

    pub fn fetches(&self) -> Vec<(ConversationId, Option<MessageId>)> {
        self.inner.fetches.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.lock().len()
    }

    pub fn posts(&self) -> Vec<(ConversationId, String, ClientNonce)> {
        self.inner.posts.lock().clone()
    }
}

impl MessageApi for StubApi {
    async fn messages_since(
        &self,
        conversation: &ConversationId,
        since: Option<MessageId>,
    ) -> Result<Vec<ServerMessage>, ApiError> {
        self.inner
            .fetches
            .lock()
            .push((conversation.clone(), since));
        let history = self.inner.history.lock();
        Ok(history
            .get(conversation)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| since.is_none_or(|s| m.message_id > s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn post_message(
        &self,
        conversation: &ConversationId,
        body: &str,
        client_nonce: &ClientNonce,
    ) -> Result<ServerMessage, ApiError> {
        self.inner
            .posts
            .lock()
            .push((conversation.clone(), body.to_string(), client_nonce.clone()));
        if self.inner.post_fails.load(Ordering::Relaxed) {
            return Err(ApiError::Status(500));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let message = ServerMessage {
            message_id: MessageId::new(id),
            conversation_id: conversation.clone(),
            sender_id: UserId::new("me"),
            body: body.to_string(),
            client_nonce: Some(client_nonce.clone()),
            sent_at: Timestamp::from_millis(id),
        };
        self.inner
            .history
            .lock()
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }
}

/// Engine config tuned for tests: default timings, small buffers.
pub fn test_config() -> TransportConfig {
    TransportConfig::new("ws://scripted.test/ws")
}

/// Receives events until one matches `pred`, failing after `timeout`.
/// Non-matching events are discarded.
pub async fn wait_for(
    events: &mut mpsc::Receiver<TransportEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&TransportEvent) -> bool,
) -> TransportEvent {
    tokio::time::timeout(timeout, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Asserts that no event arrives within `window`.
pub async fn assert_no_event(events: &mut mpsc::Receiver<TransportEvent>, window: Duration) {
    let outcome = tokio::time::timeout(window, events.recv()).await;
    assert!(
        outcome.is_err(),
        "expected silence, got {:?}",
        outcome.unwrap()
    );
}
