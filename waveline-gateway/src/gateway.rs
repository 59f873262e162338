//! Gateway core: shared state, WebSocket handler, and REST endpoints.
//!
//! Connections authenticate with a bearer token; the dev gateway treats the
//! token itself as the user identity. Subscriptions are per-connection and
//! per-conversation. Message history lives in memory and backs both the
//! `message.new` broadcasts and the REST endpoints, so a client can fall
//! back to polling and see the same stream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use waveline_proto::codec;
use waveline_proto::frame::{Frame, Inbound};
use waveline_proto::message::{
    ClientNonce, ConversationId, MessageId, ServerMessage, Timestamp, UserId,
};

type ConnId = u64;

/// How many messages a conversation retains before the oldest are dropped,
/// unless configured otherwise.
pub const DEFAULT_HISTORY_CAP: usize = 512;

/// Shared gateway state: connection registry, subscriptions, and message
/// history.
pub struct GatewayState {
    /// Per-conversation retention limit; the poll endpoints can only replay
    /// what is still retained.
    history_cap: usize,
    next_conn_id: AtomicU64,
    next_message_id: AtomicU64,
    /// Maps connection id to the sender feeding its WebSocket writer task.
    connections: RwLock<HashMap<ConnId, mpsc::UnboundedSender<Message>>>,
    /// Which connections are subscribed to each conversation.
    subscriptions: RwLock<HashMap<ConversationId, HashSet<ConnId>>>,
    /// Per-conversation history in ascending message id order.
    history: RwLock<HashMap<ConversationId, Vec<ServerMessage>>>,
    /// Index for idempotent sends: a resend of a known nonce gets the
    /// original confirmation instead of a second copy.
    by_nonce: RwLock<HashMap<ClientNonce, ServerMessage>>,
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }
}

impl GatewayState {
    /// Creates empty gateway state with the default history cap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates empty gateway state retaining at most `cap` messages per
    /// conversation.
    #[must_use]
    pub fn with_history_cap(cap: usize) -> Self {
        Self {
            history_cap: cap.max(1),
            next_conn_id: AtomicU64::new(0),
            next_message_id: AtomicU64::new(0),
            connections: RwLock::default(),
            subscriptions: RwLock::default(),
            history: RwLock::default(),
            by_nonce: RwLock::default(),
        }
    }

    async fn register(&self, conn_id: ConnId, sender: mpsc::UnboundedSender<Message>) {
        self.connections.write().await.insert(conn_id, sender);
    }

    async fn unregister(&self, conn_id: ConnId) {
        self.connections.write().await.remove(&conn_id);
        let mut subs = self.subscriptions.write().await;
        for conns in subs.values_mut() {
            conns.remove(&conn_id);
        }
    }

    async fn subscribe(&self, conn_id: ConnId, conversation: &ConversationId) {
        self.subscriptions
            .write()
            .await
            .entry(conversation.clone())
            .or_default()
            .insert(conn_id);
    }

    async fn unsubscribe(&self, conn_id: ConnId, conversation: &ConversationId) {
        if let Some(conns) = self.subscriptions.write().await.get_mut(conversation) {
            conns.remove(&conn_id);
        }
    }

    /// Stores a message, assigning the next id. A known nonce returns the
    /// previously stored message instead (`false` in the second slot).
    async fn store_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        body: String,
        client_nonce: Option<ClientNonce>,
    ) -> (ServerMessage, bool) {
        if let Some(nonce) = &client_nonce {
            if let Some(existing) = self.by_nonce.read().await.get(nonce) {
                return (existing.clone(), false);
            }
        }
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        let message = ServerMessage {
            message_id: MessageId::new(id),
            conversation_id: conversation.clone(),
            sender_id: sender,
            body,
            client_nonce: client_nonce.clone(),
            sent_at: Timestamp::now(),
        };
        {
            let mut history = self.history.write().await;
            let messages = history.entry(conversation).or_default();
            messages.push(message.clone());
            if messages.len() > self.history_cap {
                let excess = messages.len() - self.history_cap;
                messages.drain(..excess);
            }
        }
        if let Some(nonce) = client_nonce {
            self.by_nonce.write().await.insert(nonce, message.clone());
        }
        (message, true)
    }

    /// Sends a frame to every subscriber of `conversation`.
    async fn broadcast(&self, conversation: &ConversationId, frame: &Frame) {
        let Ok(text) = codec::encode(frame) else {
            tracing::error!(frame_type = frame.frame_type(), "failed to encode broadcast");
            return;
        };
        let subscribers: Vec<ConnId> = self
            .subscriptions
            .read()
            .await
            .get(conversation)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default();
        let connections = self.connections.read().await;
        for conn_id in subscribers {
            if let Some(sender) = connections.get(&conn_id) {
                let _ = sender.send(Message::Text(text.clone().into()));
            }
        }
    }

    /// Sends raw text to every connection except `origin`. Used for opaque
    /// frame pass-through, which carries no conversation routing.
    async fn broadcast_raw(&self, origin: ConnId, text: &str) {
        let connections = self.connections.read().await;
        for (conn_id, sender) in connections.iter() {
            if *conn_id != origin {
                let _ = sender.send(Message::Text(text.to_string().into()));
            }
        }
    }
}

/// Handles an upgraded WebSocket connection for an authenticated user.
pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, user: UserId) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.register(conn_id, tx.clone()).await;
    tracing::info!(conn_id, user = %user, "connection established");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text(conn_id, &reader_user, text.as_str(), &reader_state, &tx).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(conn_id).await;
    tracing::info!(conn_id, user = %user, "connection closed");
}

async fn handle_text(
    conn_id: ConnId,
    user: &UserId,
    text: &str,
    state: &Arc<GatewayState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    match codec::decode(text) {
        Ok(Inbound::Frame(frame)) => handle_frame(conn_id, user, frame, state, tx).await,
        Ok(Inbound::Opaque(opaque)) => {
            tracing::debug!(conn_id, frame_type = %opaque.frame_type, "passing opaque frame through");
            state.broadcast_raw(conn_id, text).await;
        }
        Err(err) => {
            tracing::warn!(conn_id, err = %err, "ignoring malformed frame");
        }
    }
}

async fn handle_frame(
    conn_id: ConnId,
    user: &UserId,
    frame: Frame,
    state: &Arc<GatewayState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    match frame {
        Frame::Heartbeat { sent_at } => {
            send_frame(tx, &Frame::Heartbeat { sent_at });
        }
        Frame::ChatJoin { conversation_id } => {
            state.subscribe(conn_id, &conversation_id).await;
            tracing::debug!(conn_id, %conversation_id, "subscribed");
            send_frame(tx, &Frame::ChatJoined { conversation_id });
        }
        Frame::ChatLeave { conversation_id } => {
            state.unsubscribe(conn_id, &conversation_id).await;
            tracing::debug!(conn_id, %conversation_id, "unsubscribed");
        }
        Frame::MessageSend {
            conversation_id,
            client_nonce,
            body,
            ..
        } => {
            let (message, fresh) = state
                .store_message(
                    conversation_id.clone(),
                    user.clone(),
                    body,
                    Some(client_nonce.clone()),
                )
                .await;
            send_frame(
                tx,
                &Frame::MessageAck {
                    conversation_id,
                    client_nonce,
                    message_id: message.message_id,
                },
            );
            if fresh {
                let conversation = message.conversation_id.clone();
                state
                    .broadcast(&conversation, &Frame::MessageNew { message })
                    .await;
            }
        }
        Frame::MessageDelivered {
            conversation_id,
            message_id,
            ..
        } => {
            // The receipt's user_id is always the authenticated sender, not
            // whatever the client claimed.
            state
                .broadcast(
                    &conversation_id.clone(),
                    &Frame::MessageDelivered {
                        conversation_id,
                        message_id,
                        user_id: user.clone(),
                    },
                )
                .await;
        }
        Frame::MessageRead {
            conversation_id,
            message_id,
            ..
        } => {
            state
                .broadcast(
                    &conversation_id.clone(),
                    &Frame::MessageRead {
                        conversation_id,
                        message_id,
                        user_id: user.clone(),
                    },
                )
                .await;
        }
        Frame::MessageAck { .. } | Frame::MessageNew { .. } | Frame::ChatJoined { .. } => {
            tracing::warn!(conn_id, frame_type = frame.frame_type(), "unexpected server frame from client");
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &Frame) {
    match codec::encode(frame) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(err) => {
            tracing::error!(err = %err, "failed to encode frame");
        }
    }
}

fn bearer_user(headers: &HeaderMap) -> Option<UserId> {
    let token = headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(UserId::new(token))
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let Some(user) = bearer_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

#[derive(Debug, serde::Deserialize)]
struct SinceQuery {
    since: Option<u64>,
}

async fn list_messages(
    State(state): State<Arc<GatewayState>>,
    Path(conversation): Path<String>,
    Query(query): Query<SinceQuery>,
    headers: HeaderMap,
) -> Response {
    if bearer_user(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let conversation = ConversationId::new(conversation);
    let since = query.since.map(MessageId::new);
    let history = state.history.read().await;
    let messages: Vec<ServerMessage> = history
        .get(&conversation)
        .map(|messages| {
            messages
                .iter()
                .filter(|m| since.is_none_or(|s| m.message_id > s))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    Json(messages).into_response()
}

#[derive(Debug, serde::Deserialize)]
struct PostMessageBody {
    body: String,
    client_nonce: Option<ClientNonce>,
}

async fn post_message(
    State(state): State<Arc<GatewayState>>,
    Path(conversation): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<PostMessageBody>,
) -> Response {
    let Some(user) = bearer_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let conversation = ConversationId::new(conversation);
    let (message, fresh) = state
        .store_message(conversation.clone(), user, payload.body, payload.client_nonce)
        .await;
    if fresh {
        state
            .broadcast(
                &conversation,
                &Frame::MessageNew {
                    message: message.clone(),
                },
            )
            .await;
    }
    Json(message).into_response()
}

/// Starts the gateway on the given address, returning the bound address and
/// a join handle. This is the entry point for both `main.rs` and tests.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(GatewayState::new())).await
}

/// Starts the gateway with pre-built state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<GatewayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", get(ws_handler))
        .route(
            "/conversations/{conversation}/messages",
            get(list_messages).post(post_message),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(err = %err, "gateway server error");
        }
    });

    Ok((bound_addr, handle))
}
