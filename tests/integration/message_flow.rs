// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! End-to-end message flow against a live gateway.
//!
//! Alice runs the full transport engine (real websocket connector, real REST
//! client); Bob is a bare websocket client speaking raw JSON. These tests
//! validate:
//! - A send is confirmed to the sender (`MessageSent`) and broadcast to the
//!   peer, and the sender's own echo is deduplicated away
//! - Read receipts flow back to the author as `MessageRead`
//! - Concurrent sends get distinct nonces and distinct server ids
//! - Unknown frame types (`game.*`) pass through verbatim to the registered
//!   sink

mod support;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use support::{assert_no_event, wait_for};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use waveline::config::TransportConfig;
use waveline::rest::HttpMessageApi;
use waveline::socket::WsConnector;
use waveline::{TransportEvent, TransportFacade};
use waveline_gateway::start_server;
use waveline_proto::message::{ConversationId, UserId};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const EVENT_BUDGET: Duration = Duration::from_secs(5);

async fn spawn_alice(
    addr: SocketAddr,
    game_sink: Option<tokio::sync::mpsc::Sender<waveline_proto::frame::OpaqueFrame>>,
) -> (
    TransportFacade,
    tokio::sync::mpsc::Receiver<TransportEvent>,
) {
    let config = TransportConfig::new(format!("ws://{addr}/ws"));
    let api = HttpMessageApi::new(format!("http://{addr}"), "alice");
    let (facade, mut events) = TransportFacade::spawn_with_game_sink(
        config,
        WsConnector,
        api,
        UserId::new("alice"),
        "alice",
        game_sink,
    );
    facade.connect().await;
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Connected)
    })
    .await;
    (facade, events)
}

/// Dials the gateway as a bare websocket client.
async fn dial(addr: SocketAddr, token: &str) -> WsStream {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    let (stream, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    stream
}

async fn send_json(ws: &mut WsStream, value: &serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Reads the next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut WsStream) -> serde_json::Value {
    tokio::time::timeout(EVENT_BUDGET, async {
        loop {
            match ws.next().await.expect("socket closed").unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Joins `conversation` and waits for the confirmation.
async fn join_raw(ws: &mut WsStream, conversation: &str) {
    send_json(
        ws,
        &serde_json::json!({"type": "chat.join", "conversation_id": conversation}),
    )
    .await;
    let confirmed = next_json(ws).await;
    assert_eq!(confirmed["type"], "chat.joined");
}

#[tokio::test]
async fn send_reaches_peer_and_own_echo_is_deduplicated() {
    let (addr, _gateway) = start_server("127.0.0.1:0").await.unwrap();
    let (alice, mut events) = spawn_alice(addr, None).await;
    let mut bob = dial(addr, "bob").await;

    alice.join(ConversationId::new("conv-1")).await;
    join_raw(&mut bob, "conv-1").await;

    let nonce = alice.send(ConversationId::new("conv-1"), "hi bob").await;
    let event = wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::MessageSent { .. })
    })
    .await;
    let TransportEvent::MessageSent { client_nonce, .. } = event else {
        unreachable!();
    };
    assert_eq!(client_nonce, nonce);

    let broadcast = next_json(&mut bob).await;
    assert_eq!(broadcast["type"], "message.new");
    assert_eq!(broadcast["body"], "hi bob");
    assert_eq!(broadcast["sender_id"], "alice");
    assert_eq!(broadcast["client_nonce"], nonce.to_string());

    // The gateway also broadcasts to alice; her engine must swallow the
    // echo rather than surface her own message as MessageNew.
    assert_no_event(&mut events, Duration::from_millis(500)).await;

    alice.teardown().await;
}

#[tokio::test]
async fn read_receipt_flows_back_to_the_author() {
    let (addr, _gateway) = start_server("127.0.0.1:0").await.unwrap();
    let (alice, mut events) = spawn_alice(addr, None).await;
    let mut bob = dial(addr, "bob").await;

    alice.join(ConversationId::new("conv-1")).await;
    join_raw(&mut bob, "conv-1").await;

    alice.send(ConversationId::new("conv-1"), "read me").await;
    let event = wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::MessageSent { .. })
    })
    .await;
    let TransportEvent::MessageSent { message_id, .. } = event else {
        unreachable!();
    };

    let broadcast = next_json(&mut bob).await;
    assert_eq!(broadcast["type"], "message.new");
    send_json(
        &mut bob,
        &serde_json::json!({
            "type": "message.read",
            "conversation_id": "conv-1",
            "message_id": broadcast["message_id"],
            "user_id": "bob",
        }),
    )
    .await;

    let event = wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::MessageRead { .. })
    })
    .await;
    assert_eq!(event, TransportEvent::MessageRead { message_id });

    alice.teardown().await;
}

#[tokio::test]
async fn concurrent_sends_get_distinct_nonces_and_ids() {
    let (addr, _gateway) = start_server("127.0.0.1:0").await.unwrap();
    let (alice, mut events) = spawn_alice(addr, None).await;

    alice.join(ConversationId::new("conv-1")).await;

    let mut nonces = Vec::new();
    for i in 0..3 {
        nonces.push(alice.send(ConversationId::new("conv-1"), format!("msg {i}")).await);
    }

    let mut confirmed = Vec::new();
    for _ in 0..3 {
        let event = wait_for(&mut events, EVENT_BUDGET, |e| {
            matches!(e, TransportEvent::MessageSent { .. })
        })
        .await;
        let TransportEvent::MessageSent {
            client_nonce,
            message_id,
        } = event
        else {
            unreachable!();
        };
        confirmed.push((client_nonce, message_id));
    }

    for (i, nonce) in nonces.iter().enumerate() {
        assert!(
            confirmed.iter().any(|(n, _)| n == nonce),
            "send {i} was never confirmed"
        );
    }
    let mut ids: Vec<_> = confirmed.iter().map(|(_, id)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "server ids must be distinct");

    alice.teardown().await;
}

#[tokio::test]
async fn game_frames_pass_through_to_the_sink() {
    let (addr, _gateway) = start_server("127.0.0.1:0").await.unwrap();
    let (game_tx, mut game_rx) = tokio::sync::mpsc::channel(8);
    let (alice, _events) = spawn_alice(addr, Some(game_tx)).await;
    let mut bob = dial(addr, "bob").await;

    send_json(
        &mut bob,
        &serde_json::json!({"type": "game.move", "match_id": "m-1", "move": "e2e4"}),
    )
    .await;

    let opaque = tokio::time::timeout(EVENT_BUDGET, game_rx.recv())
        .await
        .expect("timed out waiting for the game frame")
        .unwrap();
    assert_eq!(opaque.frame_type, "game.move");
    assert_eq!(opaque.payload["move"], "e2e4");
    assert_eq!(opaque.payload["type"], "game.move");

    alice.teardown().await;
}
