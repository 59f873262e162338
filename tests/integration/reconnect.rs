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

//! Integration tests for automatic reconnection.
//!
//! These tests validate:
//! - Exponential backoff: delays 1s, 2s, 4s, 8s, 8s over five reattempts,
//!   then ERROR with `ReconnectFailed` and no further dialing
//! - A successful reattempt re-issues `chat.join` for every tracked
//!   conversation before flushing sends queued during the outage
//! - An unanswered heartbeat probe tears the connection down through the
//!   same reconnect path
//!
//! Connection loss is simulated by dropping the server half of the loopback
//! socket pair, which the engine observes as an unexpected close.

mod support;

use std::time::Duration;

use support::{assert_no_event, test_config, wait_for, Outcome, ScriptedConnector, StubApi};
use waveline::socket::Socket;
use waveline::{ConnectionState, TransportEvent, TransportFacade};
use waveline_proto::frame::{Frame, Inbound};
use waveline_proto::message::{ConversationId, UserId};

fn spawn(
    connector: ScriptedConnector,
) -> (
    TransportFacade,
    tokio::sync::mpsc::Receiver<TransportEvent>,
) {
    TransportFacade::spawn(
        test_config(),
        connector,
        StubApi::new(),
        UserId::new("me"),
        "token-1",
    )
}

const EVENT_BUDGET: Duration = Duration::from_secs(120);

#[tokio::test(start_paused = true)]
async fn backoff_doubles_then_caps_then_exhausts() {
    let (connector, mut server_rx) = ScriptedConnector::new([
        Outcome::Accept,
        Outcome::Refuse,
        Outcome::Refuse,
        Outcome::Refuse,
        Outcome::Refuse,
        Outcome::Refuse,
    ]);
    let (facade, mut events) = spawn(connector.clone());

    facade.connect().await;
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Connected)
    })
    .await;
    let server = server_rx.recv().await.unwrap();
    drop(server);

    let expected = [
        (1, Duration::from_secs(1)),
        (2, Duration::from_secs(2)),
        (3, Duration::from_secs(4)),
        (4, Duration::from_secs(8)),
        (5, Duration::from_secs(8)),
    ];
    for (attempt, delay) in expected {
        let event = wait_for(&mut events, EVENT_BUDGET, |e| {
            matches!(e, TransportEvent::Reconnecting { .. })
        })
        .await;
        assert_eq!(event, TransportEvent::Reconnecting { attempt, delay });
    }

    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::ReconnectFailed)
    })
    .await;
    assert_eq!(facade.state(), ConnectionState::Error);

    // One initial dial plus five reattempts, then nothing.
    assert_eq!(connector.attempt_count(), 6);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempt_count(), 6);

    facade.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_before_flushing_queued_sends() {
    let (connector, mut server_rx) = ScriptedConnector::new([Outcome::Accept, Outcome::Accept]);
    let (facade, mut events) = spawn(connector);
    let conversation = ConversationId::new("conv-1");

    facade.connect().await;
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Connected)
    })
    .await;
    let mut server = server_rx.recv().await.unwrap();

    facade.join(conversation.clone()).await;
    let joined = server.next().await.unwrap().unwrap();
    assert_eq!(
        joined,
        Inbound::Frame(Frame::ChatJoin {
            conversation_id: conversation.clone(),
        })
    );
    server
        .send(&Frame::ChatJoined {
            conversation_id: conversation.clone(),
        })
        .await
        .unwrap();

    // Lose the channel, then send while the engine is reconnecting.
    drop(server);
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Reconnecting { attempt: 1, .. })
    })
    .await;
    let nonce = facade.send(conversation.clone(), "queued during outage").await;

    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Reconnected)
    })
    .await;
    let mut server = server_rx.recv().await.unwrap();

    // Resubscription lands first so the ack has a live channel to route to.
    let first = server.next().await.unwrap().unwrap();
    assert_eq!(
        first,
        Inbound::Frame(Frame::ChatJoin {
            conversation_id: conversation.clone(),
        })
    );
    let second = server.next().await.unwrap().unwrap();
    match second {
        Inbound::Frame(Frame::MessageSend {
            conversation_id,
            client_nonce,
            body,
            ..
        }) => {
            assert_eq!(conversation_id, conversation);
            assert_eq!(client_nonce, nonce);
            assert_eq!(body, "queued during outage");
        }
        other => panic!("expected the queued send, got {other:?}"),
    }

    facade.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeat_triggers_reconnect() {
    let (connector, mut server_rx) = ScriptedConnector::new([Outcome::Accept, Outcome::Accept]);
    let (facade, mut events) = spawn(connector);

    facade.connect().await;
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Connected)
    })
    .await;
    let mut server = server_rx.recv().await.unwrap();

    // First probe arrives after the 25s idle interval. Never answer it.
    let probe = server.next().await.unwrap().unwrap();
    assert!(matches!(probe, Inbound::Frame(Frame::Heartbeat { .. })));

    // The watchdog fires 60s after the unanswered probe and the engine
    // treats the connection as dead.
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Reconnecting { attempt: 1, .. })
    })
    .await;
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Reconnected)
    })
    .await;
    let _server = server_rx.recv().await.unwrap();
    assert_eq!(facade.state(), ConnectionState::Connected);

    facade.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn answered_heartbeats_keep_the_connection_up() {
    let (connector, mut server_rx) = ScriptedConnector::new([Outcome::Accept]);
    let (facade, mut events) = spawn(connector.clone());

    facade.connect().await;
    wait_for(&mut events, EVENT_BUDGET, |e| {
        matches!(e, TransportEvent::Connected)
    })
    .await;
    let mut server = server_rx.recv().await.unwrap();

    // Echo three probe cycles back; the watchdog must never fire.
    for _ in 0..3 {
        let probe = server.next().await.unwrap().unwrap();
        let Inbound::Frame(frame @ Frame::Heartbeat { .. }) = probe else {
            panic!("expected a heartbeat probe, got {probe:?}");
        };
        server.send(&frame).await.unwrap();
    }

    assert_no_event(&mut events, Duration::from_secs(30)).await;
    assert_eq!(facade.state(), ConnectionState::Connected);
    assert_eq!(connector.attempt_count(), 1);

    facade.teardown().await;
}
