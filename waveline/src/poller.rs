//! HTTP polling fallback.
//!
//! Runs as its own task, driven by a watch channel carrying the current
//! [`PollPlan`]. While the plan is active it fetches each subscribed
//! conversation in turn, advancing a per-conversation cursor on the highest
//! message id seen, and feeds results back to the connection engine, which
//! owns dedup. Cursors live only as long as the task; a fresh session
//! refetches recent history and relies on dedup to discard known messages.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use waveline_proto::message::{ConversationId, MessageId};

use crate::config::PollConfig;
use crate::connection::Internal;
use crate::rest::MessageApi;

/// What the poller should be doing right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PollPlan {
    /// Whether fallback polling is active.
    pub active: bool,
    /// Conversations to poll, mirroring the subscription registry.
    pub conversations: Vec<ConversationId>,
}

pub(crate) async fn run<A: MessageApi>(
    api: Arc<A>,
    config: PollConfig,
    mut plan_rx: watch::Receiver<PollPlan>,
    tx: mpsc::Sender<Internal>,
) {
    let mut cursors: HashMap<ConversationId, MessageId> = HashMap::new();
    loop {
        // Park until activated. The watch sender living in the connection
        // engine dropping means the engine is gone.
        while !plan_rx.borrow_and_update().active {
            if plan_rx.changed().await.is_err() {
                return;
            }
        }

        let conversations = plan_rx.borrow().conversations.clone();
        for conversation in conversations {
            if !plan_rx.borrow().active {
                break;
            }
            let since = cursors.get(&conversation).copied();
            let fetch = api.messages_since(&conversation, since);
            match tokio::time::timeout(config.request_timeout, fetch).await {
                Ok(Ok(messages)) => {
                    if let Some(newest) = messages.iter().map(|m| m.message_id).max() {
                        let cursor = cursors.entry(conversation.clone()).or_insert(newest);
                        *cursor = (*cursor).max(newest);
                    }
                    if !messages.is_empty() {
                        let polled = Internal::Polled {
                            conversation: conversation.clone(),
                            messages,
                        };
                        if tx.send(polled).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Err(err)) => {
                    // Cursor untouched; the next round retries the same
                    // window.
                    tracing::warn!(%conversation, err = %err, "fallback poll failed");
                }
                Err(_) => {
                    tracing::warn!(%conversation, "fallback poll timed out");
                }
            }
        }

        tokio::select! {
            () = tokio::time::sleep(config.interval) => {}
            changed = plan_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
