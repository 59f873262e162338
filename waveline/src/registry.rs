//! Per-conversation channel subscriptions.

use std::collections::HashMap;

use waveline_proto::frame::Frame;
use waveline_proto::message::ConversationId;

/// A tracked channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Server-side channel topic, derived from the conversation id.
    pub channel_key: String,
    /// Whether the server has confirmed the join on the current socket.
    pub confirmed: bool,
}

/// Tracks which conversation channels the client wants to be subscribed to.
///
/// The desired set survives disconnects; confirmations are per-socket and
/// are invalidated whenever the connection is lost, so every reconnect
/// re-issues the full set of joins.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    subscriptions: HashMap<ConversationId, Subscription>,
}

fn channel_key(conversation: &ConversationId) -> String {
    format!("conversation:{conversation}")
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conversation` to the desired set. Returns `false` if it was
    /// already tracked (subscribing twice is a no-op).
    pub fn subscribe(&mut self, conversation: &ConversationId) -> bool {
        if self.subscriptions.contains_key(conversation) {
            return false;
        }
        self.subscriptions.insert(
            conversation.clone(),
            Subscription {
                channel_key: channel_key(conversation),
                confirmed: false,
            },
        );
        true
    }

    /// Removes `conversation` from the desired set. Returns `false` if it
    /// was not tracked.
    pub fn unsubscribe(&mut self, conversation: &ConversationId) -> bool {
        self.subscriptions.remove(conversation).is_some()
    }

    /// Marks a subscription as confirmed by the server. Returns `false` for
    /// confirmations of conversations no longer in the desired set.
    pub fn confirm(&mut self, conversation: &ConversationId) -> bool {
        match self.subscriptions.get_mut(conversation) {
            Some(sub) => {
                sub.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// Clears every confirmation. Called when the socket is lost; the
    /// desired set itself is untouched.
    pub fn invalidate_all(&mut self) {
        for sub in self.subscriptions.values_mut() {
            sub.confirmed = false;
        }
    }

    /// Whether `conversation` is in the desired set.
    #[must_use]
    pub fn is_subscribed(&self, conversation: &ConversationId) -> bool {
        self.subscriptions.contains_key(conversation)
    }

    /// Whether the server has confirmed the join on the current socket.
    #[must_use]
    pub fn is_confirmed(&self, conversation: &ConversationId) -> bool {
        self.subscriptions
            .get(conversation)
            .is_some_and(|sub| sub.confirmed)
    }

    /// The desired conversation set, for re-joins and fallback polling.
    #[must_use]
    pub fn conversations(&self) -> Vec<ConversationId> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Join frames for every desired conversation.
    #[must_use]
    pub fn join_frames(&self) -> Vec<Frame> {
        self.subscriptions
            .keys()
            .map(|conversation| Frame::ChatJoin {
                conversation_id: conversation.clone(),
            })
            .collect()
    }

    /// Number of tracked subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no subscriptions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
