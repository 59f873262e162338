//! Pending-message ledger: outbound tracking, dedup, and receipt state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use waveline_proto::frame::Frame;
use waveline_proto::message::{
    ClientNonce, ConversationId, DeliveryState, MessageId, ServerMessage, Timestamp, UserId,
};

use crate::config::LedgerConfig;

/// An outbound message as handed to the engine, before server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    /// Dedup/reconciliation token, generated at creation.
    pub client_nonce: ClientNonce,
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Message text.
    pub body: String,
    /// Local creation time.
    pub created_at: Timestamp,
}

impl OutboundEnvelope {
    /// Wraps `body` for `conversation` with a fresh nonce.
    pub fn new(conversation: ConversationId, body: impl Into<String>) -> Self {
        Self {
            client_nonce: ClientNonce::new(),
            conversation_id: conversation,
            body: body.into(),
            created_at: Timestamp::now(),
        }
    }

    /// The push-channel frame for this envelope.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::MessageSend {
            conversation_id: self.conversation_id.clone(),
            client_nonce: self.client_nonce.clone(),
            body: self.body.clone(),
            sent_at: self.created_at,
        }
    }
}

/// Lifecycle of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Queued or in flight, awaiting server acknowledgment.
    Sending,
    /// Acknowledged; the entry lingers for the ack grace window so a fast
    /// broadcast echo still dedups against it.
    Sent,
    /// A transmission attempt failed terminally; eligible for explicit
    /// retry.
    Failed,
}

/// A tracked outbound message.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// The original envelope.
    pub envelope: OutboundEnvelope,
    /// Current lifecycle stage.
    pub status: PendingStatus,
    /// Transmission attempts so far, counting the first send.
    pub attempts: u32,
    /// Why the last attempt failed, if it did.
    pub last_error: Option<String>,
    /// When the entry stopped being actionable (acknowledged, or failed
    /// with no attempts left); drives the grace-window sweep.
    resolved_at: Option<Instant>,
}

/// Delivery tracking for a message this client authored, keyed by the
/// server-assigned id once the ack arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageState {
    /// Server-assigned id.
    pub message_id: MessageId,
    /// Conversation the message was stored in.
    pub conversation_id: ConversationId,
    /// Monotonic delivery status.
    pub status: DeliveryState,
}

/// Outcome of feeding an inbound server message through dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// A message this client has not seen before.
    New(ServerMessage),
    /// The server broadcast confirmed one of our own pending sends before
    /// (or instead of) the ack frame.
    Resolved {
        /// Nonce of the pending entry that was resolved.
        client_nonce: ClientNonce,
        /// The confirmed message.
        message: ServerMessage,
    },
    /// Already seen via either dedup key; dropped.
    Duplicate,
}

/// Why a retry request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// No pending entry with that nonce.
    #[error("no pending message with that nonce")]
    Unknown,
    /// Only failed entries may be retried.
    #[error("message is not in the failed state")]
    NotFailed,
    /// The attempt budget is spent.
    #[error("send attempts exhausted")]
    AttemptsExhausted,
}

/// Tracks outbound messages awaiting confirmation, dedups inbound copies,
/// and applies delivery receipts.
///
/// Dedup uses exactly two keys: the server message id and the client nonce.
/// Message content is never compared.
#[derive(Debug)]
pub struct MessageLedger {
    local_user: UserId,
    max_send_attempts: u32,
    ack_grace: Duration,
    max_seen_ids: usize,
    pending: HashMap<ClientNonce, PendingMessage>,
    /// Enqueue order; stale nonces are skipped when iterated.
    queue: VecDeque<ClientNonce>,
    states: HashMap<MessageId, MessageState>,
    seen_ids: HashSet<MessageId>,
    /// Nonces whose pending entry was already swept, so a very late echo of
    /// the broadcast still dedups.
    resolved_nonces: HashSet<ClientNonce>,
}

impl MessageLedger {
    /// Creates an empty ledger for `local_user`.
    #[must_use]
    pub fn new(local_user: UserId, config: &LedgerConfig) -> Self {
        Self {
            local_user,
            max_send_attempts: config.max_send_attempts,
            ack_grace: config.ack_grace,
            max_seen_ids: config.max_seen_ids,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            states: HashMap::new(),
            seen_ids: HashSet::new(),
            resolved_nonces: HashSet::new(),
        }
    }

    /// Tracks a new outbound envelope. Returns `false` if the nonce is
    /// already tracked (never expected; nonces are generated fresh).
    pub fn enqueue(&mut self, envelope: OutboundEnvelope) -> bool {
        let nonce = envelope.client_nonce.clone();
        if self.pending.contains_key(&nonce) || self.resolved_nonces.contains(&nonce) {
            return false;
        }
        self.pending.insert(
            nonce.clone(),
            PendingMessage {
                envelope,
                status: PendingStatus::Sending,
                attempts: 0,
                last_error: None,
                resolved_at: None,
            },
        );
        self.queue.push_back(nonce);
        true
    }

    /// Records a transmission attempt and returns the envelope to send, or
    /// `None` if the nonce is not awaiting transmission.
    pub fn begin_attempt(&mut self, nonce: &ClientNonce) -> Option<OutboundEnvelope> {
        let entry = self.pending.get_mut(nonce)?;
        if entry.status != PendingStatus::Sending {
            return None;
        }
        entry.attempts = entry.attempts.saturating_add(1);
        Some(entry.envelope.clone())
    }

    /// Nonces awaiting transmission, in enqueue order.
    #[must_use]
    pub fn sendable(&self) -> Vec<ClientNonce> {
        self.queue
            .iter()
            .filter(|nonce| {
                self.pending
                    .get(nonce)
                    .is_some_and(|p| p.status == PendingStatus::Sending)
            })
            .cloned()
            .collect()
    }

    /// Applies a server ack: the pending entry becomes `Sent`, the assigned
    /// id joins the dedup set, and delivery tracking starts at
    /// [`DeliveryState::Sent`]. Returns `false` for acks of unknown or
    /// already-resolved nonces.
    pub fn on_ack(
        &mut self,
        nonce: &ClientNonce,
        message_id: MessageId,
        conversation_id: ConversationId,
        now: Instant,
    ) -> bool {
        let Some(entry) = self.pending.get_mut(nonce) else {
            return false;
        };
        if entry.status == PendingStatus::Sent {
            return false;
        }
        entry.status = PendingStatus::Sent;
        entry.last_error = None;
        entry.resolved_at = Some(now);
        self.remember_nonce(nonce.clone());
        self.remember_id(message_id);
        self.states.insert(
            message_id,
            MessageState {
                message_id,
                conversation_id,
                status: DeliveryState::Sent,
            },
        );
        true
    }

    /// Dedups an inbound server message against both keys.
    ///
    /// A broadcast whose nonce matches one of our pending entries acts as an
    /// implicit ack (ack-before-broadcast ordering is not guaranteed across
    /// the fallback path).
    pub fn on_incoming(&mut self, message: ServerMessage, now: Instant) -> IncomingOutcome {
        if self.seen_ids.contains(&message.message_id) {
            return IncomingOutcome::Duplicate;
        }
        if let Some(nonce) = message.client_nonce.clone() {
            if self.resolved_nonces.contains(&nonce) {
                self.remember_id(message.message_id);
                return IncomingOutcome::Duplicate;
            }
            if self.pending.contains_key(&nonce) {
                self.on_ack(
                    &nonce,
                    message.message_id,
                    message.conversation_id.clone(),
                    now,
                );
                return IncomingOutcome::Resolved {
                    client_nonce: nonce,
                    message,
                };
            }
        }
        self.remember_id(message.message_id);
        IncomingOutcome::New(message)
    }

    /// Applies a delivery or read receipt from `user` to a tracked message.
    ///
    /// Returns the new state when it advanced, `None` for receipts from the
    /// local user, regressions, or untracked message ids.
    pub fn on_receipt(
        &mut self,
        message_id: MessageId,
        next: DeliveryState,
        user: &UserId,
    ) -> Option<DeliveryState> {
        if *user == self.local_user {
            return None;
        }
        let state = self.states.get_mut(&message_id)?;
        if !state.status.advances(next) {
            return None;
        }
        state.status = next;
        Some(next)
    }

    /// Marks a pending entry as failed. Returns `false` for unknown or
    /// already-resolved nonces.
    ///
    /// A failure that spends the last attempt also arms the grace-window
    /// sweep, so an entry nobody retries is still abandoned.
    pub fn fail(&mut self, nonce: &ClientNonce, error: impl Into<String>, now: Instant) -> bool {
        match self.pending.get_mut(nonce) {
            Some(entry) if entry.status != PendingStatus::Sent => {
                entry.status = PendingStatus::Failed;
                entry.last_error = Some(error.into());
                if entry.attempts >= self.max_send_attempts {
                    entry.resolved_at = Some(now);
                }
                true
            }
            _ => false,
        }
    }

    /// Re-arms a failed entry for transmission.
    ///
    /// An exhausted entry is abandoned on the spot: it is dropped from
    /// tracking and can never be retried again.
    ///
    /// # Errors
    ///
    /// Returns `RetryError` if the nonce is unknown, the entry is not
    /// failed, or the attempt budget is spent.
    pub fn retry(&mut self, nonce: &ClientNonce) -> Result<(), RetryError> {
        let entry = self.pending.get_mut(nonce).ok_or(RetryError::Unknown)?;
        if entry.status != PendingStatus::Failed {
            return Err(RetryError::NotFailed);
        }
        if entry.attempts < self.max_send_attempts {
            entry.status = PendingStatus::Sending;
            entry.last_error = None;
            return Ok(());
        }
        self.pending.remove(nonce);
        self.queue.retain(|queued| queued != nonce);
        Err(RetryError::AttemptsExhausted)
    }

    /// Removes resolved entries (acknowledged, or failed with no attempts
    /// left) whose grace window has elapsed. Returns the swept nonces.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientNonce> {
        let grace = self.ack_grace;
        let swept: Vec<ClientNonce> = self
            .pending
            .iter()
            .filter(|(_, p)| p.resolved_at.is_some_and(|at| now >= at + grace))
            .map(|(nonce, _)| nonce.clone())
            .collect();
        for nonce in &swept {
            self.pending.remove(nonce);
        }
        self.queue.retain(|nonce| self.pending.contains_key(nonce));
        swept
    }

    /// When the next sweep is due, if any acknowledged entry is lingering.
    #[must_use]
    pub fn next_sweep(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|p| p.resolved_at)
            .min()
            .map(|at| at + self.ack_grace)
    }

    /// The pending entry for `nonce`, if tracked.
    #[must_use]
    pub fn pending(&self, nonce: &ClientNonce) -> Option<&PendingMessage> {
        self.pending.get(nonce)
    }

    /// Delivery tracking for a confirmed message this client authored.
    #[must_use]
    pub fn state(&self, message_id: MessageId) -> Option<&MessageState> {
        self.states.get(&message_id)
    }

    /// Number of tracked pending entries.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn remember_id(&mut self, message_id: MessageId) {
        // Bounded memory: dump the oldest generation wholesale rather than
        // tracking insertion order. A full clear only risks re-surfacing
        // messages older than max_seen_ids ids ago.
        if self.seen_ids.len() >= self.max_seen_ids {
            self.seen_ids.clear();
        }
        self.seen_ids.insert(message_id);
    }

    // Same generational bound as remember_id; an unbounded set would grow by
    // one nonce per message ever sent.
    fn remember_nonce(&mut self, nonce: ClientNonce) {
        if self.resolved_nonces.len() >= self.max_seen_ids {
            self.resolved_nonces.clear();
        }
        self.resolved_nonces.insert(nonce);
    }
}
