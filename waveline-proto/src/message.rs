//! Identifier and message types shared between the push channel and the
//! REST message endpoints.
//!
//! All types here appear on the wire as JSON and are designed so that the
//! same `ServerMessage` shape is produced by both transports — the dedup
//! keys (`ClientNonce`, `MessageId`) must mean the same thing regardless of
//! which path delivered the message.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a conversation (a server-side channel topic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a conversation identifier from its server-assigned key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this conversation ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated token attached to an outbound message, based on UUID v7
/// for time-ordering.
///
/// The nonce reconciles the optimistic local copy of a message with the
/// server-confirmed copy: the server echoes it back in `message.ack` and in
/// the `message.new` broadcast, and the client never matches by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientNonce(Uuid);

impl ClientNonce {
    /// Generates a fresh, globally unique nonce (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ClientNonce` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientNonce {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned message identifier, strictly increasing per conversation.
///
/// The fallback poller's cursor advances on this value, so ordering matters:
/// `since={id}` fetches return only messages with a larger id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MessageId(u64);

impl MessageId {
    /// Creates a `MessageId` from its raw numeric value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a participant (sender of messages, origin of receipts).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Delivery lifecycle of a server-confirmed message.
///
/// Advances monotonically: `Sent` → `Delivered` → `Read`. `Failed` is a
/// terminal state for messages the server never confirmed. Use
/// [`DeliveryState::advances`] before applying a receipt so a late
/// `delivered` can never regress a `read` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Acknowledged and stored by the server.
    Sent,
    /// Delivered to at least one other participant's device.
    Delivered,
    /// Read by at least one other participant.
    Read,
    /// The server rejected or never confirmed the message.
    Failed,
}

impl DeliveryState {
    /// Position in the monotonic `Sent < Delivered < Read` chain.
    const fn rank(self) -> u8 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
            // Failed sits outside the receipt chain; receipts never apply.
            Self::Failed => u8::MAX,
        }
    }

    /// Returns `true` if moving from `self` to `next` is a forward step in
    /// the receipt chain. Regressions and transitions out of `Failed` are
    /// rejected.
    #[must_use]
    pub const fn advances(self, next: Self) -> bool {
        !matches!(self, Self::Failed)
            && !matches!(next, Self::Failed)
            && next.rank() > self.rank()
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read => write!(f, "read"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A server-confirmed message, as carried by `message.new` frames and the
/// REST history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Server-assigned id, strictly increasing per conversation.
    pub message_id: MessageId,
    /// The conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Who sent the message.
    pub sender_id: UserId,
    /// The message text.
    pub body: String,
    /// Echo of the sender's client nonce, when the message originated from a
    /// client that supplied one. Absent for system-generated messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<ClientNonce>,
    /// Server receive time.
    pub sent_at: Timestamp,
}
