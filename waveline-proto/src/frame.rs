//! Push-channel frame types.
//!
//! Frames travel as JSON text with a `"type"` discriminator. Known types are
//! modeled as [`Frame`] variants; anything else (notably the `game.*`
//! family) is carried as an [`OpaqueFrame`] and forwarded verbatim — the
//! transport layer never interprets those payloads.

use serde::{Deserialize, Serialize};

use crate::message::{ClientNonce, ConversationId, MessageId, ServerMessage, Timestamp, UserId};

/// A typed push-channel frame.
///
/// Client→server frames: `heartbeat`, `message.send`, `chat.join`,
/// `chat.leave`. Server→client frames: `heartbeat` (echo), `message.ack`,
/// `message.new`, `message.delivered`, `message.read`, `chat.joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Liveness probe. The server echoes it back unchanged.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        /// When the probe was emitted.
        sent_at: Timestamp,
    },

    /// Outbound chat message.
    #[serde(rename = "message.send")]
    MessageSend {
        /// Target conversation.
        conversation_id: ConversationId,
        /// Client-generated dedup/reconciliation token.
        client_nonce: ClientNonce,
        /// Message text.
        body: String,
        /// Client-side creation time.
        sent_at: Timestamp,
    },

    /// Server acknowledgment of a `message.send`, carrying the assigned id.
    #[serde(rename = "message.ack")]
    MessageAck {
        /// Conversation the message was stored in.
        conversation_id: ConversationId,
        /// The nonce from the originating `message.send`.
        client_nonce: ClientNonce,
        /// The server-assigned message id.
        message_id: MessageId,
    },

    /// A new message broadcast to every subscriber of its conversation.
    #[serde(rename = "message.new")]
    MessageNew {
        /// The confirmed message.
        #[serde(flatten)]
        message: ServerMessage,
    },

    /// Delivery receipt from another participant's device.
    #[serde(rename = "message.delivered")]
    MessageDelivered {
        /// Conversation of the referenced message.
        conversation_id: ConversationId,
        /// The message the receipt refers to.
        message_id: MessageId,
        /// Who the message was delivered to.
        user_id: UserId,
    },

    /// Read receipt from another participant.
    #[serde(rename = "message.read")]
    MessageRead {
        /// Conversation of the referenced message.
        conversation_id: ConversationId,
        /// The message the receipt refers to.
        message_id: MessageId,
        /// Who read the message.
        user_id: UserId,
    },

    /// Subscription request for a conversation channel.
    #[serde(rename = "chat.join")]
    ChatJoin {
        /// Conversation to subscribe to.
        conversation_id: ConversationId,
    },

    /// Server confirmation of a `chat.join`.
    #[serde(rename = "chat.joined")]
    ChatJoined {
        /// The confirmed conversation.
        conversation_id: ConversationId,
    },

    /// Best-effort unsubscribe notification.
    #[serde(rename = "chat.leave")]
    ChatLeave {
        /// Conversation to unsubscribe from.
        conversation_id: ConversationId,
    },
}

impl Frame {
    /// The wire `"type"` string for this frame.
    #[must_use]
    pub const fn frame_type(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::MessageSend { .. } => "message.send",
            Self::MessageAck { .. } => "message.ack",
            Self::MessageNew { .. } => "message.new",
            Self::MessageDelivered { .. } => "message.delivered",
            Self::MessageRead { .. } => "message.read",
            Self::ChatJoin { .. } => "chat.join",
            Self::ChatJoined { .. } => "chat.joined",
            Self::ChatLeave { .. } => "chat.leave",
        }
    }

    /// Whether `frame_type` names a typed [`Frame`] variant.
    ///
    /// Anything else decodes as an [`OpaqueFrame`]. Keep this in sync with
    /// the variant list above.
    #[must_use]
    pub fn is_known_type(frame_type: &str) -> bool {
        matches!(
            frame_type,
            "heartbeat"
                | "message.send"
                | "message.ack"
                | "message.new"
                | "message.delivered"
                | "message.read"
                | "chat.join"
                | "chat.joined"
                | "chat.leave"
        )
    }
}

/// A frame whose type the transport does not interpret.
///
/// `payload` is the complete original JSON object (including the `type`
/// field), so a registered sink receives exactly what the server sent.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueFrame {
    /// The wire `"type"` string (e.g. `game.move`).
    pub frame_type: String,
    /// The full frame object, unmodified.
    pub payload: serde_json::Value,
}

/// A decoded inbound frame: either typed or opaque pass-through.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A frame the transport layer understands and dispatches itself.
    Frame(Frame),
    /// An unknown frame type, forwarded verbatim to the registered sink.
    Opaque(OpaqueFrame),
}
