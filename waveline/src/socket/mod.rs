//! Push-channel socket abstraction.
//!
//! [`Socket`] and [`Connector`] are the seams between the connection engine
//! and the actual transport: [`ws::WsConnector`] speaks websocket for
//! production, [`loopback::LoopbackSocket`] is an in-process pair for tests.

use std::future::Future;

use waveline_proto::frame::{Frame, Inbound};

pub mod loopback;
pub mod ws;

pub use loopback::LoopbackSocket;
pub use ws::{WsConnector, WsSocket};

/// Socket-level failures.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The peer closed the connection or the socket is no longer usable.
    #[error("connection closed")]
    Closed,
    /// The connection attempt did not complete within its budget.
    #[error("connection attempt timed out")]
    Timeout,
    /// The endpoint could not be reached.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    /// The handshake was rejected (bad credentials, protocol mismatch).
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// An outbound frame could not be encoded.
    #[error("frame encoding failed: {0}")]
    Codec(String),
    /// Underlying IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional frame channel.
///
/// Implementations must be `Sync`: the connection supervisor owns the socket
/// inside a spawned task whose future has to stay `Send` across awaits.
pub trait Socket: Send + Sync {
    /// Sends one frame to the peer.
    fn send(&mut self, frame: &Frame) -> impl Future<Output = Result<(), SocketError>> + Send;

    /// Receives the next inbound frame. `None` means the peer closed the
    /// channel cleanly; `Some(Err(_))` means it broke. Malformed frames are
    /// logged and skipped inside the implementation, never surfaced.
    fn next(&mut self) -> impl Future<Output = Option<Result<Inbound, SocketError>>> + Send;

    /// Closes the channel. Best effort.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens authenticated sockets to the gateway.
pub trait Connector: Send + Sync {
    /// The socket type this connector produces.
    type Socket: Socket + 'static;

    /// Dials `url` and performs the handshake with the given bearer token.
    fn connect(
        &self,
        url: &str,
        token: &str,
    ) -> impl Future<Output = Result<Self::Socket, SocketError>> + Send;
}
