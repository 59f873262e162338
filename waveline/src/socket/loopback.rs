//! In-process socket pair for tests.

use tokio::sync::mpsc;
use waveline_proto::frame::{Frame, Inbound};

use super::{Socket, SocketError};

/// One end of an in-memory frame channel.
///
/// Frames sent through [`Socket::send`] arrive typed on the peer's
/// [`Socket::next`]; [`LoopbackSocket::send_inbound`] injects arbitrary
/// inbound values (including opaque frames) for tests that need to play
/// server.
#[derive(Debug)]
pub struct LoopbackSocket {
    tx: Option<mpsc::Sender<Inbound>>,
    rx: mpsc::Receiver<Inbound>,
}

impl LoopbackSocket {
    /// Creates a connected pair of sockets with the given channel capacity.
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(buffer);
        let (b_tx, b_rx) = mpsc::channel(buffer);
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }

    /// Injects a raw inbound value into the peer's receive stream.
    ///
    /// # Errors
    ///
    /// Returns `SocketError::Closed` if the peer is gone.
    pub async fn send_inbound(&mut self, inbound: Inbound) -> Result<(), SocketError> {
        match &self.tx {
            Some(tx) => tx.send(inbound).await.map_err(|_| SocketError::Closed),
            None => Err(SocketError::Closed),
        }
    }
}

impl Socket for LoopbackSocket {
    async fn send(&mut self, frame: &Frame) -> Result<(), SocketError> {
        self.send_inbound(Inbound::Frame(frame.clone())).await
    }

    async fn next(&mut self) -> Option<Result<Inbound, SocketError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
