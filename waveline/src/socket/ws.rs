//! Websocket transport.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use waveline_proto::codec;
use waveline_proto::frame::{Frame, Inbound};

use super::{Connector, Socket, SocketError};

/// Dials the gateway over websocket with a bearer token header.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Socket = WsSocket;

    async fn connect(&self, url: &str, token: &str) -> Result<WsSocket, SocketError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SocketError::Handshake(e.to_string()))?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| SocketError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);

        let (stream, _response) = connect_async(request).await.map_err(map_connect_error)?;
        Ok(WsSocket { inner: stream })
    }
}

fn map_connect_error(err: WsError) -> SocketError {
    match err {
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::NetworkUnreachable => SocketError::Unreachable(io.to_string()),
            _ => SocketError::Io(io),
        },
        WsError::Http(response) => {
            SocketError::Handshake(format!("gateway returned {}", response.status()))
        }
        other => SocketError::Handshake(other.to_string()),
    }
}

/// A connected websocket carrying JSON text frames.
#[derive(Debug)]
pub struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Socket for WsSocket {
    async fn send(&mut self, frame: &Frame) -> Result<(), SocketError> {
        let text = codec::encode(frame).map_err(|e| SocketError::Codec(e.to_string()))?;
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| match e {
                WsError::Io(io) => SocketError::Io(io),
                _ => SocketError::Closed,
            })
    }

    async fn next(&mut self) -> Option<Result<Inbound, SocketError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => match codec::decode(text.as_str()) {
                    Ok(inbound) => return Some(Ok(inbound)),
                    Err(err) => {
                        tracing::warn!(err = %err, "dropping malformed frame");
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(Message::Binary(_)) => {
                    tracing::debug!("ignoring unexpected binary frame");
                }
                // Transport-level control frames; tungstenite answers pings
                // on its own.
                Ok(_) => {}
                Err(WsError::Io(io)) => return Some(Err(SocketError::Io(io))),
                Err(_) => return Some(Err(SocketError::Closed)),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.inner.close(None).await {
            tracing::debug!(err = %err, "websocket close handshake failed");
        }
    }
}
