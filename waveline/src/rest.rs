//! REST message endpoints: fallback history fetches and degraded sends.

use std::future::Future;

use parking_lot::RwLock;
use waveline_proto::message::{ClientNonce, ConversationId, MessageId, ServerMessage};

/// REST call failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the response never arrived.
    #[error("request failed: {0}")]
    Request(String),
    /// The server answered with a non-success status.
    #[error("server returned status {0}")]
    Status(u16),
    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Message API surface used by the fallback poller and degraded sends.
pub trait MessageApi: Send + Sync {
    /// Fetches messages in `conversation` newer than `since` (all history
    /// when `None`), ordered by ascending message id.
    fn messages_since(
        &self,
        conversation: &ConversationId,
        since: Option<MessageId>,
    ) -> impl Future<Output = Result<Vec<ServerMessage>, ApiError>> + Send;

    /// Posts a message over HTTP, returning the server-confirmed copy. Used
    /// while the push channel is in the error state.
    fn post_message(
        &self,
        conversation: &ConversationId,
        body: &str,
        client_nonce: &ClientNonce,
    ) -> impl Future<Output = Result<ServerMessage, ApiError>> + Send;

    /// Swaps the bearer token used for subsequent requests.
    fn set_token(&self, token: &str) {
        let _ = token;
    }
}

/// HTTP implementation backed by `reqwest`.
#[derive(Debug)]
pub struct HttpMessageApi {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<String>,
}

impl HttpMessageApi {
    /// Creates a client for the gateway at `base_url` (scheme + authority,
    /// with or without a trailing slash).
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: RwLock::new(token.into()),
        }
    }

    fn messages_url(&self, conversation: &ConversationId) -> String {
        format!("{}/conversations/{conversation}/messages", self.base_url)
    }

    fn bearer(&self) -> String {
        self.token.read().clone()
    }
}

impl MessageApi for HttpMessageApi {
    async fn messages_since(
        &self,
        conversation: &ConversationId,
        since: Option<MessageId>,
    ) -> Result<Vec<ServerMessage>, ApiError> {
        let mut request = self
            .client
            .get(self.messages_url(conversation))
            .bearer_auth(self.bearer());
        if let Some(id) = since {
            request = request.query(&[("since", id.value())]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        response
            .json::<Vec<ServerMessage>>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn post_message(
        &self,
        conversation: &ConversationId,
        body: &str,
        client_nonce: &ClientNonce,
    ) -> Result<ServerMessage, ApiError> {
        let response = self
            .client
            .post(self.messages_url(conversation))
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({
                "body": body,
                "client_nonce": client_nonce,
            }))
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        response
            .json::<ServerMessage>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    fn set_token(&self, token: &str) {
        *self.token.write() = token.to_string();
    }
}
