//! Error types for the stream client.

use agentdeck_protocol::Scope;
use tokio_tungstenite::tungstenite;

/// Errors returned to callers of [`StreamClient`](crate::StreamClient).
///
/// Transport and decode failures never show up here; they are absorbed and
/// reported to subscribers as [`StreamEvent`](crate::StreamEvent)s.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("no valid credential available")]
    Unauthenticated,

    #[error("scope {0} was never connected")]
    UnconnectedScope(Scope),

    #[error("outbound channel of scope {0} is full")]
    Backpressure(Scope),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Errors raised while opening or running a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("server rejected the credential")]
    Unauthorized,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Maps handshake rejections (HTTP 401/403) to [`TransportError::Unauthorized`].
    pub(crate) fn from_handshake(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(resp)
                if matches!(resp.status().as_u16(), 401 | 403) =>
            {
                Self::Unauthorized
            }
            _ => Self::Ws(err),
        }
    }
}
