//! Transport seam between the stream state machine and the network.
//!
//! [`WsConnector`] opens real WebSockets; tests plug in channel-backed
//! connectors through the same [`Connector`] trait.

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{Sink, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

use agentdeck_protocol::constants::MAX_FRAME_SIZE;

use crate::error::TransportError;

/// Outbound half of an open transport.
pub type FrameSink = Pin<Box<dyn Sink<tungstenite::Message, Error = tungstenite::Error> + Send>>;

/// Inbound half of an open transport.
pub type FrameStream = BoxStream<'static, Result<tungstenite::Message, tungstenite::Error>>;

/// An open, split transport.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports to stream endpoints.
pub trait Connector: Send + Sync + 'static {
    /// Opens a transport to `endpoint`, presenting `token` as bearer credential.
    fn connect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> BoxFuture<'static, Result<Transport, TransportError>>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> BoxFuture<'static, Result<Transport, TransportError>> {
        let request = build_request(endpoint, token);
        Box::pin(async move {
            let request = request?;
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(MAX_FRAME_SIZE);
            ws_config.max_frame_size = Some(MAX_FRAME_SIZE);

            let (ws_stream, response) =
                tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false)
                    .await
                    .map_err(TransportError::from_handshake)?;
            debug!(status = %response.status(), "websocket handshake complete");

            let (write, read) = ws_stream.split();
            Ok(Transport {
                sink: Box::pin(write),
                stream: read.boxed(),
            })
        })
    }
}

/// Builds the handshake request with an `Authorization: Bearer` header.
fn build_request(
    endpoint: &str,
    token: &str,
) -> Result<tungstenite::handshake::client::Request, TransportError> {
    let mut request = endpoint.into_client_request()?;
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| TransportError::InvalidEndpoint(format!("unusable credential: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_bearer_header() {
        let request = build_request("ws://localhost:5000/ws", "tok-1").unwrap();
        assert_eq!(request.uri().path(), "/ws");
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer tok-1"
        );
    }

    #[test]
    fn request_rejects_bad_url() {
        assert!(matches!(
            build_request("not a url", "tok"),
            Err(TransportError::Ws(_))
        ));
    }

    #[test]
    fn request_rejects_header_breaking_token() {
        assert!(matches!(
            build_request("ws://localhost/ws", "bad\ntoken"),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        // Port 1 on localhost is essentially never listening.
        let result = WsConnector::new().connect("ws://127.0.0.1:1/ws", "tok").await;
        assert!(matches!(result, Err(TransportError::Ws(_))));
    }
}
