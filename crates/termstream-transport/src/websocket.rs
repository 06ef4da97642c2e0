//! WebSocket connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    TransportError,
    connector::{Connection, Connector, ConnectorFactory},
};

/// Connects to a single WebSocket URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Create a connector; `http(s)://` URLs are mapped to `ws(s)://`.
    #[must_use]
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            url: http_to_ws_scheme(url.as_ref()),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Connection, TransportError> {
        tracing::debug!(url = %self.url, "Opening WebSocket");

        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", self.url)))?;

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| TransportError::ConnectionLost(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));

        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!("Dropping non UTF-8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "WebSocket close frame received");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::ConnectionLost(e.to_string()))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// Per-process terminal endpoints under a common base, `{base}/terminal/{key}`.
#[derive(Debug, Clone)]
pub struct TerminalEndpoints {
    base: String,
}

impl TerminalEndpoints {
    #[must_use]
    pub fn new(base: impl AsRef<str>) -> Self {
        Self {
            base: http_to_ws_scheme(base.as_ref().trim_end_matches('/')),
        }
    }

    /// URL of the endpoint for `key`.
    #[must_use]
    pub fn url_for(&self, key: &str) -> String {
        format!("{}/terminal/{key}", self.base)
    }
}

impl ConnectorFactory for TerminalEndpoints {
    type Connector = WebSocketConnector;

    fn connector_for(&self, key: &str) -> WebSocketConnector {
        WebSocketConnector::new(self.url_for(key))
    }
}

/// Convert an HTTP(S) URL to the WS(S) scheme; `ws(s)://` passes through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://example.com"), "wss://example.com");
        assert_eq!(http_to_ws_scheme("http://localhost:8765/ws"), "ws://localhost:8765/ws");
        assert_eq!(http_to_ws_scheme("ws://host"), "ws://host");
    }

    #[test]
    fn test_terminal_endpoint_urls() {
        let endpoints = TerminalEndpoints::new("http://localhost:8765/ws/");
        assert_eq!(endpoints.url_for("4242"), "ws://localhost:8765/ws/terminal/4242");
        assert_eq!(
            endpoints.connector_for("7").endpoint(),
            "ws://localhost:8765/ws/terminal/7"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_to_connect() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1/none");
        assert!(matches!(
            connector.open().await,
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
