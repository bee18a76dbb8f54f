//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the WebSocket base URL of one ComfyUI
//! instance.  Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`] bound to a client ID.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Raw WebSocket stream type used by ComfyUI connections.
pub type ComfyUIStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI instance's WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
#[derive(Debug)]
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake. ComfyUI only
    /// addresses execution events for prompts submitted with the same ID.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// Create a new client.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
        }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Full endpoint URL for a given client ID.
    pub fn endpoint(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={}", self.ws_url, client_id)
    }

    /// Connect to the ComfyUI WebSocket endpoint as `client_id`.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = self.endpoint(client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Send a close frame and drop the connection.
    ///
    /// Errors are logged, not returned: the socket is being discarded
    /// either way.
    pub async fn close(mut self) {
        if let Err(e) = self.ws_stream.close(None).await {
            tracing::debug!(client_id = %self.client_id, error = %e, "WebSocket close failed");
        } else {
            tracing::debug!(client_id = %self.client_id, "WebSocket closed");
        }
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_client_id() {
        let client = ComfyUIClient::new("ws://127.0.0.1:8188/".into());
        assert_eq!(
            client.endpoint("abc-123"),
            "ws://127.0.0.1:8188/ws?clientId=abc-123"
        );
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_listens() {
        let client = ComfyUIClient::new("ws://127.0.0.1:9".into());
        let result = client.connect("abc").await;
        assert!(matches!(result, Err(ComfyUIClientError::Connection(_))));
    }
}
