//! Agent-side WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. The agent uses this module rather than
//! `tokio-tungstenite` directly, so connection concerns (TLS, timeouts)
//! live in one place.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message, reduced to what the agent handles.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Peer closed the connection.
    Close,
}

/// Write half of the agent connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send failed")
    }

    /// Flush pending writes and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of the agent connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Binary frames are surfaced as text when they hold valid UTF-8;
    /// ping/pong and raw frames are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(WsMessage::Text(text))),
                    Err(_) => continue,
                },
                Some(Ok(tungstenite::Message::Close(_))) => {
                    return Some(Ok(WsMessage::Close));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a relay URL and split the stream into (writer, reader)
/// halves for independent use by the agent's loop pair.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("failed to connect to relay at {url}"))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/ws").await;
        assert!(result.is_err());
    }
}
