//! WebSocket transport for the messaging link.
//!
//! Single responsibility: open the socket and move text messages. No
//! knowledge of STOMP frames, subscriptions, or session state.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{handshake::client::generate_key, http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Send half of the WebSocket
pub(crate) type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Receive half of the WebSocket
pub(crate) type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// A connected WebSocket carrying STOMP text traffic.
///
/// Can only be constructed via [`Socket::connect`]; holding one means the
/// HTTP upgrade completed.
pub(crate) struct Socket {
    sink: WsSink,
    stream: WsStream,
}

impl Socket {
    pub(crate) async fn connect(url: &str, host: &str) -> Result<Self> {
        debug!(url = %url, "connecting WebSocket");

        let request = Request::builder()
            .uri(url)
            .header("Host", host)
            .header("Origin", origin_for(url))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .map_err(|e| {
                ClientError::Connection(format!("failed to build upgrade request: {}", e))
            })?;

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| ClientError::Connection(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Self { sink, stream })
    }

    /// Send one wire message (an encoded frame or a heartbeat EOL)
    pub(crate) async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Connection(format!("failed to send: {}", e)))
    }

    /// Next text message; `None` when the peer closed
    pub(crate) async fn recv_text(&mut self) -> Result<Option<String>> {
        next_text(&mut self.stream).await
    }

    /// Split into halves for concurrent send/receive
    pub(crate) fn split(self) -> (WsSink, WsStream) {
        (self.sink, self.stream)
    }
}

/// Next text message off a receive half. Skips ping/pong and binary
/// traffic; pong replies are tungstenite's job.
pub(crate) async fn next_text(stream: &mut WsStream) -> Result<Option<String>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ClientError::Connection(format!("WebSocket error: {}", e)))
            }
            None => return Ok(None),
        }
    }
}

/// Origin header for a ws/wss endpoint
fn origin_for(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(("wss", rest)) => ("https", rest),
        Some((_, rest)) => ("http", rest),
        None => ("http", url),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    format!("{}://{}", scheme, host)
}
