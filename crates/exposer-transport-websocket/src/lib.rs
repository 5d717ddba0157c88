//! WebSocket transport for the exposer control channel
//!
//! A WebSocket carries discrete messages while the protocol engine expects a
//! byte stream. Each side is bridged through an in-memory duplex pipe: every
//! chunk written locally becomes one binary message, and incoming binary
//! messages are concatenated into the read side. Text, ping and pong
//! messages are ignored; a close message ends the stream.
//!
//! - [`connect`] dials `ws://` or `wss://` (tokio-tungstenite, rustls)
//! - [`from_axum`] adapts a socket upgraded by the daemon's HTTP surface

mod bridge;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bridge::{bridge, Inbound};
use bytes::Bytes;
use exposer_transport::BoxConnection;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;
use url::Url;

/// WebSocket transport errors
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Map an `http(s)://` server URL onto its `ws(s)://` equivalent
pub fn http_to_ws_url(server: &str) -> Result<Url, WebSocketError> {
    let mut url = Url::parse(server).map_err(|e| WebSocketError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(WebSocketError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                other
            )))
        }
    };

    url.set_scheme(scheme)
        .map_err(|_| WebSocketError::InvalidUrl(server.to_string()))?;

    Ok(url)
}

/// Dial a WebSocket server and expose it as a byte stream
pub async fn connect(url: &Url) -> Result<BoxConnection, WebSocketError> {
    let (ws, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    debug!(url = %url, status = %response.status(), "WebSocket connected");

    Ok(bridge(ws, encode_tungstenite, decode_tungstenite))
}

/// Adapt a server-side upgraded socket
pub fn from_axum(socket: WebSocket) -> BoxConnection {
    bridge(socket, encode_axum, decode_axum)
}

fn encode_tungstenite(data: Bytes) -> WsMessage {
    WsMessage::Binary(data.to_vec())
}

fn decode_tungstenite(msg: WsMessage) -> Inbound {
    match msg {
        WsMessage::Binary(data) => Inbound::Data(Bytes::from(data)),
        WsMessage::Close(_) => Inbound::Close,
        _ => Inbound::Skip,
    }
}

fn encode_axum(data: Bytes) -> AxumMessage {
    AxumMessage::Binary(data)
}

fn decode_axum(msg: AxumMessage) -> Inbound {
    match msg {
        AxumMessage::Binary(data) => Inbound::Data(data),
        AxumMessage::Close(_) => Inbound::Close,
        _ => Inbound::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_url() {
        assert_eq!(
            http_to_ws_url("http://localhost:9000").unwrap().as_str(),
            "ws://localhost:9000/"
        );
        assert_eq!(
            http_to_ws_url("https://exposer.example.com/").unwrap().as_str(),
            "wss://exposer.example.com/"
        );
        assert_eq!(
            http_to_ws_url("ws://127.0.0.1:1").unwrap().scheme(),
            "ws"
        );
        assert!(http_to_ws_url("ftp://host").is_err());
        assert!(http_to_ws_url("not a url").is_err());
    }

    #[test]
    fn test_decode_skips_control_messages() {
        assert!(matches!(
            decode_tungstenite(WsMessage::Ping(vec![1])),
            Inbound::Skip
        ));
        assert!(matches!(
            decode_tungstenite(WsMessage::Close(None)),
            Inbound::Close
        ));
        assert!(matches!(
            decode_tungstenite(WsMessage::Binary(vec![1, 2])),
            Inbound::Data(d) if &d[..] == [1, 2]
        ));
    }
}
