//! Transport abstraction layer for exposer connections
//!
//! The protocol engine only needs a duplex byte stream. Anything that
//! implements `AsyncRead + AsyncWrite` (a TCP socket, an upgraded WebSocket
//! bridge, an in-memory pipe) can carry the control channel.
//!
//! ```text
//!   exposer-control / exposer-mux
//!               │ BoxConnection, Listener, Dialer
//!               ↓
//!   exposer-transport (this crate)
//!     TcpConnListener  ChannelListener  pipe()
//!               ↑
//!   exposer-transport-websocket
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

mod channel;
mod tcp;

pub use channel::{pipe, ChannelListener, ConnectionSender, PipeDialer};
pub use tcp::{dial, tcp_dialer, TcpConnListener};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Unsupported network: {0:?}")]
    UnsupportedNetwork(String),

    #[error("Bind error on {address}: {reason}")]
    BindError { address: String, reason: String },
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::IoError(e) => e,
            TransportError::ListenerClosed => io::Error::new(io::ErrorKind::NotConnected, err),
            other => io::Error::other(other),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A reliable, ordered, bidirectional byte stream
///
/// Closing a connection is `shutdown` followed by dropping it.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection
pub type BoxConnection = Box<dyn Connection>;

/// Produces a fresh outbound connection each time it is called
pub type Dialer = Arc<dyn Fn() -> BoxFuture<'static, io::Result<BoxConnection>> + Send + Sync>;

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection
    ///
    /// Fails with `ListenerClosed` once `close` has been called, including
    /// for an accept that was already pending.
    async fn accept(&self) -> TransportResult<BoxConnection>;

    /// Stop accepting. Idempotent.
    fn close(&self);

    /// Human readable local address
    fn local_addr(&self) -> String;
}

#[cfg(test)]
mod tests;
