//! Listeners fed through a channel
//!
//! `ChannelListener` is the accept side of a queue that some other component
//! fills: the WebSocket upgrade endpoint in the daemon, or the in-memory
//! dialer returned by [`pipe`].

use crate::{BoxConnection, Dialer, Listener, TransportError, TransportResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const ACCEPT_BACKLOG: usize = 64;
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Accept side of a connection queue
pub struct ChannelListener {
    rx: Mutex<mpsc::Receiver<BoxConnection>>,
    closed: CancellationToken,
    name: String,
}

/// Producer side of a connection queue
#[derive(Clone)]
pub struct ConnectionSender {
    tx: mpsc::Sender<BoxConnection>,
    closed: CancellationToken,
}

impl ChannelListener {
    /// Create a listener and the handle used to feed it
    pub fn new(name: impl Into<String>) -> (Self, ConnectionSender) {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let closed = CancellationToken::new();

        let listener = Self {
            rx: Mutex::new(rx),
            closed: closed.clone(),
            name: name.into(),
        };

        (listener, ConnectionSender { tx, closed })
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&self) -> TransportResult<BoxConnection> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }

        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::ListenerClosed),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
            conn = rx.recv() => conn.ok_or(TransportError::ListenerClosed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn local_addr(&self) -> String {
        self.name.clone()
    }
}

impl ConnectionSender {
    /// Queue a connection for the listener
    pub async fn send(&self, conn: BoxConnection) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }

        self.tx
            .send(conn)
            .await
            .map_err(|_| TransportError::ListenerClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// Dials the paired [`ChannelListener`] through in-memory pipes
#[derive(Clone)]
pub struct PipeDialer {
    sender: ConnectionSender,
}

impl PipeDialer {
    pub async fn dial(&self) -> io::Result<BoxConnection> {
        let (near, far) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        self.sender.send(Box::new(far)).await?;
        Ok(Box::new(near))
    }

    pub fn into_dialer(self) -> Dialer {
        Arc::new(move || {
            let this = self.clone();
            async move { this.dial().await }.boxed()
        })
    }
}

/// In-memory listener and matching dialer
pub fn pipe() -> (ChannelListener, PipeDialer) {
    let (listener, sender) = ChannelListener::new("pipe");
    (listener, PipeDialer { sender })
}
