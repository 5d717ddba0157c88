//! TCP listener and dialers

use crate::{BoxConnection, Dialer, Listener, TransportError, TransportResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// TCP listener that can be closed from another task
pub struct TcpConnListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl std::fmt::Debug for TcpConnListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl TcpConnListener {
    pub async fn bind(address: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::BindError {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "TCP listener bound");

        Ok(Self {
            listener,
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for TcpConnListener {
    async fn accept(&self) -> TransportResult<BoxConnection> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
            res = self.listener.accept() => {
                let (stream, peer) = res?;
                let _ = stream.set_nodelay(true);
                debug!(peer = %peer, "Accepted TCP connection");
                Ok(Box::new(stream) as BoxConnection)
            }
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(addr = %self.local_addr, "TCP listener closed");
            self.closed.cancel();
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }
}

/// Dial `address` over `network` (`tcp`, `tcp4` or `tcp6`)
pub async fn dial(network: &str, address: &str) -> TransportResult<BoxConnection> {
    let want_v4 = match network {
        "tcp" => None,
        "tcp4" => Some(true),
        "tcp6" => Some(false),
        other => return Err(TransportError::UnsupportedNetwork(other.to_string())),
    };

    let mut last_err = None;
    for addr in lookup_host(address).await? {
        if want_v4.is_some_and(|v4| addr.is_ipv4() != v4) {
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(Box::new(stream));
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) => TransportError::IoError(e),
        None => TransportError::IoError(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no {} address found for {}", network, address),
        )),
    })
}

/// Dialer connecting to a fixed TCP address
pub fn tcp_dialer(address: impl Into<String>) -> Dialer {
    let address: String = address.into();
    Arc::new(move || {
        let address = address.clone();
        async move { dial("tcp", &address).await.map_err(std::io::Error::from) }.boxed()
    })
}
