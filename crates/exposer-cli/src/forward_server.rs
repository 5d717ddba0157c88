//! Standalone forward server
//!
//! Serves only the WebSocket control endpoint. Every connection requests a
//! forward directly: there is no key, no routing, no keepalive and no
//! service registry.

use anyhow::{Context, Result};
use exposer_control::Forwarder;
use exposer_transport::{ChannelListener, Listener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// A bound, not yet running forward server
pub struct ForwardRelay {
    listener: TcpListener,
    drain_delay: Duration,
}

impl ForwardRelay {
    pub async fn bind(addr: &str, drain_delay: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            listener,
            drain_delay,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read bound address")
    }

    /// Serve until the HTTP server fails
    pub async fn run(self) -> Result<()> {
        let (control_listener, control_sender) = ChannelListener::new("websocket");
        let control_listener: Arc<dyn Listener> = Arc::new(control_listener);

        let control = tokio::spawn(exposer_control::serve_forward(
            control_listener.clone(),
            Forwarder::new(self.drain_delay),
        ));

        let addr = self.local_addr()?;
        warn!("Forward server on {} dials any address for any client", addr);
        info!("Exposer forward server listening on {}", addr);
        let result = exposer_api::serve_control_only(self.listener, control_sender).await;

        control_listener.close();
        if let Err(e) = control.await {
            error!("Forward task failed: {}", e);
        }
        result.context("HTTP server failed")
    }
}
