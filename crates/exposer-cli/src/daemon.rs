//! The exposer server
//!
//! One TCP port carries both the HTTP surface and the control channel:
//! WebSocket upgrades on `/` are queued to a channel listener, and every
//! connection accepted from it runs an auth server engine.

use anyhow::{Context, Result};
use exposer_api::ApiServer;
use exposer_control::{Forwarder, ServerContext};
use exposer_router::ServiceRegistry;
use exposer_transport::{ChannelListener, Listener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const DEFAULT_ADDR: &str = "0.0.0.0:9000";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub addr: String,
    pub key: String,
    pub keepalive_timeout: Duration,
    pub drain_delay: Duration,
}

impl DaemonConfig {
    pub fn new(addr: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            key: key.into(),
            keepalive_timeout: exposer_control::handlers::DEFAULT_TIMEOUT,
            drain_delay: exposer_control::forward::DEFAULT_DRAIN_DELAY,
        }
    }
}

/// A bound, not yet running daemon
pub struct Daemon {
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    config: DaemonConfig,
}

impl Daemon {
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.addr))?;

        Ok(Self {
            listener,
            registry: Arc::new(ServiceRegistry::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read bound address")
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    /// Serve until the HTTP server fails
    pub async fn run(self) -> Result<()> {
        let (control_listener, control_sender) = ChannelListener::new("websocket");
        let control_listener: Arc<dyn Listener> = Arc::new(control_listener);

        let ctx = ServerContext::with_key(self.registry.clone(), self.config.key.clone())
            .with_keepalive_timeout(self.config.keepalive_timeout)
            .with_forwarder(Forwarder::new(self.config.drain_delay));

        let control = tokio::spawn(exposer_control::serve(
            control_listener.clone(),
            Arc::new(ctx),
        ));

        info!("Exposer daemon listening on {}", self.local_addr()?);
        let api = ApiServer::new(self.registry, self.config.key, control_sender);
        let result = api.start(self.listener).await;

        control_listener.close();
        if let Err(e) = control.await {
            error!("Control channel task failed: {}", e);
        }
        result.context("HTTP server failed")
    }
}
