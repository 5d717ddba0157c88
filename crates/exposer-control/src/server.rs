//! Server side entry points

use crate::engine::Engine;
use crate::error::EngineError;
use crate::forward::Forwarder;
use crate::handlers::{AuthServer, ForwardServer, Handler, DEFAULT_TIMEOUT};
use exposer_router::ServiceRegistry;
use exposer_transport::{BoxConnection, Listener, TransportError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Decides whether a client key is accepted
pub type Authenticator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Everything the server side handlers share
pub struct ServerContext {
    pub registry: Arc<ServiceRegistry>,
    authenticator: Authenticator,
    pub keepalive_timeout: Duration,
    pub forwarder: Forwarder,
}

impl ServerContext {
    pub fn new(registry: Arc<ServiceRegistry>, authenticator: Authenticator) -> Self {
        Self {
            registry,
            authenticator,
            keepalive_timeout: DEFAULT_TIMEOUT,
            forwarder: Forwarder::default(),
        }
    }

    /// Accept exactly `key`
    pub fn with_key(registry: Arc<ServiceRegistry>, key: impl Into<String>) -> Self {
        let key: String = key.into();
        Self::new(registry, Arc::new(move |candidate| candidate == key))
    }

    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_forwarder(mut self, forwarder: Forwarder) -> Self {
        self.forwarder = forwarder;
        self
    }

    pub fn authenticate(&self, key: &str) -> bool {
        (self.authenticator)(key)
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("services", &self.registry.len())
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("forwarder", &self.forwarder)
            .finish()
    }
}

/// Drive one client connection until its session dies
///
/// Returns what ended the session, e.g. a keepalive timeout or the peer
/// going away. Refused routes on the way do not count. Before the session
/// exists this is the engine's own shutdown reason.
pub async fn serve_connection(conn: BoxConnection, ctx: Arc<ServerContext>) -> EngineError {
    drive(Engine::new(conn, Handler::AuthServer(AuthServer::new(ctx)))).await
}

/// Drive one connection that requests a forward directly, with no auth
/// and no routing
pub async fn serve_forward_connection(conn: BoxConnection, forwarder: Forwarder) -> EngineError {
    drive(Engine::new(conn, Handler::ForwardServer(ForwardServer::new(forwarder)))).await
}

async fn drive(engine: Engine) -> EngineError {
    engine.run().await;

    engine.shutdown(EngineError::ConnectionClosed);
    engine.close();
    let reason = engine.wait().await;
    engine.session_error().unwrap_or(reason)
}

/// Accept control connections from `listener` until it is closed
pub async fn serve(listener: Arc<dyn Listener>, ctx: Arc<ServerContext>) -> Result<(), TransportError> {
    accept_loop(listener, move |conn| serve_connection(conn, ctx.clone())).await
}

/// Accept forward-only connections from `listener` until it is closed
pub async fn serve_forward(
    listener: Arc<dyn Listener>,
    forwarder: Forwarder,
) -> Result<(), TransportError> {
    accept_loop(listener, move |conn| serve_forward_connection(conn, forwarder)).await
}

async fn accept_loop<F, Fut>(listener: Arc<dyn Listener>, serve_one: F) -> Result<(), TransportError>
where
    F: Fn(BoxConnection) -> Fut,
    Fut: Future<Output = EngineError> + Send + 'static,
{
    info!(addr = %listener.local_addr(), "Control channel listening");

    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(TransportError::ListenerClosed) => {
                info!("Control channel listener closed");
                return Ok(());
            }
            Err(e) => {
                error!("Failed to accept control connection: {}", e);
                return Err(e);
            }
        };

        let connection = serve_one(conn);
        tokio::spawn(async move {
            let reason = connection.await;
            debug!(reason = %reason, "Client disconnected");
        });
    }
}
