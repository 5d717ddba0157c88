//! Expose sub-protocol
//!
//! The exposing client turns its sub-connection into a session. The server
//! registers that session as a named service and opens one stream on it
//! per consumer; the client accepts those streams and dials its backend.

use super::{details, expect_ok, refuse, unknown, HandshakeHandler, Transition};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::forward::Forwarder;
use async_trait::async_trait;
use exposer_mux::Role;
use exposer_proto::{ExposeRequest, Handshake, Reply, CMD_EXPOSE, CMD_EXPOSE_REPLY};
use exposer_router::{CloseFn, OpenFn, ServiceRegistry};
use exposer_transport::{BoxConnection, Dialer};
use futures::FutureExt;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Removes the service when the expose handler ends, however it ends
struct Unregister {
    registry: Arc<ServiceRegistry>,
    name: String,
}

impl Drop for Unregister {
    fn drop(&mut self) {
        if self.registry.remove(&self.name) {
            info!(service = %self.name, "Service unexposed");
        }
    }
}

/// Registers the client's session as a service
pub struct ExposeServer {
    registry: Arc<ServiceRegistry>,
}

impl ExposeServer {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HandshakeHandler for ExposeServer {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_EXPOSE {
            return Err(unknown(frame));
        }

        let request: ExposeRequest = details(&frame)?;
        let service = match self.registry.prepare(&request.name) {
            Ok(service) => service,
            Err(e) => return Err(refuse(engine, CMD_EXPOSE_REPLY, e.into()).await),
        };
        let _unregister = Unregister {
            registry: self.registry.clone(),
            name: request.name.clone(),
        };

        engine.reply(CMD_EXPOSE_REPLY, &Reply::ok()).await?;
        let session = engine.multiplex(Role::Server).await?;

        let opener = session.clone();
        let open: OpenFn = Arc::new(move || {
            let session = opener.clone();
            async move {
                let stream = session.open().await.map_err(io::Error::from)?;
                Ok::<_, io::Error>(Box::new(stream) as BoxConnection)
            }
            .boxed()
        });
        let closer = session.clone();
        let close: CloseFn = Arc::new(move || {
            closer.close();
            Ok::<(), io::Error>(())
        });

        if !self.registry.add(&request.name, open, close) {
            session.close();
            return Err(EngineError::ServiceNotFound(request.name));
        }
        let attr = request.attr;
        let _ = service.attribute().update(|current| {
            *current = attr;
            Ok::<_, Infallible>(())
        });
        info!(service = %request.name, "Service exposed");

        let reason = session.wait().await;
        debug!(service = %request.name, reason = %reason, "Expose session ended");
        Err(EngineError::Session(reason))
    }
}

/// Serves streams opened by the server from a local backend
pub struct ExposeClient {
    dialer: Dialer,
    forwarder: Forwarder,
}

impl ExposeClient {
    pub fn new(dialer: Dialer, forwarder: Forwarder) -> Self {
        Self { dialer, forwarder }
    }
}

#[async_trait]
impl HandshakeHandler for ExposeClient {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_EXPOSE_REPLY {
            return Err(unknown(frame));
        }
        expect_ok(&frame)?;

        let session = engine.multiplex(Role::Client).await?;
        info!("Service exposed");

        loop {
            let remote = session.accept().await?;
            let dialer = self.dialer.clone();
            let forwarder = self.forwarder;
            tokio::spawn(async move {
                match dialer().await {
                    Ok(local) => {
                        forwarder.forward(remote, local).await;
                    }
                    Err(e) => warn!(stream_id = remote.id(), "Failed to dial backend: {}", e),
                }
            });
        }
    }
}
