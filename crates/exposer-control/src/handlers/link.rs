//! Link sub-protocol
//!
//! The linking client listens locally and opens one stream per local
//! connection. The server bridges each stream to a new connection into the
//! named service.

use super::{details, expect_ok, refuse, unknown, HandshakeHandler, Transition};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::forward::Forwarder;
use async_trait::async_trait;
use exposer_mux::{Role, Session};
use exposer_proto::{Handshake, LinkRequest, Reply, CMD_LINK, CMD_LINK_REPLY};
use exposer_router::ServiceRegistry;
use exposer_transport::Listener;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bridges the client's streams into a registered service
pub struct LinkServer {
    registry: Arc<ServiceRegistry>,
    forwarder: Forwarder,
}

impl LinkServer {
    pub fn new(registry: Arc<ServiceRegistry>, forwarder: Forwarder) -> Self {
        Self {
            registry,
            forwarder,
        }
    }
}

#[async_trait]
impl HandshakeHandler for LinkServer {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_LINK {
            return Err(unknown(frame));
        }

        let request: LinkRequest = details(&frame)?;
        let Some(service) = self.registry.get(&request.name) else {
            let err = EngineError::ServiceNotFound(request.name);
            return Err(refuse(engine, CMD_LINK_REPLY, err).await);
        };

        engine.reply(CMD_LINK_REPLY, &Reply::ok()).await?;
        let session = engine.multiplex(Role::Server).await?;
        info!(service = %request.name, "Service linked");

        loop {
            let remote = session.accept().await?;
            let local = match service.open().await {
                Ok(local) => local,
                Err(e) => {
                    warn!(service = %request.name, "Failed to open service: {}", e);
                    drop(remote);
                    session.close();
                    return Err(e.into());
                }
            };

            let forwarder = self.forwarder;
            tokio::spawn(async move {
                forwarder.forward(remote, local).await;
            });
        }
    }
}

/// Opens one stream per local connection
pub struct LinkClient {
    listener: Arc<dyn Listener>,
    forwarder: Forwarder,
}

impl LinkClient {
    pub fn new(listener: Arc<dyn Listener>, forwarder: Forwarder) -> Self {
        Self {
            listener,
            forwarder,
        }
    }
}

#[async_trait]
impl HandshakeHandler for LinkClient {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_LINK_REPLY {
            return Err(unknown(frame));
        }
        expect_ok(&frame)?;

        let session = engine.multiplex(Role::Client).await?;
        info!(addr = %self.listener.local_addr(), "Link ready");
        Err(serve_listener(session, self.listener.clone(), self.forwarder).await)
    }
}

/// Bridge every connection accepted on `listener` to a new stream
///
/// Ends when either the session dies or the listener fails; both are then
/// closed and the first failure is returned.
pub(crate) async fn serve_listener(
    session: Session,
    listener: Arc<dyn Listener>,
    forwarder: Forwarder,
) -> EngineError {
    let (done_tx, mut done_rx) = mpsc::channel::<EngineError>(1);

    let watcher = tokio::spawn({
        let session = session.clone();
        let listener = listener.clone();
        let done_tx = done_tx.clone();
        async move {
            let reason = session.wait().await;
            let _ = done_tx.try_send(EngineError::Session(reason));
            listener.close();
        }
    });

    let acceptor = tokio::spawn({
        let session = session.clone();
        let listener = listener.clone();
        async move {
            let reason = loop {
                let local = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => break EngineError::from(e),
                };
                let remote = match session.open().await {
                    Ok(stream) => stream,
                    Err(e) => break EngineError::Session(e),
                };
                debug!(stream_id = remote.id(), "Bridging local connection");
                tokio::spawn(async move {
                    forwarder.forward(local, remote).await;
                });
            };
            let _ = done_tx.try_send(reason);
        }
    });

    let reason = done_rx.recv().await.unwrap_or(EngineError::Closed);
    session.close();
    listener.close();
    watcher.abort();
    acceptor.abort();
    reason
}
