//! Forward sub-protocol
//!
//! Like link, but the server dials an arbitrary network address instead of
//! a registered service.

use super::link::serve_listener;
use super::{details, expect_ok, refuse, unknown, HandshakeHandler, Transition};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::forward::Forwarder;
use async_trait::async_trait;
use exposer_mux::Role;
use exposer_proto::{ForwardRequest, Handshake, Reply, CMD_FORWARD, CMD_FORWARD_REPLY};
use exposer_transport::Listener;
use std::sync::Arc;
use tracing::{info, warn};

/// Bridges the client's streams to a network address
pub struct ForwardServer {
    forwarder: Forwarder,
}

impl ForwardServer {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl HandshakeHandler for ForwardServer {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_FORWARD {
            return Err(unknown(frame));
        }

        let ForwardRequest { network, address } = details(&frame)?;
        // probe once so that an unreachable target is refused up front
        match exposer_transport::dial(&network, &address).await {
            Ok(probe) => drop(probe),
            Err(e) => return Err(refuse(engine, CMD_FORWARD_REPLY, e.into()).await),
        }

        engine.reply(CMD_FORWARD_REPLY, &Reply::ok()).await?;
        let session = engine.multiplex(Role::Server).await?;
        info!(network = %network, address = %address, "Forward ready");

        loop {
            let remote = session.accept().await?;
            let network = network.clone();
            let address = address.clone();
            let forwarder = self.forwarder;
            tokio::spawn(async move {
                match exposer_transport::dial(&network, &address).await {
                    Ok(local) => {
                        forwarder.forward(remote, local).await;
                    }
                    Err(e) => warn!(address = %address, "Failed to dial forward target: {}", e),
                }
            });
        }
    }
}

/// Opens one stream per local connection
pub struct ForwardClient {
    listener: Arc<dyn Listener>,
    forwarder: Forwarder,
}

impl ForwardClient {
    pub fn new(listener: Arc<dyn Listener>, forwarder: Forwarder) -> Self {
        Self {
            listener,
            forwarder,
        }
    }
}

#[async_trait]
impl HandshakeHandler for ForwardClient {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_FORWARD_REPLY {
            return Err(unknown(frame));
        }
        expect_ok(&frame)?;

        let session = engine.multiplex(Role::Client).await?;
        info!(addr = %self.listener.local_addr(), "Forward listening");
        Err(serve_listener(session, self.listener.clone(), self.forwarder).await)
    }
}
