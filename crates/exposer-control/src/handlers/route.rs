//! Route selection, the first step on every sub-connection

use super::{
    details, expect_ok, refuse, unknown, ExposeServer, ForwardServer, Handler, HandshakeHandler,
    KeepaliveServer, LinkServer, Transition,
};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::server::ServerContext;
use async_trait::async_trait;
use exposer_proto::{Handshake, Reply, RouteRequest, RouteType, CMD_ROUTE, CMD_ROUTE_REPLY};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Picks the sub-protocol handler for a sub-connection
pub struct RouteServer {
    ctx: Arc<ServerContext>,
}

impl RouteServer {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    fn handler_for(&self, route: RouteType) -> Handler {
        let ctx = &self.ctx;
        match route {
            RouteType::Keepalive => {
                Handler::KeepaliveServer(KeepaliveServer::new(ctx.keepalive_timeout))
            }
            RouteType::Expose => Handler::ExposeServer(ExposeServer::new(ctx.registry.clone())),
            RouteType::Link => {
                Handler::LinkServer(LinkServer::new(ctx.registry.clone(), ctx.forwarder))
            }
            RouteType::Forward => Handler::ForwardServer(ForwardServer::new(ctx.forwarder)),
        }
    }
}

#[async_trait]
impl HandshakeHandler for RouteServer {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_ROUTE {
            return Err(unknown(frame));
        }

        let request: RouteRequest = details(&frame)?;
        let route = match request.parse() {
            Ok(route) => route,
            Err(e) => return Err(refuse(engine, CMD_ROUTE_REPLY, e.into()).await),
        };

        engine.reply(CMD_ROUTE_REPLY, &Reply::ok()).await?;
        debug!(route = %route, "Route selected");
        Ok(Transition::Switch(self.handler_for(route)))
    }
}

/// Waits for the route reply, then starts the chosen sub-protocol
///
/// The successor handler is installed in the same step as its opening
/// command is sent.
pub struct RouteClient {
    next: Option<Box<Handler>>,
    command: String,
    details: Value,
}

impl RouteClient {
    pub fn new(next: Handler, command: impl Into<String>, details: Value) -> Self {
        Self {
            next: Some(Box::new(next)),
            command: command.into(),
            details,
        }
    }
}

#[async_trait]
impl HandshakeHandler for RouteClient {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_ROUTE_REPLY {
            return Err(unknown(frame));
        }
        expect_ok(&frame)?;

        let next = self.next.take().ok_or(EngineError::Closed)?;
        engine.reply(&self.command, &self.details).await?;
        Ok(Transition::Switch(*next))
    }
}
