//! Authentication, the first step on every physical connection

use super::{
    details, expect_ok, refuse, unknown, Handler, HandshakeHandler, RouteClient, RouteServer,
    Transition,
};
use crate::client::NextRoute;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::server::ServerContext;
use async_trait::async_trait;
use exposer_mux::Role;
use exposer_proto::{AuthRequest, Handshake, Reply, RouteRequest, CMD_AUTH, CMD_AUTH_REPLY, CMD_ROUTE};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Checks the client key, then accepts routed sub-connections
pub struct AuthServer {
    ctx: Arc<ServerContext>,
}

impl AuthServer {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl HandshakeHandler for AuthServer {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_AUTH {
            return Err(unknown(frame));
        }

        let request: AuthRequest = details(&frame)?;
        if !self.ctx.authenticate(&request.key) {
            warn!("Rejected client with invalid key");
            return Err(refuse(engine, CMD_AUTH_REPLY, EngineError::ForbiddenKey).await);
        }

        engine.reply(CMD_AUTH_REPLY, &Reply::ok()).await?;
        let session = engine.multiplex(Role::Server).await?;
        info!("Client authenticated");

        loop {
            let stream = session.accept().await?;
            debug!(stream_id = stream.id(), "Routing new sub-connection");

            let child = Engine::with_parent(
                engine,
                Box::new(stream),
                Handler::RouteServer(RouteServer::new(self.ctx.clone())),
            );
            tokio::spawn(async move { child.run().await });
        }
    }
}

/// Authenticates, then opens one routed sub-connection per requested route
pub struct AuthClient {
    routes: Vec<NextRoute>,
}

impl AuthClient {
    pub fn new(routes: Vec<NextRoute>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl HandshakeHandler for AuthClient {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command != CMD_AUTH_REPLY {
            return Err(unknown(frame));
        }

        expect_ok(&frame)?;
        let session = engine.multiplex(Role::Client).await?;
        info!(routes = self.routes.len(), "Authenticated");

        for route in std::mem::take(&mut self.routes) {
            let stream = session.open().await?;
            debug!(stream_id = stream.id(), route = route.route_type(), "Opening route");
            let request = RouteRequest::new(route.route_type);
            let child = Engine::with_parent(
                engine,
                Box::new(stream),
                Handler::RouteClient(RouteClient::new(route.handler, route.command, route.details)),
            );
            tokio::spawn(async move { child.request(CMD_ROUTE, &request).await });
        }

        Err(EngineError::Session(session.wait().await))
    }
}
