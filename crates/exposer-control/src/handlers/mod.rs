//! Handshake handlers
//!
//! One handler per protocol step. Server handlers answer requests, client
//! handlers react to replies. A handler returns [`Transition::Switch`] to
//! install its successor for the next frame.

mod auth;
mod forward;
mod keepalive;
mod expose;
mod link;
mod route;

pub use auth::{AuthClient, AuthServer};
pub use expose::{ExposeClient, ExposeServer};
pub use forward::{ForwardClient, ForwardServer};
pub use keepalive::{KeepaliveClient, KeepaliveServer, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};
pub use link::{LinkClient, LinkServer};
pub use route::{RouteClient, RouteServer};

use crate::engine::Engine;
use crate::error::EngineError;
use async_trait::async_trait;
use exposer_proto::{Handshake, Reply};
use serde::de::DeserializeOwned;

/// What the engine does after a frame was handled
pub enum Transition {
    /// Keep the current handler
    Continue,
    /// Replace the current handler
    Switch(Handler),
}

/// Reacts to one handshake frame
#[async_trait]
pub trait HandshakeHandler: Send {
    async fn handle(&mut self, engine: &Engine, frame: Handshake)
        -> Result<Transition, EngineError>;

    /// Called once this handler was switched in, before it sees a frame
    fn installed(&mut self, _engine: &Engine) {}
}

/// Every handler an engine can run
pub enum Handler {
    AuthServer(AuthServer),
    AuthClient(AuthClient),
    RouteServer(RouteServer),
    RouteClient(RouteClient),
    KeepaliveServer(KeepaliveServer),
    KeepaliveClient(KeepaliveClient),
    ExposeServer(ExposeServer),
    ExposeClient(ExposeClient),
    LinkServer(LinkServer),
    LinkClient(LinkClient),
    ForwardServer(ForwardServer),
    ForwardClient(ForwardClient),
    Custom(Box<dyn HandshakeHandler>),
}

impl Handler {
    pub fn custom(handler: impl HandshakeHandler + 'static) -> Self {
        Handler::Custom(Box::new(handler))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Handler::AuthServer(_) => "auth-server",
            Handler::AuthClient(_) => "auth-client",
            Handler::RouteServer(_) => "route-server",
            Handler::RouteClient(_) => "route-client",
            Handler::KeepaliveServer(_) => "keepalive-server",
            Handler::KeepaliveClient(_) => "keepalive-client",
            Handler::ExposeServer(_) => "expose-server",
            Handler::ExposeClient(_) => "expose-client",
            Handler::LinkServer(_) => "link-server",
            Handler::LinkClient(_) => "link-client",
            Handler::ForwardServer(_) => "forward-server",
            Handler::ForwardClient(_) => "forward-client",
            Handler::Custom(_) => "custom",
        }
    }
}

#[async_trait]
impl HandshakeHandler for Handler {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        match self {
            Handler::AuthServer(h) => h.handle(engine, frame).await,
            Handler::AuthClient(h) => h.handle(engine, frame).await,
            Handler::RouteServer(h) => h.handle(engine, frame).await,
            Handler::RouteClient(h) => h.handle(engine, frame).await,
            Handler::KeepaliveServer(h) => h.handle(engine, frame).await,
            Handler::KeepaliveClient(h) => h.handle(engine, frame).await,
            Handler::ExposeServer(h) => h.handle(engine, frame).await,
            Handler::ExposeClient(h) => h.handle(engine, frame).await,
            Handler::LinkServer(h) => h.handle(engine, frame).await,
            Handler::LinkClient(h) => h.handle(engine, frame).await,
            Handler::ForwardServer(h) => h.handle(engine, frame).await,
            Handler::ForwardClient(h) => h.handle(engine, frame).await,
            Handler::Custom(h) => h.handle(engine, frame).await,
        }
    }

    fn installed(&mut self, engine: &Engine) {
        match self {
            Handler::KeepaliveServer(h) => h.installed(engine),
            Handler::KeepaliveClient(h) => h.installed(engine),
            Handler::Custom(h) => h.installed(engine),
            _ => {}
        }
    }
}

/// Decode the details of `frame`
pub(crate) fn details<T: DeserializeOwned>(frame: &Handshake) -> Result<T, EngineError> {
    frame
        .details()
        .map_err(|e| EngineError::InvalidDetails {
            command: frame.command.clone(),
            reason: e.to_string(),
        })
}

/// Decode a reply frame and turn a not-OK reply into an error
pub(crate) fn expect_ok(frame: &Handshake) -> Result<(), EngineError> {
    details::<Reply>(frame)?
        .into_result()
        .map_err(EngineError::Rejected)
}

pub(crate) fn unknown(frame: Handshake) -> EngineError {
    EngineError::UnknownCommand(frame.command)
}

/// Answer with a not-OK reply carrying `err`, then hand `err` back
///
/// A failure to send the reply is ignored; the handler fails either way.
pub(crate) async fn refuse(engine: &Engine, command: &str, err: EngineError) -> EngineError {
    let _ = engine.reply(command, &Reply::error(&err)).await;
    err
}
