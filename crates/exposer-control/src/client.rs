//! Client side entry points

use crate::engine::Engine;
use crate::error::EngineError;
use crate::forward::Forwarder;
use crate::handlers::{
    AuthClient, ExposeClient, ForwardClient, Handler, KeepaliveClient, LinkClient,
};
use exposer_proto::{
    Attribute, AuthRequest, ExposeRequest, ForwardRequest, LinkRequest, RouteType, CMD_AUTH,
    CMD_EXPOSE, CMD_FORWARD, CMD_LINK, CMD_PING,
};
use exposer_transport::{BoxConnection, Dialer, Listener};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One sub-connection the client opens after authenticating
///
/// Carries the route type to request, the handler to run once the route is
/// accepted, and the command that handler starts with.
pub struct NextRoute {
    pub(crate) route_type: String,
    pub(crate) handler: Handler,
    pub(crate) command: String,
    pub(crate) details: Value,
}

impl NextRoute {
    /// A route of arbitrary type
    ///
    /// # Panics
    ///
    /// Panics if `details` does not serialize to JSON.
    pub fn new<T: Serialize + ?Sized>(
        route_type: impl Into<String>,
        handler: Handler,
        command: impl Into<String>,
        details: &T,
    ) -> Self {
        let details = match serde_json::to_value(details) {
            Ok(value) => value,
            Err(e) => panic!("route details must serialize to JSON: {}", e),
        };
        Self {
            route_type: route_type.into(),
            handler,
            command: command.into(),
            details,
        }
    }

    pub fn keepalive(client: KeepaliveClient) -> Self {
        Self::new(
            RouteType::Keepalive.as_str(),
            Handler::KeepaliveClient(client),
            CMD_PING,
            &(),
        )
    }

    /// Expose a local backend reached through `dialer` as `name`
    pub fn expose(
        name: impl Into<String>,
        attr: Attribute,
        dialer: Dialer,
        forwarder: Forwarder,
    ) -> Self {
        let request = ExposeRequest {
            name: name.into(),
            attr,
        };
        Self::new(
            RouteType::Expose.as_str(),
            Handler::ExposeClient(ExposeClient::new(dialer, forwarder)),
            CMD_EXPOSE,
            &request,
        )
    }

    /// Serve the service `name` on `listener`
    pub fn link(name: impl Into<String>, listener: Arc<dyn Listener>, forwarder: Forwarder) -> Self {
        let request = LinkRequest { name: name.into() };
        Self::new(
            RouteType::Link.as_str(),
            Handler::LinkClient(LinkClient::new(listener, forwarder)),
            CMD_LINK,
            &request,
        )
    }

    /// Serve `address`, as dialed by the server, on `listener`
    pub fn forward(
        network: impl Into<String>,
        address: impl Into<String>,
        listener: Arc<dyn Listener>,
        forwarder: Forwarder,
    ) -> Self {
        let request = ForwardRequest {
            network: network.into(),
            address: address.into(),
        };
        Self::new(
            RouteType::Forward.as_str(),
            Handler::ForwardClient(ForwardClient::new(listener, forwarder)),
            CMD_FORWARD,
            &request,
        )
    }

    pub fn route_type(&self) -> &str {
        &self.route_type
    }
}

/// Authenticate over `conn` and open every route in `routes`
///
/// The returned engine is the root of the client; wait on it to learn why
/// the client stopped. A connection that fails before the handshake
/// completes shuts the engine down with [`EngineError::ConnectionClosed`].
pub fn start_client(conn: BoxConnection, key: impl Into<String>, routes: Vec<NextRoute>) -> Engine {
    let engine = Engine::new(conn, Handler::AuthClient(AuthClient::new(routes)));
    let request = AuthRequest { key: key.into() };

    let runner = engine.clone();
    tokio::spawn(async move {
        runner.request(CMD_AUTH, &request).await;
        // no-op unless the request failed without shutting the engine down
        runner.shutdown(EngineError::ConnectionClosed);
    });

    engine
}

/// Request a forward directly over `conn`, skipping auth and routing
///
/// Pairs with [`serve_forward`](crate::serve_forward). There is no keepalive
/// on such a connection.
pub fn start_forward(
    conn: BoxConnection,
    network: impl Into<String>,
    address: impl Into<String>,
    listener: Arc<dyn Listener>,
    forwarder: Forwarder,
) -> Engine {
    let engine = Engine::new(
        conn,
        Handler::ForwardClient(ForwardClient::new(listener, forwarder)),
    );
    let request = ForwardRequest {
        network: network.into(),
        address: address.into(),
    };

    let runner = engine.clone();
    tokio::spawn(async move {
        runner.request(CMD_FORWARD, &request).await;
        runner.shutdown(EngineError::ConnectionClosed);
    });

    engine
}
