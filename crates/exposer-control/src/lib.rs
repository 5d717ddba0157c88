//! Control-channel protocol engine for exposer
//!
//! Every connection (physical, or a logical stream of a multiplexed session)
//! is driven by an [`Engine`]. The engine exchanges JSON handshake frames
//! and hands each one to its current [`Handler`] until the handler promotes
//! the connection, either into a multiplexed session or into a raw byte
//! pipe.
//!
//! ```text
//! connection ─→ Engine(AuthServer) ── auth ok ──→ Session
//!                                                   │ accept
//!                      ┌────────────────────────────┼──────────────┐
//!                      ↓                            ↓              ↓
//!              Engine(RouteServer)          Engine(RouteServer)   ...
//!                      │ route: keepalive           │ route: expose
//!                      ↓                            ↓
//!              KeepaliveServer              ExposeServer ─→ ServiceRegistry
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod forward;
pub mod handlers;
pub mod server;

pub use client::{start_client, start_forward, NextRoute};
pub use engine::Engine;
pub use error::EngineError;
pub use forward::Forwarder;
pub use handlers::{
    AuthClient, AuthServer, ExposeClient, ExposeServer, ForwardClient, ForwardServer, Handler,
    HandshakeHandler, KeepaliveClient, KeepaliveServer, LinkClient, LinkServer, RouteClient,
    RouteServer, Transition,
};
pub use server::{
    serve, serve_connection, serve_forward, serve_forward_connection, Authenticator, ServerContext,
};
