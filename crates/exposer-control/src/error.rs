//! Engine errors

use exposer_mux::MuxError;
use exposer_proto::{CodecError, UnsupportedRoute};
use exposer_router::{RegistryError, ServiceError};
use exposer_transport::TransportError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Why an engine shut down
///
/// Cloneable so that the one recorded shutdown reason can be handed to every
/// waiter and to parent engines.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed handshake: {0}")]
    Codec(String),

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("invalid details for {command:?}: {reason}")]
    InvalidDetails { command: String, reason: String },

    #[error("forbidden key")]
    ForbiddenKey,

    #[error(transparent)]
    UnsupportedRoute(#[from] UnsupportedRoute),

    #[error("keepalive: timeout")]
    KeepaliveTimeout,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    /// Error text carried by a not-OK reply from the peer
    #[error("{0}")]
    Rejected(String),

    #[error("session: {0}")]
    Session(#[from] MuxError),

    #[error("service error: {0}")]
    Service(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("engine closed")]
    Closed,
}

impl EngineError {
    /// Whether this error means the whole multiplexed session is unusable
    ///
    /// Refusals and per-stream failures stay local to their sub-connection.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, EngineError::KeepaliveTimeout | EngineError::Session(_))
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

impl From<CodecError> for EngineError {
    fn from(err: CodecError) -> Self {
        EngineError::Codec(err.to_string())
    }
}

impl From<ServiceError> for EngineError {
    fn from(err: ServiceError) -> Self {
        EngineError::Service(err.to_string())
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Transport(err.to_string())
    }
}
