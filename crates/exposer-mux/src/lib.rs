//! Stream multiplexing over a single connection
//!
//! A [`Session`] turns one physical byte stream into many independent
//! logical streams. Either side may open streams; the client side allocates
//! odd stream ids and the server side even ones so the two never collide.
//!
//! Each logical stream is handed to the user as a [`MuxStream`], the user
//! end of an in-memory pipe. A per-stream pump moves bytes between that pipe
//! and the shared connection:
//!
//! ```text
//!  user ⇄ MuxStream ⇄ pump ─ Frame ─→ writer task ─→ connection
//!                      ↑                                  │
//!                      └──── Bytes ←── reader task ←──────┘
//! ```
//!
//! Every stream has its own credit window. A sender stops once it has
//! `256 KiB` in flight and resumes as the receiver hands credit back with
//! `WindowUpdate` frames, so a stream nobody reads never holds up the reader
//! task or its siblings.

mod session;
mod stream;

pub use session::Session;
pub use stream::MuxStream;

use exposer_proto::MuxFrameError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Which end of the physical connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub(crate) fn first_stream_id(&self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    #[error("session closed")]
    Closed,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection error: {0}")]
    Io(Arc<io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] MuxFrameError),
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        MuxError::Io(Arc::new(err))
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Closed | MuxError::ConnectionClosed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, err)
            }
            other => io::Error::other(other),
        }
    }
}
