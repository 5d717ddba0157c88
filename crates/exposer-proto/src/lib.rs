//! Exposer Protocol Definitions
//!
//! This crate defines the control-channel command catalogue, the handshake
//! frame codec and the framing used by the stream multiplexer.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{CodecError, HandshakeCodec};
pub use messages::*;
pub use mux::{Frame, FrameFlags, FrameType, MuxFrameError, StreamId};

/// Maximum multiplexer frame payload (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum size of a single handshake document (1MB)
pub const MAX_HANDSHAKE_SIZE: usize = 1024 * 1024;
