//! Library side of the `exposer` binary

pub mod client;
pub mod config;
pub mod daemon;
pub mod forward_server;
