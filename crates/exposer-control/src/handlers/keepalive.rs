//! Keepalive sub-protocol
//!
//! The client sends `ping` every interval after each `pong`. Each side runs
//! a watchdog from the moment its handler is installed; it emits
//! `event:timeout` into its own engine when nothing arrived from the peer
//! within the timeout.

use super::{unknown, HandshakeHandler, Transition};
use crate::engine::Engine;
use crate::error::EngineError;
use async_trait::async_trait;
use exposer_proto::{Handshake, CMD_PING, CMD_PONG, EVENT_TIMEOUT};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time of the last frame received from the peer
#[derive(Clone)]
struct LastSeen(Arc<Mutex<Instant>>);

impl LastSeen {
    fn now() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }
}

/// Check every `timeout` whether the peer went quiet for longer than that
fn spawn_watchdog(engine: Engine, last_seen: LastSeen, timeout: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + timeout, timeout);
        loop {
            tokio::select! {
                _ = engine.wait() => return,
                _ = ticker.tick() => {}
            }

            if last_seen.elapsed() > timeout {
                warn!(timeout = ?timeout, "Keepalive timed out");
                let _ = engine.emit(EVENT_TIMEOUT, &());
                return;
            }
        }
    });
}

/// Answers pings
pub struct KeepaliveServer {
    timeout: Duration,
    last_ping: LastSeen,
    watching: bool,
}

impl KeepaliveServer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_ping: LastSeen::now(),
            watching: false,
        }
    }
}

impl KeepaliveServer {
    fn watch(&mut self, engine: &Engine) {
        if !self.watching {
            self.watching = true;
            self.last_ping.touch();
            spawn_watchdog(engine.clone(), self.last_ping.clone(), self.timeout);
        }
    }
}

impl Default for KeepaliveServer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl HandshakeHandler for KeepaliveServer {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        self.watch(engine);

        match frame.command.as_str() {
            CMD_PING => {
                self.last_ping.touch();
                engine.reply(CMD_PONG, &()).await?;
                Ok(Transition::Continue)
            }
            EVENT_TIMEOUT => Err(EngineError::KeepaliveTimeout),
            _ => Err(unknown(frame)),
        }
    }

    fn installed(&mut self, engine: &Engine) {
        self.watch(engine);
    }
}

/// Sends pings and expects pongs
pub struct KeepaliveClient {
    interval: Duration,
    timeout: Duration,
    last_pong: LastSeen,
    watching: bool,
}

impl KeepaliveClient {
    /// # Panics
    ///
    /// Panics unless `interval` is shorter than `timeout`.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        assert!(
            interval < timeout,
            "keepalive interval ({:?}) must be shorter than timeout ({:?})",
            interval,
            timeout
        );
        Self {
            interval,
            timeout,
            last_pong: LastSeen::now(),
            watching: false,
        }
    }
}

impl KeepaliveClient {
    /// Start the pong watchdog, counting from now
    fn watch(&mut self, engine: &Engine) {
        if !self.watching {
            self.watching = true;
            self.last_pong.touch();
            spawn_watchdog(engine.clone(), self.last_pong.clone(), self.timeout);
        }
    }
}

impl Default for KeepaliveClient {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl HandshakeHandler for KeepaliveClient {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        self.watch(engine);

        match frame.command.as_str() {
            CMD_PONG => {
                self.last_pong.touch();
                debug!("Keepalive pong");
                tokio::time::sleep(self.interval).await;
                engine.reply(CMD_PING, &()).await?;
                Ok(Transition::Continue)
            }
            EVENT_TIMEOUT => Err(EngineError::KeepaliveTimeout),
            _ => Err(unknown(frame)),
        }
    }

    fn installed(&mut self, engine: &Engine) {
        self.watch(engine);
    }
}
