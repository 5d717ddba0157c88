//! Handshake engine
//!
//! An engine owns one connection while it is still speaking the handshake
//! protocol. Inbound frames and locally emitted events are serialized into a
//! single stream of dispatches to the current handler. A handler may switch
//! to a successor handler or promote the connection. Promotion ends the
//! engine's read loop and hands the connection (plus any bytes already read
//! past the last frame) to a mux session or to a raw byte pipe.

use crate::error::EngineError;
use crate::forward::Forwarder;
use crate::handlers::{Handler, HandshakeHandler, Transition};
use bytes::BytesMut;
use exposer_mux::{Role, Session};
use exposer_proto::{Handshake, HandshakeCodec};
use exposer_transport::{BoxConnection, Connection};
use serde::Serialize;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 4096;

/// The connection while it is still in handshake mode
struct ControlConn {
    conn: BoxConnection,
    buf: BytesMut,
}

struct EngineInner {
    conn: tokio::sync::Mutex<Option<ControlConn>>,
    handler: tokio::sync::Mutex<Option<Handler>>,
    promoted: AtomicBool,
    running: AtomicBool,
    parent: Option<Weak<EngineInner>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<Handshake>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Handshake>>>,
    error: OnceLock<EngineError>,
    /// First session-fatal reason seen here, even if `error` was set earlier
    fatal: OnceLock<EngineError>,
    done: CancellationToken,
    session: OnceLock<Session>,
}

/// Drives one connection through the handshake protocol
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("promoted", &self.is_promoted())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Engine {
    pub fn new(conn: BoxConnection, handler: Handler) -> Self {
        Self::build(conn, handler, None)
    }

    /// Engine for a sub-connection; its shutdown is reported to `parent`
    pub fn with_parent(parent: &Engine, conn: BoxConnection, handler: Handler) -> Self {
        Self::build(conn, handler, Some(Arc::downgrade(&parent.inner)))
    }

    fn build(conn: BoxConnection, handler: Handler, parent: Option<Weak<EngineInner>>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineInner {
                conn: tokio::sync::Mutex::new(Some(ControlConn {
                    conn,
                    buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
                })),
                handler: tokio::sync::Mutex::new(Some(handler)),
                promoted: AtomicBool::new(false),
                running: AtomicBool::new(false),
                parent,
                events_tx: Mutex::new(Some(events_tx)),
                events_rx: Mutex::new(Some(events_rx)),
                error: OnceLock::new(),
                fatal: OnceLock::new(),
                done: CancellationToken::new(),
                session: OnceLock::new(),
            }),
        }
    }

    /// Send one handshake frame to the peer
    ///
    /// # Panics
    ///
    /// Panics if the connection has already been promoted.
    pub async fn reply<T>(&self, command: &str, details: &T) -> Result<(), EngineError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_promoted() {
            panic!("reply {:?} on a promoted connection", command);
        }

        let data = HandshakeCodec::encode(command, details)?;
        let mut guard = self.inner.conn.lock().await;
        let control = guard.as_mut().ok_or(EngineError::ConnectionClosed)?;
        control.conn.write_all(&data).await?;
        control.conn.flush().await?;

        trace!(command = %command, "Handshake sent");
        Ok(())
    }

    /// Send a frame, then run the handshake loop
    ///
    /// If the send fails the connection is dropped and the engine is left
    /// as it is; nothing is reported to waiters.
    pub async fn request<T>(&self, command: &str, details: &T)
    where
        T: Serialize + ?Sized,
    {
        if let Err(e) = self.reply(command, details).await {
            debug!("Request {:?} failed: {}", command, e);
            self.inner.conn.lock().await.take();
            return;
        }
        self.run().await;
    }

    /// Run the handshake loop until promotion or shutdown
    ///
    /// # Panics
    ///
    /// Panics if the loop is already running or has already run.
    pub async fn run(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            panic!("engine loop started twice");
        }
        let events = lock(&self.inner.events_rx).take();
        let Some(mut events) = events else {
            return;
        };

        while !self.is_promoted() {
            let frame = tokio::select! {
                biased;
                _ = self.inner.done.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                frame = self.read_frame() => match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        self.shutdown(e);
                        break;
                    }
                },
            };

            if let Err(e) = self.dispatch(frame).await {
                self.shutdown(e);
                break;
            }
        }

        drop(events);
        if !self.is_promoted() {
            self.inner.conn.lock().await.take();
        }
    }

    async fn read_frame(&self) -> Result<Handshake, EngineError> {
        let mut guard = self.inner.conn.lock().await;
        let control = guard.as_mut().ok_or(EngineError::ConnectionClosed)?;

        loop {
            if let Some(frame) = HandshakeCodec::decode(&mut control.buf)? {
                trace!(command = %frame.command, "Handshake received");
                return Ok(frame);
            }

            control.buf.reserve(READ_BUFFER_SIZE);
            if control.conn.read_buf(&mut control.buf).await? == 0 {
                return Err(EngineError::ConnectionClosed);
            }
        }
    }

    async fn dispatch(&self, frame: Handshake) -> Result<(), EngineError> {
        let mut slot = self.inner.handler.lock().await;
        let Some(handler) = slot.as_mut() else {
            return Err(EngineError::UnknownCommand(frame.command));
        };

        debug!(command = %frame.command, handler = handler.name(), "Dispatching handshake");
        if let Transition::Switch(mut next) = handler.handle(self, frame).await? {
            debug!(handler = next.name(), "Handler switched");
            next.installed(self);
            *slot = Some(next);
        }
        Ok(())
    }

    /// Queue a synthetic frame for the handler, e.g. a timer firing
    ///
    /// Fails once the engine has shut down or its loop has ended.
    pub fn emit<T>(&self, event: &str, details: &T) -> Result<(), EngineError>
    where
        T: Serialize + ?Sized,
    {
        let frame = HandshakeCodec::to_handshake(event, details)?;
        match lock(&self.inner.events_tx).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| EngineError::Closed),
            None => Err(EngineError::Closed),
        }
    }

    /// Promote the connection into a multiplexed session
    ///
    /// Bytes already read past the last handshake frame are fed to the
    /// session first.
    ///
    /// # Panics
    ///
    /// Panics if the connection has already been promoted.
    pub async fn multiplex(&self, role: Role) -> Result<Session, EngineError> {
        let ControlConn { conn, buf } = self.promote().await?;
        let (reader, writer) = tokio::io::split(conn);
        let session = Session::with_buffered(role, reader, writer, buf);
        let _ = self.inner.session.set(session.clone());
        Ok(session)
    }

    /// Promote the connection into a raw byte pipe to `other`
    ///
    /// # Panics
    ///
    /// Panics if the connection has already been promoted.
    pub async fn forward<C: Connection>(
        &self,
        other: C,
        forwarder: &Forwarder,
    ) -> Result<(u64, u64), EngineError> {
        let ControlConn { conn, buf } = self.promote().await?;
        let (reader, writer) = tokio::io::split(conn);
        let reader = Cursor::new(buf.freeze()).chain(reader);
        let (other_reader, other_writer) = tokio::io::split(other);
        Ok(forwarder
            .forward_halves(reader, writer, other_reader, other_writer)
            .await)
    }

    async fn promote(&self) -> Result<ControlConn, EngineError> {
        if self.inner.promoted.swap(true, Ordering::SeqCst) {
            panic!("connection promoted twice");
        }
        self.inner
            .conn
            .lock()
            .await
            .take()
            .ok_or(EngineError::ConnectionClosed)
    }

    /// Record the shutdown reason and notify waiters and ancestors
    ///
    /// The first reason recorded on an engine sticks. In-flight handlers are
    /// not cancelled. Sessions stay open unless the error is fatal to the
    /// session (see [`EngineError::is_session_fatal`]), in which case every
    /// session on the way up is closed, which tears down the physical
    /// connection.
    pub fn shutdown(&self, err: EngineError) {
        let fatal = err.is_session_fatal();
        let mut current = Some(self.inner.clone());

        while let Some(inner) = current.take() {
            if inner.error.set(err.clone()).is_ok() {
                debug!(reason = %err, "Engine shut down");
                inner.done.cancel();
                lock(&inner.events_tx).take();
            } else if !fatal {
                return;
            }

            if fatal {
                let _ = inner.fatal.set(err.clone());
                if let Some(session) = inner.session.get() {
                    session.close();
                }
            }
            current = inner.parent.as_ref().and_then(Weak::upgrade);
        }
    }

    /// Wait for shutdown and return its reason
    pub async fn wait(&self) -> EngineError {
        self.inner.done.cancelled().await;
        self.inner
            .error
            .get()
            .cloned()
            .unwrap_or(EngineError::Closed)
    }

    /// The first session-fatal reason that reached this engine
    ///
    /// Unlike [`wait`](Self::wait) this is not masked by an earlier,
    /// sub-connection-local failure.
    pub fn session_error(&self) -> Option<EngineError> {
        self.inner.fatal.get().cloned()
    }

    /// Shut down and close the session this engine was promoted into, if any
    pub fn close(&self) {
        self.shutdown(EngineError::Closed);
        if let Some(session) = self.inner.session.get() {
            session.close();
        }
    }

    pub fn is_promoted(&self) -> bool {
        self.inner.promoted.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.done.is_cancelled()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
