//! Multiplexed session over one physical connection

use crate::stream::{pump, MuxStream, StreamCredit, StreamHandle, STREAM_BUFFER_SIZE};
use crate::{MuxError, Role};
use bytes::{Bytes, BytesMut};
use exposer_proto::{Frame, FrameType, StreamId};
use exposer_transport::Connection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const OUTGOING_QUEUE: usize = 256;
const ACCEPT_BACKLOG: usize = 128;
const READ_BUFFER_SIZE: usize = 64 * 1024;
const GOAWAY_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct Shared {
    role: Role,
    next_id: AtomicU32,
    streams: Mutex<HashMap<StreamId, StreamHandle>>,
    outgoing: mpsc::Sender<Frame>,
    accept_tx: mpsc::Sender<MuxStream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    error: OnceLock<MuxError>,
    pub(crate) closed: CancellationToken,
}

impl Shared {
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), MuxError> {
        self.outgoing.send(frame).await.map_err(|_| self.error())
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.lock_streams().remove(&id);
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, StreamHandle>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn error(&self) -> MuxError {
        self.error.get().cloned().unwrap_or(MuxError::Closed)
    }

    /// Record why the session died and stop it. First caller wins.
    fn fail(&self, err: MuxError) {
        if self.error.set(err).is_ok() {
            debug!(role = ?self.role, reason = %self.error(), "Mux session stopped");
        }
        self.closed.cancel();
        self.lock_streams().clear();
    }

    /// Create the local state for a stream and start its pump
    fn register(self: &Arc<Self>, id: StreamId) -> Option<MuxStream> {
        let (user, pump_io) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let reset = CancellationToken::new();
        let credit = Arc::new(StreamCredit::new());

        {
            let mut streams = self.lock_streams();
            if self.closed.is_cancelled() || streams.contains_key(&id) {
                return None;
            }
            streams.insert(
                id,
                StreamHandle {
                    data: Some(data_tx),
                    reset: reset.clone(),
                    credit: credit.clone(),
                },
            );
        }

        tokio::spawn(pump(self.clone(), id, pump_io, data_rx, reset, credit));
        Some(MuxStream::new(id, user))
    }

    /// Route one inbound frame. Never waits on a single stream's reader.
    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open => match self.register(id) {
                Some(stream) => {
                    trace!(stream_id = id, "Stream opened by peer");
                    if self.accept_tx.try_send(stream).is_err() {
                        warn!(stream_id = id, "Accept backlog full, resetting stream");
                        self.reset_stream(id);
                        let _ = self.send(Frame::reset(id)).await;
                    }
                }
                None => {
                    let _ = self.send(Frame::reset(id)).await;
                }
            },
            FrameType::Data => {
                let target = self
                    .lock_streams()
                    .get(&id)
                    .map(|handle| (handle.data.clone(), handle.credit.clone()));
                let Some((sender, credit)) = target else {
                    return;
                };

                if !credit.receive(frame.payload.len()) {
                    warn!(stream_id = id, "Peer overran stream window, resetting stream");
                    self.reset_stream(id);
                    let _ = self.send(Frame::reset(id)).await;
                    return;
                }
                if let Some(sender) = sender {
                    let _ = sender.send(frame.payload);
                }
            }
            FrameType::WindowUpdate => match frame.window_increment() {
                Ok(increment) => {
                    if let Some(handle) = self.lock_streams().get(&id) {
                        handle.credit.grant(increment);
                    }
                }
                Err(e) => self.fail(MuxError::Protocol(e)),
            },
            FrameType::Close if frame.flags.has_rst() => {
                self.reset_stream(id);
            }
            FrameType::Close => {
                if let Some(handle) = self.lock_streams().get_mut(&id) {
                    handle.data = None;
                }
            }
            FrameType::GoAway => {
                self.fail(MuxError::ConnectionClosed);
            }
        }
    }

    fn reset_stream(&self, id: StreamId) {
        if let Some(handle) = self.lock_streams().remove(&id) {
            handle.reset.cancel();
        }
    }
}

/// A multiplexed session
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl Session {
    /// Start a session over `conn`
    pub fn new<C: Connection>(role: Role, conn: C) -> Self {
        let (reader, writer) = tokio::io::split(conn);
        Self::with_buffered(role, reader, writer, BytesMut::new())
    }

    /// Start a session whose first input bytes were already read into `buffered`
    pub fn with_buffered<R, W>(role: Role, reader: R, writer: W, buffered: BytesMut) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            role,
            next_id: AtomicU32::new(role.first_stream_id()),
            streams: Mutex::new(HashMap::new()),
            outgoing,
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            error: OnceLock::new(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(read_loop(shared.clone(), reader, buffered));
        tokio::spawn(write_loop(shared.clone(), writer, outgoing_rx));

        debug!(role = ?role, "Mux session started");
        Self { shared }
    }

    /// Open a new logical stream
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        if self.shared.closed.is_cancelled() {
            return Err(self.shared.error());
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self
            .shared
            .register(id)
            .ok_or_else(|| self.shared.error())?;

        self.shared.send(Frame::open(id)).await?;
        trace!(stream_id = id, "Stream opened");
        Ok(stream)
    }

    /// Wait for the peer to open a logical stream
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        if self.shared.closed.is_cancelled() {
            return Err(self.shared.error());
        }

        let mut rx = tokio::select! {
            _ = self.shared.closed.cancelled() => return Err(self.shared.error()),
            rx = self.shared.accept_rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(self.shared.error()),
            stream = rx.recv() => stream.ok_or_else(|| self.shared.error()),
        }
    }

    /// Close the session and every stream on it. Idempotent.
    pub fn close(&self) {
        self.shared.fail(MuxError::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until the session dies and return why
    pub async fn wait(&self) -> MuxError {
        self.shared.closed.cancelled().await;
        self.shared.error()
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, mut buf: BytesMut)
where
    R: AsyncRead + Send + Unpin,
{
    buf.reserve(READ_BUFFER_SIZE);

    let err = loop {
        loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => {
                    tokio::select! {
                        _ = shared.closed.cancelled() => return,
                        _ = shared.dispatch(frame) => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    shared.fail(MuxError::Protocol(e));
                    return;
                }
            }
        }

        let read = tokio::select! {
            _ = shared.closed.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break MuxError::ConnectionClosed,
            Ok(_) => {}
            Err(e) => break MuxError::from(e),
        }
    };

    shared.fail(err);
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = BytesMut::new();

    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        // Batch whatever else is already queued
        let mut next = Some(frame);
        while let Some(frame) = next.take() {
            if let Err(e) = frame.encode_into(&mut buf) {
                warn!("Dropping unencodable frame: {}", e);
            }
            next = rx.try_recv().ok();
        }

        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            _ = shared.closed.cancelled() => break,
            result = result => result,
        };
        buf.clear();

        if let Err(e) = result {
            shared.fail(MuxError::from(e));
            return;
        }
    }

    // Tell the peer, best effort
    let goodbye = async {
        let data = Frame::go_away().encode().unwrap_or_else(|_| Bytes::new());
        writer.write_all(&data).await?;
        writer.shutdown().await
    };
    let _ = tokio::time::timeout(GOAWAY_TIMEOUT, goodbye).await;
}
