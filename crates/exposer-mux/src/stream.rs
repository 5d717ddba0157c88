//! Logical streams and their pumps

use crate::session::Shared;
use bytes::Bytes;
use exposer_proto::{Frame, StreamId};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub(crate) const STREAM_BUFFER_SIZE: usize = 64 * 1024;
const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes either side may have in flight on one stream before the receiver
/// hands credit back
pub(crate) const INITIAL_WINDOW: usize = 256 * 1024;

/// Consumed bytes are returned to the peer in batches of at least this many
const WINDOW_UPDATE_THRESHOLD: usize = INITIAL_WINDOW / 4;

/// One logical stream of a [`Session`](crate::Session)
///
/// Dropping it (or shutting down its write side) sends a half-close to the
/// peer. Once the session dies, reads return end-of-stream and writes fail.
#[derive(Debug)]
pub struct MuxStream {
    id: StreamId,
    io: DuplexStream,
}

impl MuxStream {
    pub(crate) fn new(id: StreamId, io: DuplexStream) -> Self {
        Self { id, io }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Per-stream flow control state shared by the reader task and the pump
pub(crate) struct StreamCredit {
    /// Bytes we may still send; topped up by the peer's window updates
    pub(crate) send: Semaphore,
    /// Bytes received from the peer and not yet handed back as credit
    pub(crate) unacked: AtomicUsize,
}

impl StreamCredit {
    pub(crate) fn new() -> Self {
        Self {
            send: Semaphore::new(INITIAL_WINDOW),
            unacked: AtomicUsize::new(0),
        }
    }

    /// Account for `len` received bytes. False if the peer overran its window.
    pub(crate) fn receive(&self, len: usize) -> bool {
        self.unacked.fetch_add(len, Ordering::AcqRel) + len <= INITIAL_WINDOW
    }

    /// Apply a window update, never growing past the initial window
    pub(crate) fn grant(&self, increment: u32) {
        let room = INITIAL_WINDOW.saturating_sub(self.send.available_permits());
        self.send.add_permits((increment as usize).min(room));
    }
}

/// Reader-task side of a stream
pub(crate) struct StreamHandle {
    /// None once the peer has half-closed
    pub(crate) data: Option<mpsc::UnboundedSender<Bytes>>,
    pub(crate) reset: CancellationToken,
    pub(crate) credit: Arc<StreamCredit>,
}

/// Move bytes between the pump end of a stream's pipe and the session
pub(crate) async fn pump(
    shared: Arc<Shared>,
    id: StreamId,
    io: DuplexStream,
    mut incoming: mpsc::UnboundedReceiver<Bytes>,
    reset: CancellationToken,
    credit: Arc<StreamCredit>,
) {
    let (mut reader, mut writer) = tokio::io::split(io);

    let upload = async {
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = shared.send(Frame::fin(id)).await;
                    return;
                }
                Ok(n) => {
                    match credit.send.acquire_many(n as u32).await {
                        Ok(permits) => permits.forget(),
                        Err(_) => return,
                    }
                    trace!(stream_id = id, len = n, "Stream data out");
                    let frame = Frame::data(id, Bytes::copy_from_slice(&buf[..n]));
                    if shared.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    };

    let download = async {
        let mut consumed = 0;
        while let Some(data) = incoming.recv().await {
            if writer.write_all(&data).await.is_err() {
                // User end is gone; stop the peer from sending more
                let _ = shared.send(Frame::reset(id)).await;
                reset.cancel();
                return;
            }

            consumed += data.len();
            if consumed >= WINDOW_UPDATE_THRESHOLD {
                credit.unacked.fetch_sub(consumed, Ordering::AcqRel);
                if shared
                    .send(Frame::window_update(id, consumed as u32))
                    .await
                    .is_err()
                {
                    return;
                }
                consumed = 0;
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::select! {
        _ = reset.cancelled() => {
            trace!(stream_id = id, "Stream reset");
        }
        _ = shared.closed.cancelled() => {}
        _ = async { tokio::join!(upload, download) } => {}
    }

    shared.remove_stream(id);
}
