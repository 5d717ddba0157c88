//! Message ⇄ byte-stream pump

use bytes::Bytes;
use exposer_transport::BoxConnection;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, trace};

const PIPE_BUFFER_SIZE: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// What an incoming message means for the byte stream
pub(crate) enum Inbound {
    Data(Bytes),
    Close,
    Skip,
}

/// Spawn the pump for `ws` and return the local end of the stream
pub(crate) fn bridge<W, M, E>(ws: W, encode: fn(Bytes) -> M, decode: fn(M) -> Inbound) -> BoxConnection
where
    W: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + Unpin + 'static,
    M: Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    tokio::spawn(async move {
        if let Err(e) = pump(ws, remote, encode, decode).await {
            debug!("WebSocket bridge ended: {}", e);
        }
    });
    Box::new(local)
}

async fn pump<W, M, E>(
    ws: W,
    io: DuplexStream,
    encode: fn(Bytes) -> M,
    decode: fn(M) -> Inbound,
) -> io::Result<()>
where
    W: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: Unpin,
    E: Display,
{
    let (mut sink, mut stream) = ws.split();
    let (mut reader, mut writer) = tokio::io::split(io);

    let outbound = async {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let result = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };
            trace!(len = n, "WebSocket send");
            if let Err(e) = sink.send(encode(Bytes::copy_from_slice(&buf[..n]))).await {
                break Err(io::Error::other(e.to_string()));
            }
        };
        let _ = sink.close().await;
        result
    };

    let inbound = async {
        let result = loop {
            match stream.next().await {
                Some(Ok(msg)) => match decode(msg) {
                    Inbound::Data(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            break Err(e);
                        }
                    }
                    Inbound::Close => break Ok(()),
                    Inbound::Skip => {}
                },
                Some(Err(e)) => break Err(io::Error::other(e.to_string())),
                None => break Ok(()),
            }
        };
        let _ = writer.shutdown().await;
        result
    };

    let (out, inc) = tokio::join!(outbound, inbound);
    out.and(inc)
}
