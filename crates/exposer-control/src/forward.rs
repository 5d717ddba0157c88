//! Bidirectional byte forwarding

use exposer_transport::Connection;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Grace period between end-of-stream and closing the destination
pub const DEFAULT_DRAIN_DELAY: Duration = Duration::from_secs(8);

/// Copies bytes both ways between two connections
///
/// When one direction reaches end-of-stream, its destination is shut down
/// only after `drain_delay`, so a final write racing with the close on the
/// other side still lands.
#[derive(Debug, Clone, Copy)]
pub struct Forwarder {
    drain_delay: Duration,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_DELAY)
    }
}

impl Forwarder {
    pub fn new(drain_delay: Duration) -> Self {
        Self { drain_delay }
    }

    /// Forward between `c1` and `c2` until both directions are closed
    ///
    /// Returns (bytes c1→c2, bytes c2→c1)
    pub async fn forward<A, B>(&self, c1: A, c2: B) -> (u64, u64)
    where
        A: Connection,
        B: Connection,
    {
        let (r1, w1) = tokio::io::split(c1);
        let (r2, w2) = tokio::io::split(c2);
        self.forward_halves(r1, w1, r2, w2).await
    }

    /// Forward between two connections given as read/write halves
    pub async fn forward_halves<R1, W1, R2, W2>(
        &self,
        r1: R1,
        w1: W1,
        r2: R2,
        w2: W2,
    ) -> (u64, u64)
    where
        R1: AsyncRead + Unpin + Send,
        W1: AsyncWrite + Unpin + Send,
        R2: AsyncRead + Unpin + Send,
        W2: AsyncWrite + Unpin + Send,
    {
        let (to_c2, to_c1) = tokio::join!(
            self.copy_then_close(r1, w2),
            self.copy_then_close(r2, w1)
        );

        debug!(bytes_out = to_c2, bytes_in = to_c1, "Forward completed");
        (to_c2, to_c1)
    }

    async fn copy_then_close<R, W>(&self, mut from: R, mut to: W) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let copied = match tokio::io::copy(&mut from, &mut to).await {
            Ok(n) => {
                tokio::time::sleep(self.drain_delay).await;
                n
            }
            Err(e) => {
                debug!("Forward direction failed: {}", e);
                0
            }
        };

        let _ = to.shutdown().await;
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_forward_both_directions() {
        let (c1, mut p1) = tokio::io::duplex(1024);
        let (c2, mut p2) = tokio::io::duplex(1024);

        let forwarder = Forwarder::new(Duration::from_millis(10));
        let task = tokio::spawn(async move { forwarder.forward(c1, c2).await });

        p1.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        p2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        p2.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        p1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(p1);
        drop(p2);
        let (out, back) = task.await.unwrap();
        assert_eq!(out, 4);
        assert_eq!(back, 5);
    }

    #[tokio::test]
    async fn test_close_waits_for_drain_delay() {
        let delay = Duration::from_millis(200);
        let (c1, mut p1) = tokio::io::duplex(1024);
        let (c2, mut p2) = tokio::io::duplex(1024);

        let forwarder = Forwarder::new(delay);
        tokio::spawn(async move { forwarder.forward(c1, c2).await });

        p1.write_all(b"last words").await.unwrap();
        p1.shutdown().await.unwrap();
        let eof_at = Instant::now();

        let mut received = Vec::new();
        p2.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"last words");
        assert!(eof_at.elapsed() >= delay);
    }
}
