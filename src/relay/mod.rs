//! Bidirectional byte relay between two established streams
//!
//! The relay takes ownership of both ends, so they are closed on every exit
//! path, including panics unwinding through the owning task.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

/// Default idle timeout (no bytes in either direction)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-direction copy buffer
const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes copied in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Why a relay stopped without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    EofFromA,
    EofFromB,
    IdleTimeout,
}

/// Result of a finished relay
///
/// Counts are always filled in, even when `outcome` is an error.
#[derive(Debug)]
pub struct RelayReport {
    pub stats: RelayStats,
    pub outcome: Result<CloseReason>,
}

/// Relay with an idle timeout
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    idle_timeout: Duration,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl Relay {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Copy bytes between `a` and `b` until EOF on either side, an error,
    /// or the idle timeout
    ///
    /// Both streams are shut down before returning.
    pub async fn run<A, B>(&self, mut a: A, mut b: B) -> RelayReport
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stats = RelayStats::default();
        let mut buf_a = vec![0u8; BUFFER_SIZE];
        let mut buf_b = vec![0u8; BUFFER_SIZE];

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        let outcome = loop {
            tokio::select! {
                read = a.read(&mut buf_a) => match read {
                    Ok(0) => break Ok(CloseReason::EofFromA),
                    Ok(n) => {
                        if let Err(e) = self.forward(&mut b, &buf_a[..n]).await {
                            break Err(e);
                        }
                        stats.a_to_b += n as u64;
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    }
                    Err(e) => break Err(Error::Relay(format!("read from client side: {}", e))),
                },
                read = b.read(&mut buf_b) => match read {
                    Ok(0) => break Ok(CloseReason::EofFromB),
                    Ok(n) => {
                        if let Err(e) = self.forward(&mut a, &buf_b[..n]).await {
                            break Err(e);
                        }
                        stats.b_to_a += n as u64;
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    }
                    Err(e) => break Err(Error::Relay(format!("read from destination side: {}", e))),
                },
                _ = &mut idle => break Ok(CloseReason::IdleTimeout),
            }
        };

        trace!(
            a_to_b = stats.a_to_b,
            b_to_a = stats.b_to_a,
            outcome = ?outcome,
            "Relay finished"
        );

        let _ = a.shutdown().await;
        let _ = b.shutdown().await;

        RelayReport { stats, outcome }
    }

    /// Write a chunk, failing if the peer stops reading for longer than the
    /// idle timeout
    async fn forward<W: AsyncWrite + Unpin>(&self, writer: &mut W, data: &[u8]) -> Result<()> {
        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.idle_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Relay(format!("write failed: {}", e))),
            Err(_) => Err(Error::Relay(format!(
                "write stalled for {:?}",
                self.idle_timeout
            ))),
        }
    }
}

/// Relay with the default idle timeout
pub async fn relay<A, B>(a: A, b: B) -> RelayReport
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    Relay::default().run(a, b).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_round_trip() {
        let (mut client, a) = duplex(1024);
        let (b, mut dest) = duplex(1024);

        let handle = tokio::spawn(async move { relay(a, b).await });

        client.write_all(b"hello destination").await.unwrap();
        let mut buf = [0u8; 17];
        dest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello destination");

        dest.write_all(b"hi back").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi back");

        drop(client);
        let report = handle.await.unwrap();
        assert_eq!(report.stats.a_to_b, 17);
        assert_eq!(report.stats.b_to_a, 7);
        assert_eq!(report.outcome.unwrap(), CloseReason::EofFromA);
    }

    #[tokio::test]
    async fn test_relay_preserves_order_of_large_payload() {
        let (mut client, a) = duplex(4096);
        let (b, mut dest) = duplex(4096);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let handle = tokio::spawn(async move { relay(a, b).await });
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        dest.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let report = handle.await.unwrap();
        assert_eq!(report.stats.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_eof_from_destination_closes_client() {
        let (mut client, a) = duplex(1024);
        let (b, dest) = duplex(1024);

        let handle = tokio::spawn(async move { relay(a, b).await });
        drop(dest);

        let report = handle.await.unwrap();
        assert_eq!(report.outcome.unwrap(), CloseReason::EofFromB);

        // The relay shut down its end, so the client sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_client, a) = duplex(1024);
        let (b, _dest) = duplex(1024);

        let report = Relay::new(Duration::from_secs(5)).run(a, b).await;
        assert_eq!(report.outcome.unwrap(), CloseReason::IdleTimeout);
        assert_eq!(report.stats, RelayStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_idle_timer() {
        let (mut client, a) = duplex(1024);
        let (b, mut dest) = duplex(1024);

        let handle =
            tokio::spawn(async move { Relay::new(Duration::from_secs(5)).run(a, b).await });

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            dest.read_exact(&mut buf).await.unwrap();
        }
        assert!(!handle.is_finished());

        let report = handle.await.unwrap();
        assert_eq!(report.outcome.unwrap(), CloseReason::IdleTimeout);
        assert_eq!(report.stats.a_to_b, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_fails() {
        let (mut client, a) = duplex(1024);
        // Tiny buffer the destination never drains
        let (b, _dest) = duplex(8);

        let handle =
            tokio::spawn(async move { Relay::new(Duration::from_secs(5)).run(a, b).await });
        client.write_all(&[0u8; 64]).await.unwrap();

        let report = handle.await.unwrap();
        assert!(matches!(report.outcome, Err(Error::Relay(_))));
    }
}
