//! Bidirectional byte relay between client and backend.
//!
//! Both copy directions run inside the calling task. As soon as one of them
//! reaches EOF or fails, the other is dropped mid-flight, so nothing keeps
//! running once [`relay`] returns. The caller then shuts both streams down.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy buffer size per direction.
const RELAY_BUF_SIZE: usize = 8192;

/// Which side ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    /// `a` closed or errored (on read of `a` or write to `b`).
    AToB,
    /// `b` closed or errored (on read of `b` or write to `a`).
    BToA,
}

/// Outcome of a relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
    /// Direction that finished first.
    pub finished: Finished,
}

/// Copy until EOF or error, counting bytes as they are written.
async fn copy_one_way<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

/// Relay bytes between `a` and `b` until either direction finishes.
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let finished = {
        let forward = copy_one_way(&mut a_read, &mut b_write, &mut a_to_b);
        let backward = copy_one_way(&mut b_read, &mut a_write, &mut b_to_a);

        tokio::select! {
            result = forward => {
                if let Err(e) = result {
                    debug!(error = %e, "Relay a->b ended with error");
                }
                Finished::AToB
            }
            result = backward => {
                if let Err(e) = result {
                    debug!(error = %e, "Relay b->a ended with error");
                }
                Finished::BToA
            }
        }
    };

    RelayStats {
        a_to_b,
        b_to_a,
        finished,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut client, mut proxy_client) = duplex(1024);
        let (mut proxy_backend, mut backend) = duplex(1024);

        let relay_task =
            tokio::spawn(async move { relay(&mut proxy_client, &mut proxy_backend).await });

        client.write_all(b"hello backend").await.unwrap();
        let mut buf = [0u8; 13];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello backend");

        backend.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        drop(backend);

        let stats = timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay did not stop")
            .unwrap();
        assert_eq!(stats.a_to_b, 13);
        assert_eq!(stats.b_to_a, 12);
        assert_eq!(stats.finished, Finished::BToA);
    }

    #[tokio::test]
    async fn test_stops_when_client_closes() {
        let (client, mut proxy_client) = duplex(1024);
        let (mut proxy_backend, _backend) = duplex(1024);

        drop(client);

        // The backend never closes; the relay must not wait for it.
        let stats = timeout(
            Duration::from_secs(1),
            relay(&mut proxy_client, &mut proxy_backend),
        )
        .await
        .expect("relay did not stop");
        assert_eq!(stats.finished, Finished::AToB);
        assert_eq!(stats.a_to_b, 0);
    }

    #[tokio::test]
    async fn test_preserves_order() {
        let (mut client, mut proxy_client) = duplex(64);
        let (mut proxy_backend, mut backend) = duplex(64);

        let relay_task =
            tokio::spawn(async move { relay(&mut proxy_client, &mut proxy_backend).await });

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        backend.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let _client = writer.await.unwrap();
        drop(backend);
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.a_to_b, expected.len() as u64);
    }
}
