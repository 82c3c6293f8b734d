//! Bidirectional byte relay with half-close propagation.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::limit::RateLimiter;

/// Default per-direction copy buffer.
const RELAY_BUF_LEN: usize = 512 * 1024;

/// Knobs for one relay run.
#[derive(Clone, Debug, Default)]
pub(crate) struct RelayConfig {
    /// Abort the session when a read makes no progress for this long.
    pub(crate) timeout: Option<Duration>,
    /// Bytes/second applied independently to each direction.
    pub(crate) rate_limit: Option<u64>,
}

/// Copy bytes both ways between `a` and `b` until both directions finish.
///
/// An EOF on one side half-closes the other side's write end and lets the
/// opposite direction keep draining; an I/O error or an expired timeout
/// tears the whole relay down.  Returns (a-to-b, b-to-a) byte counts.
pub(crate) async fn relay<A, B>(
    a: A,
    b: B,
    cfg: &RelayConfig,
    abort: &CancellationToken,
) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    // A child token so an error in either direction stops both, without
    // cancelling the whole session tree.
    let stop = abort.child_token();

    let (a2b, b2a) = tokio::join!(
        copy_one_way(a_read, b_write, cfg, &stop),
        copy_one_way(b_read, a_write, cfg, &stop),
    );
    (a2b, b2a)
}

/// Copy one direction.  Returns the number of bytes moved.
async fn copy_one_way<R, W>(
    mut reader: R,
    mut writer: W,
    cfg: &RelayConfig,
    stop: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let limiter = cfg.rate_limit.map(|bps| Arc::new(RateLimiter::new(bps)));
    let buf_len = match &limiter {
        Some(lim) => lim.clamp_buffer(RELAY_BUF_LEN),
        None => RELAY_BUF_LEN,
    };
    let mut buf = vec![0_u8; buf_len];
    let mut total = 0_u64;

    loop {
        let read = async {
            match cfg.timeout {
                Some(t) => tokio::time::timeout(t, reader.read(&mut buf)).await,
                None => Ok(reader.read(&mut buf).await),
            }
        };
        let n = tokio::select! {
            _ = stop.cancelled() => break,
            r = read => match r {
                // No progress inside the window: the connection is dead
                // weight, abort both directions.
                Err(_elapsed) => {
                    debug!("relay timeout; aborting");
                    stop.cancel();
                    break;
                }
                Ok(Ok(0)) => {
                    // EOF: propagate the half-close and let the peer
                    // direction drain.
                    let _ = writer.shutdown().await;
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("relay read error: {}", e);
                    stop.cancel();
                    break;
                }
            },
        };

        if let Some(lim) = &limiter {
            lim.throttle(n).await;
        }
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!("relay write error: {}", e);
            stop.cancel();
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!("relay flush error: {}", e);
            stop.cancel();
            break;
        }
        total += n as u64;
    }
    total
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn bytes_cross_both_ways() {
        let (client, client_far) = tokio::io::duplex(4096);
        let (server, server_far) = tokio::io::duplex(4096);

        let abort = CancellationToken::new();
        let cfg = RelayConfig::default();
        let relay_task = tokio::spawn(async move {
            relay(client_far, server_far, &cfg, &abort).await
        });

        let (mut cr, mut cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        cw.write_all(b"ping").await.unwrap();
        cw.shutdown().await.unwrap();
        let mut got = Vec::new();
        sr.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        sw.write_all(b"pong").await.unwrap();
        sw.shutdown().await.unwrap();
        let mut got = Vec::new();
        cr.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"pong");

        let (a2b, b2a) = relay_task.await.unwrap();
        assert_eq!((a2b, b2a), (4, 4));
    }

    #[tokio::test]
    async fn half_close_lets_the_other_direction_drain() {
        let (client, client_far) = tokio::io::duplex(4096);
        let (server, server_far) = tokio::io::duplex(4096);

        let abort = CancellationToken::new();
        let cfg = RelayConfig::default();
        let relay_task = tokio::spawn(async move {
            relay(client_far, server_far, &cfg, &abort).await
        });

        let (mut cr, mut cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        // Client closes its write side immediately…
        cw.shutdown().await.unwrap();
        let mut got = Vec::new();
        sr.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());

        // …but the server-to-client direction still works.
        sw.write_all(b"late data").await.unwrap();
        sw.shutdown().await.unwrap();
        let mut got = Vec::new();
        cr.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"late data");

        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn abort_stops_the_relay() {
        let (_client, client_far) = tokio::io::duplex(4096);
        let (_server, server_far) = tokio::io::duplex(4096);

        let abort = CancellationToken::new();
        let cfg = RelayConfig::default();
        let token = abort.clone();
        let relay_task = tokio::spawn(async move {
            relay(client_far, server_far, &cfg, &token).await
        });

        abort.cancel();
        tokio::time::timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay should stop on abort")
            .unwrap();
    }

    #[tokio::test]
    async fn idle_timeout_aborts() {
        let (_client, client_far) = tokio::io::duplex(4096);
        let (_server, server_far) = tokio::io::duplex(4096);

        let abort = CancellationToken::new();
        let cfg = RelayConfig {
            timeout: Some(Duration::from_millis(50)),
            rate_limit: None,
        };
        let start = std::time::Instant::now();
        relay(client_far, server_far, &cfg, &abort).await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
