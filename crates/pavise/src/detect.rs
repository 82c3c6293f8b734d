//! Protocol autodetection on freshly accepted connections.
//!
//! The first bytes of a connection are peeked (never consumed where the
//! transport allows it) and dispatched: SOCKS5 (0x05), SOCKS4 (0x04), a
//! TLS ClientHello (0x16, unwrapped in place and re-detected once), or an
//! HTTP method letter.  With scramble enabled, a first byte that matches
//! none of those is treated as the start of a noise handshake, after
//! which detection re-runs on the unscrambled stream.

use anyhow::Result;
use pavise_scramble::ScrambleStream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::session::SessionCtx;
use crate::stream::ProxyStream;

/// First bytes the listener recognizes directly.  Noise bursts avoid
/// them, so scrambled and unscrambled clients can share a port.
pub(crate) const PROTOCOL_BYTES: [u8; 6] = [0x04, 0x05, 0x16, b'G', b'P', b'C'];

/// What the detector decided.
pub(crate) enum Detected {
    /// Speak SOCKS; the vec holds bytes already consumed from the stream.
    Socks(ProxyStream, Vec<u8>),
    /// Speak HTTP (proxy or web).
    Http(ProxyStream, Vec<u8>),
    /// Unrecognized or administratively disabled: just close.
    Close,
}

/// Inspect a fresh connection and classify it.
pub(crate) async fn detect(
    ctx: &SessionCtx,
    stream: TcpStream,
    tls: Option<&TlsAcceptor>,
) -> Result<Detected> {
    let mut first = [0_u8; 5];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        debug!("connection id: {}, closed before first byte", ctx.id);
        return Ok(Detected::Close);
    }
    let b0 = first[0];

    if ctx.options.scramble && !PROTOCOL_BYTES.contains(&b0) {
        return detect_scrambled(ctx, stream, tls).await;
    }

    match b0 {
        0x05 | 0x04 => {
            if ctx.options.disable_socks {
                debug!("connection id: {}, socks disabled", ctx.id);
                return Ok(Detected::Close);
            }
            debug!("connection id: {}, socks protocol", ctx.id);
            Ok(Detected::Socks(ProxyStream::Tcp(stream), Vec::new()))
        }
        0x16 => {
            let Some(acceptor) = tls else {
                debug!("connection id: {}, TLS client but no certificate", ctx.id);
                return Ok(Detected::Close);
            };
            debug!("connection id: {}, ssl protocol", ctx.id);
            let mut tls_stream = acceptor.accept(stream).await?;
            match classify_consuming(&mut tls_stream).await? {
                Some((0x05 | 0x04, buffered)) => {
                    if ctx.options.disable_socks {
                        return Ok(Detected::Close);
                    }
                    Ok(Detected::Socks(
                        ProxyStream::Tls(Box::new(tls_stream)),
                        buffered,
                    ))
                }
                Some((b'G' | b'P' | b'C', buffered)) => {
                    if ctx.options.disable_http {
                        return Ok(Detected::Close);
                    }
                    Ok(Detected::Http(
                        ProxyStream::Tls(Box::new(tls_stream)),
                        buffered,
                    ))
                }
                // 0x16 again would be TLS inside TLS: refuse the
                // recursion.
                _ => Ok(Detected::Close),
            }
        }
        b'G' | b'P' | b'C' => {
            if ctx.options.disable_http {
                debug!("connection id: {}, http disabled", ctx.id);
                return Ok(Detected::Close);
            }
            debug!("connection id: {}, http protocol", ctx.id);
            Ok(Detected::Http(ProxyStream::Tcp(stream), Vec::new()))
        }
        other => {
            debug!(
                "connection id: {}, unrecognized first byte {:#x}",
                ctx.id, other
            );
            Ok(Detected::Close)
        }
    }
}

/// The scramble arm: answer the noise handshake, then detect again on
/// the unscrambled bytes.
async fn detect_scrambled(
    ctx: &SessionCtx,
    stream: TcpStream,
    tls: Option<&TlsAcceptor>,
) -> Result<Detected> {
    let mut scrambled = ScrambleStream::new(stream);
    let keys = pavise_scramble::noise_handshake(
        &mut scrambled,
        ctx.options.noise_length,
        // Our own burst may start with anything; the client already knows
        // this connection is scrambled.
        &[],
    )
    .await?;
    scrambled.install_keys(keys);
    debug!("connection id: {}, noise handshake complete", ctx.id);

    let peeked = scrambled.peek(1).await?;
    let Some(&inner) = peeked.first() else {
        return Ok(Detected::Close);
    };

    match inner {
        0x05 | 0x04 => {
            if ctx.options.disable_socks {
                return Ok(Detected::Close);
            }
            Ok(Detected::Socks(ProxyStream::Scrambled(scrambled), Vec::new()))
        }
        0x16 => {
            let Some(acceptor) = tls else {
                return Ok(Detected::Close);
            };
            let mut tls_stream = acceptor.accept(scrambled).await?;
            match classify_consuming(&mut tls_stream).await? {
                Some((0x05 | 0x04, buffered)) => {
                    if ctx.options.disable_socks {
                        return Ok(Detected::Close);
                    }
                    Ok(Detected::Socks(
                        ProxyStream::TlsScrambled(Box::new(tls_stream)),
                        buffered,
                    ))
                }
                Some((b'G' | b'P' | b'C', buffered)) => {
                    if ctx.options.disable_http {
                        return Ok(Detected::Close);
                    }
                    Ok(Detected::Http(
                        ProxyStream::TlsScrambled(Box::new(tls_stream)),
                        buffered,
                    ))
                }
                _ => Ok(Detected::Close),
            }
        }
        b'G' | b'P' | b'C' => {
            if ctx.options.disable_http {
                return Ok(Detected::Close);
            }
            Ok(Detected::Http(ProxyStream::Scrambled(scrambled), Vec::new()))
        }
        _ => Ok(Detected::Close),
    }
}

/// Read one byte to classify a stream that cannot peek (post-TLS).
///
/// Returns the byte plus itself as the "already consumed" buffer, or
/// `None` at EOF.
async fn classify_consuming<S>(stream: &mut S) -> Result<Option<(u8, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0_u8; 1];
    let n = stream.read(&mut byte).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some((byte[0], byte.to_vec())))
}
