//! The stream variants a session can be speaking over.
//!
//! A connection is plain TCP, TLS over TCP, scrambled TCP, or TLS over
//! scrambled TCP; on the upstream side the TLS half is a client-side
//! handshake instead.  All variants expose the same async byte-stream
//! surface, so everything past the detector is variant-agnostic.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use pavise_scramble::ScrambleStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A byte stream in any of the shapes a session can take.
///
/// Boxing the TLS variants keeps the enum small; the hot path only pays
/// one match per poll.
#[derive(Debug)]
pub(crate) enum ProxyStream {
    /// Plain TCP.
    Tcp(TcpStream),
    /// Scrambled TCP.
    Scrambled(ScrambleStream<TcpStream>),
    /// Server-side TLS over TCP (we accepted the handshake).
    Tls(Box<server::TlsStream<TcpStream>>),
    /// Server-side TLS over scrambled TCP.
    TlsScrambled(Box<server::TlsStream<ScrambleStream<TcpStream>>>),
    /// Client-side TLS over TCP (we initiated, toward an upstream).
    UpstreamTls(Box<client::TlsStream<TcpStream>>),
    /// Client-side TLS over scrambled TCP.
    UpstreamTlsScrambled(Box<client::TlsStream<ScrambleStream<TcpStream>>>),
}

/// Run `$e` with `$s` bound to whichever inner stream is live.
macro_rules! with_inner {
    ($stream:expr, $s:ident => $e:expr) => {
        match $stream {
            ProxyStream::Tcp($s) => $e,
            ProxyStream::Scrambled($s) => $e,
            ProxyStream::Tls($s) => $e,
            ProxyStream::TlsScrambled($s) => $e,
            ProxyStream::UpstreamTls($s) => $e,
            ProxyStream::UpstreamTlsScrambled($s) => $e,
        }
    };
}

impl ProxyStream {
    /// The local endpoint of the underlying socket.
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// True when the client is talking to us through TLS; the web server
    /// uses this to pick the scheme in Location headers.
    pub(crate) fn is_tls(&self) -> bool {
        matches!(
            self,
            ProxyStream::Tls(_)
                | ProxyStream::TlsScrambled(_)
                | ProxyStream::UpstreamTls(_)
                | ProxyStream::UpstreamTlsScrambled(_)
        )
    }

    /// Reach down to the TCP socket at the bottom of the stack.
    fn tcp(&self) -> &TcpStream {
        match self {
            ProxyStream::Tcp(s) => s,
            ProxyStream::Scrambled(s) => s.get_ref(),
            ProxyStream::Tls(s) => s.get_ref().0,
            ProxyStream::TlsScrambled(s) => s.get_ref().0.get_ref(),
            ProxyStream::UpstreamTls(s) => s.get_ref().0,
            ProxyStream::UpstreamTlsScrambled(s) => s.get_ref().0.get_ref(),
        }
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        with_inner!(self.get_mut(), s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        with_inner!(self.get_mut(), s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        with_inner!(self.get_mut(), s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        with_inner!(self.get_mut(), s => Pin::new(s).poll_shutdown(cx))
    }
}
