//! A stream wrapper that scrambles writes and unscrambles reads.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::{NoiseKeys, ScrambleCodec};

/// How much caller data one `poll_write` will accept into the scramble
/// buffer at a time.
const WRITE_CHUNK: usize = 16 * 1024;

/// A byte stream whose payload is XOR-scrambled on the wire.
///
/// Until [`install_keys`](Self::install_keys) is called the wrapper is
/// fully transparent; this is how the noise handshake itself travels in
/// the clear.  After key installation every written byte is scrambled and
/// every read byte unscrambled.
///
/// The reader side supports [`peek`](Self::peek): protocol detection needs
/// to look at the first plaintext bytes without consuming them, and
/// `MSG_PEEK` on the socket would only show scrambled bytes.
#[derive(Debug)]
pub struct ScrambleStream<S> {
    /// The transport underneath us.
    inner: S,
    /// Keystream for inbound bytes, once installed.
    read_codec: Option<ScrambleCodec>,
    /// Keystream for outbound bytes, once installed.
    write_codec: Option<ScrambleCodec>,
    /// Plaintext that has been unscrambled but not yet claimed by a read.
    read_buf: Vec<u8>,
    /// Read cursor into `read_buf`.
    read_pos: usize,
    /// Scrambled bytes accepted from a writer but not yet written through.
    write_buf: Vec<u8>,
    /// Write cursor into `write_buf`.
    write_pos: usize,
}

impl<S> ScrambleStream<S> {
    /// Wrap `inner`.  The wrapper is transparent until keys are installed.
    pub fn new(inner: S) -> Self {
        ScrambleStream {
            inner,
            read_codec: None,
            write_codec: None,
            read_buf: Vec::new(),
            read_pos: 0,
            write_buf: Vec::new(),
            write_pos: 0,
        }
    }

    /// Install the keys derived by the noise handshake.  All subsequent
    /// traffic is transformed.
    pub fn install_keys(&mut self, keys: NoiseKeys) {
        self.read_codec = Some(ScrambleCodec::new(keys.read_key));
        self.write_codec = Some(ScrambleCodec::new(keys.write_key));
    }

    /// Get a reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Number of unread plaintext bytes currently buffered.
    fn buffered(&self) -> usize {
        self.read_buf.len() - self.read_pos
    }
}

impl<S> ScrambleStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Push buffered scrambled bytes into the transport.
    ///
    /// `Pending` re-arms the waker for writability, so callers may also
    /// invoke this opportunistically and ignore the result.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> ScrambleStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Look at up to `n` plaintext bytes without consuming them.
    ///
    /// Returns fewer than `n` bytes only at EOF.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered() < n {
            let mut chunk = [0_u8; 4096];
            let got = self.inner.read(&mut chunk).await?;
            if got == 0 {
                break;
            }
            if let Some(codec) = &mut self.read_codec {
                codec.apply(&mut chunk[..got]);
            }
            self.read_buf.extend_from_slice(&chunk[..got]);
        }
        let avail = self.buffered().min(n);
        Ok(&self.read_buf[self.read_pos..self.read_pos + avail])
    }
}

impl<S> AsyncRead for ScrambleStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // A TLS layer above us may stop calling poll_write once it thinks
        // its records are out; push any still-buffered bytes from here so
        // the peer can actually answer.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }

        // Serve previously peeked plaintext first.
        if this.buffered() > 0 {
            let n = this.buffered().min(buf.remaining());
            buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
            this.read_pos += n;
            if this.read_pos == this.read_buf.len() {
                this.read_buf.clear();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let pre = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(codec) = &mut this.read_codec {
                    codec.apply(&mut buf.filled_mut()[pre..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S> AsyncWrite for ScrambleStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Flush bytes accepted by an earlier call before taking more.  If
        // the transport is not ready we have consumed nothing from `buf`,
        // so Pending is honest here.
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => (),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let Some(codec) = &mut this.write_codec else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };

        let take = buf.len().min(WRITE_CHUNK);
        this.write_buf.extend_from_slice(&buf[..take]);
        codec.apply(&mut this.write_buf);

        // Opportunistically push what the transport will take right now;
        // anything left drains on the next write, flush, or read.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => (),
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => (),
            other => return other,
        }
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{compute_key, NoiseKeys};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn keypair() -> (NoiseKeys, NoiseKeys) {
        let k1 = compute_key(b"left noise");
        let k2 = compute_key(b"right noise");
        (
            NoiseKeys {
                write_key: k1,
                read_key: k2,
            },
            NoiseKeys {
                write_key: k2,
                read_key: k1,
            },
        )
    }

    #[tokio::test]
    async fn transparent_until_keys_installed() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = ScrambleStream::new(a);
        let mut b = ScrambleStream::new(b);

        a.write_all(b"hello").await.unwrap();
        a.flush().await.unwrap();
        let mut got = [0_u8; 5];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn scrambled_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = ScrambleStream::new(a);
        let mut b = ScrambleStream::new(b);
        let (ka, kb) = keypair();
        a.install_keys(ka);
        b.install_keys(kb);

        let payload: Vec<u8> = (0_u8..=255).cycle().take(40_000).collect();
        let expect = payload.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&payload).await.unwrap();
            a.flush().await.unwrap();
            a
        });
        let mut got = vec![0_u8; expect.len()];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expect);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn wire_bytes_are_not_plaintext() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut a = ScrambleStream::new(a);
        let (ka, _) = keypair();
        a.install_keys(ka);

        a.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        a.flush().await.unwrap();
        let mut got = [0_u8; 16];
        b.read_exact(&mut got).await.unwrap();
        assert_ne!(&got[..], b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = ScrambleStream::new(a);
        let mut b = ScrambleStream::new(b);
        let (ka, kb) = keypair();
        a.install_keys(ka);
        b.install_keys(kb);

        a.write_all(b"\x05\x01\x00rest").await.unwrap();
        a.flush().await.unwrap();

        let peeked = b.peek(1).await.unwrap();
        assert_eq!(peeked, b"\x05");
        let mut got = [0_u8; 7];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"\x05\x01\x00rest");
    }
}
