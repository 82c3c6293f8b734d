//! HTTP proxying: CONNECT tunnels and absolute-URI forwarding.

use std::net::IpAddr;

use anyhow::Result;
use pavise_socksproto::SocksAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::wire::{read_response_head, ResponseHead};
use super::{check_basic_auth, is_absolute_uri, pages, web, wire, AuthOutcome, PROXY_BODY_LIMIT};
use crate::relay::{relay, RelayConfig};
use crate::session::SessionCtx;
use crate::stream::ProxyStream;

/// Handle a CONNECT request: authenticate, connect, tunnel.
pub(crate) async fn handle_connect(
    ctx: &SessionCtx,
    mut stream: ProxyStream,
    request: wire::Request,
) -> Result<()> {
    let auth = check_basic_auth(
        &ctx.options,
        request.header("Proxy-Authorization"),
        ctx.peer.ip(),
    );
    let AuthOutcome::Success(user) = auth else {
        debug!("connection id: {}, proxy auth refused: {:?}", ctx.id, auth);
        stream.write_all(&pages::raw_407_response()).await.ok();
        stream.flush().await.ok();
        return Ok(());
    };

    let Some((host, port)) = split_authority(&request.target) else {
        warn!(
            "connection id: {}, illegal CONNECT target: {}",
            ctx.id, request.target
        );
        stream.write_all(&pages::raw_400_response()).await.ok();
        stream.flush().await.ok();
        return Ok(());
    };

    let addr = host_to_socks_addr(&host);
    let remote = match ctx.connector.connect(&addr, port, user.as_ref()).await {
        Ok(remote) => remote,
        Err(e) => {
            // The tunnel was never established; close without a reply.
            warn!(
                "connection id: {}, connect to target {}:{} error: {}",
                ctx.id, host, port, e
            );
            return Ok(());
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    stream.flush().await?;

    let cfg = RelayConfig {
        timeout: ctx.options.tcp_timeout,
        rate_limit: ctx
            .options
            .rate_limit_for(user.as_ref().map(|u| u.username.as_str())),
    };
    let (sent, received) = relay(stream, remote, &cfg, &ctx.abort).await;
    debug!(
        "connection id: {}, transfer completed, local to remote: {}, remote to local: {}",
        ctx.id, sent, received
    );
    Ok(())
}

/// Handle everything that is not CONNECT: forward absolute-URI requests
/// through the proxy, or fall back to the web server.
pub(crate) async fn handle_forward_or_web(
    ctx: &SessionCtx,
    mut stream: ProxyStream,
    first: wire::Request,
    buf: Vec<u8>,
) -> Result<()> {
    let mut request = first;
    let mut buf = buf;
    let mut remote: Option<ProxyStream> = None;
    let mut remote_buf: Vec<u8> = Vec::new();

    loop {
        let absolute = is_absolute_uri(&request);
        let auth = check_basic_auth(
            &ctx.options,
            request.header("Proxy-Authorization"),
            ctx.peer.ip(),
        );

        if !absolute || !auth.is_success() {
            if absolute {
                // A proxy attempt with bad credentials gets nothing that
                // would reveal a proxy lives here.
                debug!("connection id: {}, proxy auth refused: {:?}", ctx.id, auth);
                return Ok(());
            }
            return web::serve(ctx, stream, request, buf).await;
        }
        let user = match auth {
            AuthOutcome::Success(user) => user,
            _ => unreachable!("checked above"),
        };

        let Some(target) = ForwardTarget::parse(&request.target) else {
            warn!(
                "connection id: {}, illegal forward target: {}",
                ctx.id, request.target
            );
            return Ok(());
        };

        if remote.is_none() {
            let addr = host_to_socks_addr(&target.host);
            match ctx.connector.connect(&addr, target.port, user.as_ref()).await {
                Ok(r) => remote = Some(r),
                Err(e) => {
                    warn!(
                        "connection id: {}, connect to target {}:{} error: {}",
                        ctx.id, target.host, target.port, e
                    );
                    wire::Reply::new(502)
                        .header("Content-Type", "text/html")
                        .keep_alive(false)
                        .send(&mut stream, pages::BODY_502.as_bytes())
                        .await
                        .ok();
                    return Ok(());
                }
            }
            remote_buf.clear();
        }
        let upstream = remote.as_mut().expect("remote was just connected");

        let outbound = encode_forward_request(&request, &target);
        upstream.write_all(&outbound).await?;
        if !request.body.is_empty() {
            upstream.write_all(&request.body).await?;
        }
        upstream.flush().await?;

        let head = read_response_head(upstream, &mut remote_buf).await?;
        stream.write_all(&head.raw).await?;
        forward_body(upstream, &mut stream, &head, &mut remote_buf).await?;
        stream.flush().await?;

        let client_keep = request.keep_alive();
        debug!(
            "connection id: {}, forwarded {} {} -> {}",
            ctx.id, request.method, request.target, head.status
        );
        if !client_keep {
            break;
        }
        if !head.keep_alive {
            remote = None;
        }

        request = match wire::read_request(&mut stream, &mut buf, PROXY_BODY_LIMIT).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!("connection id: {}, keepalive read: {}", ctx.id, e);
                break;
            }
        };
    }
    Ok(())
}

/// A parsed absolute-URI forward target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ForwardTarget {
    /// Target host (no brackets).
    pub(crate) host: String,
    /// Target port, defaulted from the scheme.
    pub(crate) port: u16,
    /// Origin-form path (plus query) to use upstream.
    pub(crate) path: String,
}

impl ForwardTarget {
    /// Parse `http://host[:port]/path...`; returns None on junk.
    pub(crate) fn parse(target: &str) -> Option<ForwardTarget> {
        let (scheme, rest) = target.split_once("://")?;
        let default_port = match scheme.to_ascii_lowercase().as_str() {
            "http" => 80,
            "https" => 443,
            _ => return None,
        };
        // Split authority from path; strip any userinfo.
        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };
        let authority = authority.rsplit_once('@').map(|(_, a)| a).unwrap_or(authority);
        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            // Bracketed IPv6, optionally with a port.
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None => default_port,
            };
            (host.to_owned(), port)
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            (host.to_owned(), port.parse().ok()?)
        } else {
            (authority.to_owned(), default_port)
        };
        if host.is_empty() {
            return None;
        }
        Some(ForwardTarget {
            host,
            port,
            path: path.to_owned(),
        })
    }
}

/// Rewrite a proxy request into the origin-form request we send upstream.
///
/// `Proxy-*` headers are stripped, `Host` is pinned to the target, and a
/// missing `Connection` inherits the client's `Proxy-Connection`.
fn encode_forward_request(request: &wire::Request, target: &ForwardTarget) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(
        format!(
            "{} {} HTTP/1.{}\r\n",
            request.method, target.path, request.version_minor
        )
        .as_bytes(),
    );
    out.extend_from_slice(format!("Host: {}\r\n", target.host).as_bytes());

    let has_connection = request.header("Connection").is_some();
    let proxy_connection = request.header("Proxy-Connection").map(str::to_owned);

    for (name, value) in &request.headers {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("proxy-") || lower == "host" {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !has_connection {
        if let Some(pc) = proxy_connection {
            out.extend_from_slice(format!("Connection: {}\r\n", pc).as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Relay a response body from `upstream` to `client` according to the
/// head's framing.  `leftover` holds body bytes read past the head.
async fn forward_body<R, W>(
    upstream: &mut R,
    client: &mut W,
    head: &ResponseHead,
    leftover: &mut Vec<u8>,
) -> Result<(), wire::WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if head.chunked {
        forward_chunked(upstream, client, leftover).await
    } else if let Some(length) = head.content_length {
        forward_exact(upstream, client, leftover, length).await
    } else if !head.keep_alive {
        // EOF-delimited body.
        if !leftover.is_empty() {
            client.write_all(leftover).await?;
            leftover.clear();
        }
        let mut chunk = [0_u8; 16 * 1024];
        loop {
            let n = upstream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            client.write_all(&chunk[..n]).await?;
        }
    } else {
        // No length, no chunking, keep-alive: no body (1xx/204/304 etc).
        Ok(())
    }
}

/// Copy exactly `length` body bytes.
async fn forward_exact<R, W>(
    upstream: &mut R,
    client: &mut W,
    leftover: &mut Vec<u8>,
    length: u64,
) -> Result<(), wire::WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;

    let from_buf = (leftover.len() as u64).min(remaining) as usize;
    if from_buf > 0 {
        client.write_all(&leftover[..from_buf]).await?;
        leftover.drain(..from_buf);
        remaining -= from_buf as u64;
    }

    let mut chunk = [0_u8; 16 * 1024];
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = upstream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(wire::WireError::Io(
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        client.write_all(&chunk[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Relay a chunked body verbatim, tracking the chunk framing so we know
/// where the message ends.
async fn forward_chunked<R, W>(
    upstream: &mut R,
    client: &mut W,
    leftover: &mut Vec<u8>,
) -> Result<(), wire::WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_line(upstream, leftover).await?;
        client.write_all(&line).await?;

        let size_text = String::from_utf8_lossy(&line);
        let size_text = size_text.trim_end();
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let size =
            u64::from_str_radix(size_text, 16).map_err(|_| wire::WireError::Malformed)?;

        if size == 0 {
            // Trailers (if any), then the blank line ending the message.
            loop {
                let trailer = read_line(upstream, leftover).await?;
                client.write_all(&trailer).await?;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(());
                }
            }
        }

        // Chunk data plus its trailing CRLF.
        forward_exact(upstream, client, leftover, size + 2).await?;
    }
}

/// Read one `\n`-terminated line, consuming `leftover` first.
async fn read_line<R>(
    upstream: &mut R,
    leftover: &mut Vec<u8>,
) -> Result<Vec<u8>, wire::WireError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(32);
    loop {
        while let Some(&b) = leftover.first() {
            leftover.remove(0);
            line.push(b);
            if b == b'\n' {
                return Ok(line);
            }
        }
        if line.len() > 16 * 1024 {
            return Err(wire::WireError::Malformed);
        }
        let mut chunk = [0_u8; 4096];
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(wire::WireError::Io(
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        leftover.extend_from_slice(&chunk[..n]);
    }
}

/// Split a CONNECT authority (`host:port`, possibly `[v6]:port`).
pub(crate) fn split_authority(target: &str) -> Option<(String, u16)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_owned(), port));
    }
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_owned(), port.parse().ok()?))
}

/// Interpret a host string as a SOCKS address: literal IP or hostname.
pub(crate) fn host_to_socks_addr(host: &str) -> SocksAddr {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocksAddr::Ip(ip),
        Err(_) => SocksAddr::Hostname(host.to_owned()),
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn authority_splitting() {
        assert_eq!(
            split_authority("example.com:443"),
            Some(("example.com".to_owned(), 443))
        );
        assert_eq!(
            split_authority("[2001:db8::1]:8443"),
            Some(("2001:db8::1".to_owned(), 8443))
        );
        assert!(split_authority("example.com").is_none());
        assert!(split_authority(":443").is_none());
    }

    #[test]
    fn forward_target_parsing() {
        let t = ForwardTarget::parse("http://example.com/a/b?q=1").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 80);
        assert_eq!(t.path, "/a/b?q=1");

        let t = ForwardTarget::parse("https://example.com").unwrap();
        assert_eq!(t.port, 443);
        assert_eq!(t.path, "/");

        let t = ForwardTarget::parse("http://user:pw@example.com:8080/x").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 8080);

        let t = ForwardTarget::parse("http://[2001:db8::1]:8080/").unwrap();
        assert_eq!(t.host, "2001:db8::1");
        assert_eq!(t.port, 8080);

        assert!(ForwardTarget::parse("ftp://example.com/").is_none());
        assert!(ForwardTarget::parse("/plain/path").is_none());
    }

    #[test]
    fn forward_request_rewriting() {
        let request = wire::Request {
            method: "GET".into(),
            target: "http://example.com/".into(),
            version_minor: 1,
            headers: vec![
                ("Host".to_owned(), "proxy.local".to_owned()),
                ("Proxy-Authorization".to_owned(), "Basic xyz".to_owned()),
                ("Proxy-Connection".to_owned(), "Keep-Alive".to_owned()),
                ("Accept".to_owned(), "*/*".to_owned()),
            ],
            body: vec![],
        };
        let target = ForwardTarget::parse(&request.target).unwrap();
        let out = encode_forward_request(&request, &target);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(!text.contains("Proxy-Authorization"));
        assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
        assert!(text.contains("Connection: Keep-Alive\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
    }

    #[tokio::test]
    async fn chunked_forwarding() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, body).await.unwrap();
        drop(a);

        let mut out = Vec::new();
        let mut leftover = Vec::new();
        forward_chunked(&mut b, &mut out, &mut leftover).await.unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn exact_forwarding_uses_leftover() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"rld").await.unwrap();
        drop(a);

        let mut out = Vec::new();
        let mut leftover = b"wo".to_vec();
        forward_exact(&mut b, &mut out, &mut leftover, 5).await.unwrap();
        assert_eq!(out, b"world");
    }
}
