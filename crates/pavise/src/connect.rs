//! Outbound connection establishment.
//!
//! Turns a decoded target (literal IP or hostname) into a connected
//! [`ProxyStream`], honoring the v4/v6 policy, source binding, SO_MARK,
//! Happy Eyeballs racing, the region gate, and, when configured, a
//! chained upstream proxy reached over optional scramble and TLS layers.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use pavise_region::{RegionGate, RegionLookup, Verdict};
use pavise_scramble::ScrambleStream;
use pavise_socksproto::{
    Error as SocksError, SocksAddr, SocksClientHandshake, SocksClientVersion, SocksStatus,
    Truncated, UpstreamTarget,
};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

use crate::cfg::{proxy_default_port, AuthUser, ServerOptions};
use crate::stream::ProxyStream;

/// Delay between Happy Eyeballs attempts (RFC 8305's recommended value).
const EYEBALL_STAGGER: Duration = Duration::from_millis(250);

/// An error from the connector, classified so protocol drivers can map it
/// onto their wire-level refusals.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
    /// Name resolution failed.
    #[error("cannot resolve target: {0}")]
    Resolve(#[source] io::Error),

    /// Resolution produced no address the policy allows.
    #[error("no usable addresses for target")]
    NoAddresses,

    /// The region gate refused the target.
    #[error("target refused by region policy")]
    Denied,

    /// All TCP connection attempts failed.
    #[error("cannot connect: {0}")]
    Connect(#[source] io::Error),

    /// The TLS handshake toward the upstream failed.
    #[error("upstream TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    /// The noise handshake toward the upstream failed.
    #[error("upstream noise handshake failed: {0}")]
    Noise(#[source] pavise_scramble::Error),

    /// The upstream proxy refused or garbled the SOCKS handshake.
    #[error("upstream SOCKS handshake failed: {0}")]
    UpstreamSocks(#[source] SocksError),

    /// The upstream HTTP proxy answered CONNECT with a non-2xx.
    #[error("upstream HTTP proxy refused: {0}")]
    UpstreamHttp(String),

    /// Plain I/O trouble while talking to the upstream.
    #[error("upstream I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectError {
    /// The SOCKS5 REP code this error maps to.
    pub(crate) fn socks_status(&self) -> SocksStatus {
        match self {
            ConnectError::Denied => SocksStatus::NotAllowed,
            ConnectError::Resolve(_) | ConnectError::NoAddresses => SocksStatus::HostUnreachable,
            ConnectError::Connect(e) => classify_connect_error(e),
            ConnectError::UpstreamSocks(SocksError::UpstreamStatus(s)) => *s,
            _ => SocksStatus::GeneralFailure,
        }
    }
}

/// Map an OS connect error onto the SOCKS5 REP table.
fn classify_connect_error(e: &io::Error) -> SocksStatus {
    #[cfg(unix)]
    if let Some(errno) = e.raw_os_error() {
        match errno {
            libc::ECONNREFUSED => return SocksStatus::ConnectionRefused,
            libc::ENETUNREACH => return SocksStatus::NetworkUnreachable,
            libc::EHOSTUNREACH => return SocksStatus::HostUnreachable,
            libc::ETIMEDOUT => return SocksStatus::TtlExpired,
            _ => (),
        }
    }
    match e.kind() {
        io::ErrorKind::ConnectionRefused => SocksStatus::ConnectionRefused,
        io::ErrorKind::TimedOut => SocksStatus::TtlExpired,
        _ => SocksStatus::GeneralFailure,
    }
}

/// The region gate plus the geolocation collaborator behind it.
#[derive(Clone)]
pub(crate) struct RegionCtx {
    /// Parsed allow/deny rules.
    pub(crate) gate: Arc<RegionGate>,
    /// The database, when one was loaded.
    pub(crate) db: Option<Arc<dyn RegionLookup>>,
}

impl RegionCtx {
    /// Is this address admissible?
    fn admits(&self, ip: IpAddr) -> bool {
        let db = self.db.as_deref();
        self.gate.check(ip, db) == Verdict::Admit
    }
}

/// Everything needed to open outbound connections.
#[derive(Clone)]
pub(crate) struct Connector {
    /// Server options (bind policy, upstream, scramble, timeouts).
    options: Arc<ServerOptions>,
    /// TLS configuration for upstream handshakes.
    client_tls: Arc<rustls::ClientConfig>,
    /// Region gate.
    region: RegionCtx,
}

impl Connector {
    /// Create a connector.
    pub(crate) fn new(
        options: Arc<ServerOptions>,
        client_tls: Arc<rustls::ClientConfig>,
        region: RegionCtx,
    ) -> Self {
        Connector {
            options,
            client_tls,
            region,
        }
    }

    /// Open a connection to `addr:port` on behalf of `user`.
    ///
    /// Routes through the configured upstream proxy when one applies (the
    /// per-user override wins over the global one).
    pub(crate) async fn connect(
        &self,
        addr: &SocksAddr,
        port: u16,
        user: Option<&AuthUser>,
    ) -> Result<ProxyStream, ConnectError> {
        let upstream = user
            .and_then(|u| u.proxy_override.clone())
            .or_else(|| self.options.proxy_pass.clone());

        match upstream {
            Some(url) => self.connect_via_upstream(&url, addr, port).await,
            None => {
                let stream = self.connect_direct(addr, port).await?;
                Ok(ProxyStream::Tcp(stream))
            }
        }
    }

    /// Resolve and connect directly to the target.
    async fn connect_direct(
        &self,
        addr: &SocksAddr,
        port: u16,
    ) -> Result<TcpStream, ConnectError> {
        let candidates = self.resolve(addr, port).await?;

        // The region gate sees post-resolution addresses.
        let candidates: Vec<SocketAddr> = if self.region.gate.is_empty() {
            candidates
        } else {
            let admitted: Vec<SocketAddr> = candidates
                .into_iter()
                .filter(|sa| self.region.admits(sa.ip()))
                .collect();
            if admitted.is_empty() {
                return Err(ConnectError::Denied);
            }
            admitted
        };

        self.connect_candidates(candidates).await
    }

    /// Resolve a target into candidate socket addresses, filtered by the
    /// v4only/v6only policy.
    async fn resolve(
        &self,
        addr: &SocksAddr,
        port: u16,
    ) -> Result<Vec<SocketAddr>, ConnectError> {
        let all: Vec<SocketAddr> = match addr {
            SocksAddr::Ip(ip) => vec![SocketAddr::new(*ip, port)],
            SocksAddr::Hostname(host) => lookup_host((host.as_str(), port))
                .await
                .map_err(ConnectError::Resolve)?
                .collect(),
            _ => Vec::new(),
        };
        let filtered: Vec<SocketAddr> = all
            .into_iter()
            .filter(|sa| {
                if self.options.v4_only {
                    sa.is_ipv4()
                } else if self.options.v6_only {
                    sa.is_ipv6()
                } else {
                    true
                }
            })
            .collect();
        if filtered.is_empty() {
            return Err(ConnectError::NoAddresses);
        }
        Ok(filtered)
    }

    /// Connect to the first reachable candidate, racing them with a
    /// staggered start when Happy Eyeballs is on.
    async fn connect_candidates(
        &self,
        candidates: Vec<SocketAddr>,
    ) -> Result<TcpStream, ConnectError> {
        if self.options.happyeyeballs && candidates.len() > 1 {
            self.connect_race(candidates).await
        } else {
            let mut last = None;
            for sa in candidates {
                match self.connect_one(sa).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!("connect {} failed: {}", sa, e);
                        last = Some(e);
                    }
                }
            }
            Err(ConnectError::Connect(last.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no candidates")
            })))
        }
    }

    /// Happy Eyeballs: start attempts [`EYEBALL_STAGGER`] apart; first
    /// established connection wins and the rest are dropped.
    async fn connect_race(
        &self,
        candidates: Vec<SocketAddr>,
    ) -> Result<TcpStream, ConnectError> {
        let mut pending = candidates.into_iter();
        let mut attempts = FuturesUnordered::new();
        let mut last_err: Option<io::Error> = None;

        if let Some(sa) = pending.next() {
            attempts.push(self.connect_one_tagged(sa));
        }
        let mut stagger = tokio::time::interval(EYEBALL_STAGGER);
        stagger.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stagger.tick().await; // the first tick is immediate

        loop {
            tokio::select! {
                _ = stagger.tick() => {
                    if let Some(sa) = pending.next() {
                        attempts.push(self.connect_one_tagged(sa));
                    }
                }
                result = attempts.next(), if !attempts.is_empty() => {
                    match result {
                        Some((_, Ok(stream))) => return Ok(stream),
                        Some((sa, Err(e))) => {
                            debug!("connect {} failed: {}", sa, e);
                            last_err = Some(e);
                            if let Some(next) = pending.next() {
                                attempts.push(self.connect_one_tagged(next));
                            }
                        }
                        None => (),
                    }
                    if attempts.is_empty() && pending.len() == 0 {
                        break;
                    }
                }
            }
            if attempts.is_empty() && pending.len() == 0 {
                break;
            }
        }
        Err(ConnectError::Connect(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no candidates")
        })))
    }

    /// `connect_one`, tagged with its address for logging.
    async fn connect_one_tagged(
        &self,
        sa: SocketAddr,
    ) -> (SocketAddr, io::Result<TcpStream>) {
        (sa, self.connect_one(sa).await)
    }

    /// One TCP connection attempt, with source binding and SO_MARK.
    async fn connect_one(&self, sa: SocketAddr) -> io::Result<TcpStream> {
        let domain = if sa.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

        #[cfg(target_os = "linux")]
        if let Some(mark) = self.options.so_mark {
            socket.set_mark(mark)?;
        }

        if let Some(local) = self.options.local_ip {
            // Only bind when the family matches; otherwise the bind
            // address is unusable for this candidate.
            if local.is_ipv4() == sa.is_ipv4() {
                socket.bind(&socket2::SockAddr::from(SocketAddr::new(local, 0)))?;
            }
        }

        socket.set_nonblocking(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        socket.connect(sa).await
    }

    /// Connect through the upstream proxy named by `url`.
    async fn connect_via_upstream(
        &self,
        url: &Url,
        target: &SocksAddr,
        target_port: u16,
    ) -> Result<ProxyStream, ConnectError> {
        // Literal-IP targets can still be region-gated before we hand
        // them to the upstream; hostnames pass through unresolved.
        if let SocksAddr::Ip(ip) = target {
            if !self.region.gate.is_empty() && !self.region.admits(*ip) {
                return Err(ConnectError::Denied);
            }
        }

        let proxy_host = url.host_str().unwrap_or_default().to_owned();
        let proxy_port = proxy_default_port(url);

        let candidates = self
            .resolve(&proxy_addr_of(&proxy_host), proxy_port)
            .await?;
        let tcp = self.connect_candidates(candidates).await?;

        let use_tls = self.options.proxy_pass_ssl || url.scheme() == "https";

        // Scramble goes directly on the TCP socket, beneath TLS.
        let mut stream = if self.options.scramble {
            let mut scrambled = ScrambleStream::new(tcp);
            // Our noise must not look like a protocol the peer's detector
            // recognizes directly, or it would be misrouted.
            let keys = pavise_scramble::noise_handshake(
                &mut scrambled,
                self.options.noise_length,
                &crate::detect::PROTOCOL_BYTES,
            )
            .await
            .map_err(ConnectError::Noise)?;
            scrambled.install_keys(keys);
            debug!("upstream noise handshake complete");
            if use_tls {
                let tls = self.tls_handshake(scrambled, &proxy_host).await?;
                ProxyStream::UpstreamTlsScrambled(Box::new(tls))
            } else {
                ProxyStream::Scrambled(scrambled)
            }
        } else if use_tls {
            let tls = self.tls_handshake(tcp, &proxy_host).await?;
            ProxyStream::UpstreamTls(Box::new(tls))
        } else {
            ProxyStream::Tcp(tcp)
        };

        self.upstream_handshake(url, &mut stream, target, target_port)
            .await?;
        Ok(stream)
    }

    /// TLS client handshake toward the upstream.
    async fn tls_handshake<S>(
        &self,
        stream: S,
        proxy_host: &str,
    ) -> Result<tokio_rustls::client::TlsStream<S>, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sni = self
            .options
            .proxy_ssl_name
            .clone()
            .unwrap_or_else(|| proxy_host.to_owned());
        let name = ServerName::try_from(sni.clone()).map_err(|_| {
            ConnectError::Tls(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad SNI name: {}", sni),
            ))
        })?;
        let connector = TlsConnector::from(Arc::clone(&self.client_tls));
        connector
            .connect(name, stream)
            .await
            .map_err(ConnectError::Tls)
    }

    /// Speak the upstream proxy's protocol to request the real target.
    async fn upstream_handshake(
        &self,
        url: &Url,
        stream: &mut ProxyStream,
        target: &SocksAddr,
        target_port: u16,
    ) -> Result<(), ConnectError> {
        let auth = upstream_credentials(url);
        match url.scheme() {
            "socks5" | "socks4" | "socks4a" => {
                let version = match url.scheme() {
                    "socks4" => SocksClientVersion::Socks4,
                    "socks4a" => SocksClientVersion::Socks4a,
                    _ => SocksClientVersion::Socks5,
                };
                // Plain SOCKS4 cannot carry a hostname.
                let addr = if version == SocksClientVersion::Socks4 {
                    match target {
                        SocksAddr::Ip(IpAddr::V4(_)) => target.clone(),
                        _ => {
                            let resolved = self
                                .resolve(target, target_port)
                                .await?
                                .into_iter()
                                .find(|sa| sa.is_ipv4())
                                .ok_or(ConnectError::NoAddresses)?;
                            SocksAddr::Ip(resolved.ip())
                        }
                    }
                } else {
                    target.clone()
                };
                let hs = SocksClientHandshake::new(
                    version,
                    UpstreamTarget {
                        addr,
                        port: target_port,
                        auth,
                    },
                )
                .map_err(ConnectError::UpstreamSocks)?;
                drive_socks_client(stream, hs).await
            }
            "http" | "https" => {
                http_connect_handshake(stream, target, target_port, auth).await
            }
            other => {
                warn!("unsupported upstream scheme {} slipped through", other);
                Err(ConnectError::UpstreamHttp(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        }
    }
}

/// Extract percent-decoded credentials from an upstream proxy URL.
fn upstream_credentials(url: &Url) -> Option<(String, String)> {
    if url.username().is_empty() {
        return None;
    }
    let decode = |s: &str| {
        percent_encoding::percent_decode_str(s)
            .decode_utf8_lossy()
            .into_owned()
    };
    Some((
        decode(url.username()),
        decode(url.password().unwrap_or_default()),
    ))
}

/// A proxy host as a SocksAddr (literal IP or name to resolve).
fn proxy_addr_of(host: &str) -> SocksAddr {
    match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        Ok(ip) => SocksAddr::Ip(ip),
        Err(_) => SocksAddr::Hostname(host.to_owned()),
    }
}

/// Drive a SOCKS client handshake over `stream` to completion.
async fn drive_socks_client<S>(
    stream: &mut S,
    mut hs: SocksClientHandshake,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let action = match hs.handshake(&pending) {
            Err(Truncated) => {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(ConnectError::UpstreamSocks(SocksError::Syntax(
                        "upstream closed during SOCKS handshake",
                    )));
                }
                pending.extend_from_slice(&chunk[..n]);
                continue;
            }
            Ok(Err(e)) => return Err(ConnectError::UpstreamSocks(e)),
            Ok(Ok(action)) => action,
        };
        pending.drain(..action.drain);
        if !action.reply.is_empty() {
            stream.write_all(&action.reply).await?;
            stream.flush().await?;
        }
        if action.finished {
            return Ok(());
        }
    }
}

/// Issue an HTTP CONNECT to an upstream proxy and require a 2xx answer.
async fn http_connect_handshake<S>(
    stream: &mut S,
    target: &SocksAddr,
    port: u16,
    auth: Option<(String, String)>,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use base64::Engine as _;

    let authority = match target {
        SocksAddr::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, port),
        other => format!("{}:{}", other, port),
    };
    let mut req = format!(
        "CONNECT {authority} HTTP/1.1\r\n\
         Host: {authority}\r\n\
         Proxy-Connection: Keep-Alive\r\n\
         User-Agent: avpn/1.0\r\n"
    );
    if let Some((user, pass)) = auth {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        req.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await?;
    stream.flush().await?;

    // Read the response head only; anything after the blank line belongs
    // to the tunnel.
    let mut head = Vec::with_capacity(512);
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(ConnectError::UpstreamHttp(
                "oversized CONNECT response head".into(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ConnectError::UpstreamHttp(
                "upstream closed during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }
    let status_line = head
        .split(|&b| b == b'\r')
        .next()
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .unwrap_or(0);
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(ConnectError::UpstreamHttp(status_line))
    }
}
