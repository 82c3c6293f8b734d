//! The listening server: acceptor pool, session registry, shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use pavise_region::{RegionGate, RegionLookup};
use slab::Slab;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cfg::{Listen, ServerOptions};
use crate::connect::{Connector, RegionCtx};
use crate::session::{run_session, SessionCtx};
use crate::tlsconf;

/// Acceptor tasks sharing each listening socket.
const ACCEPT_LOOPS: usize = 32;

/// Source of monotonically increasing connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live session in the registry.
#[derive(Debug)]
struct SessionEntry {
    /// Connection id (for logs).
    id: u64,
    /// Cancelling this aborts the session.
    abort: CancellationToken,
}

/// The registry of live sessions, keyed by a slab arena index.
type Registry = Arc<Mutex<Slab<SessionEntry>>>;

/// A bound-but-not-yet-running proxy server.
pub struct Server {
    /// Resolved options.
    options: Arc<ServerOptions>,
    /// Server-side TLS, when certificates were configured.
    tls: Option<TlsAcceptor>,
    /// Shared outbound connector.
    connector: Connector,
    /// The bound listeners.
    listeners: Vec<TcpListener>,
    /// Their actual local addresses (useful with port 0).
    local_addrs: Vec<SocketAddr>,
    /// Cancelled to stop accepting and abort every session.
    shutdown: CancellationToken,
    /// Live sessions.
    registry: Registry,
}

/// A handle that can stop a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    /// The server's shutdown token.
    shutdown: CancellationToken,
    /// The server's session registry.
    registry: Registry,
}

impl ServerHandle {
    /// Stop accepting and abort every live session.
    pub fn close(&self) {
        self.shutdown.cancel();
        let registry = self.registry.lock().expect("registry poisoned");
        for (_, entry) in registry.iter() {
            debug!("closing session, connection id: {}", entry.id);
            entry.abort.cancel();
        }
    }
}

impl Server {
    /// Bind listeners and prepare to serve.
    pub async fn bind(options: ServerOptions) -> Result<Server> {
        Server::bind_with_lookup(options, None).await
    }

    /// Like [`bind`](Self::bind), with an injected geolocation database
    /// for the region gate.
    pub async fn bind_with_lookup(
        options: ServerOptions,
        region_db: Option<Arc<dyn RegionLookup>>,
    ) -> Result<Server> {
        let options = Arc::new(options);

        let tls = tlsconf::load_server_config(options.ssl_certificate_dir.as_deref())?
            .map(TlsAcceptor::from);
        if tls.is_some() {
            info!("TLS certificates loaded; ClientHello unwrapping enabled");
        }

        let gate = RegionGate::from_options(
            options.allow_region.iter().map(String::as_str),
            options.deny_region.iter().map(String::as_str),
        )
        .context("bad allow_region/deny_region rules")?;
        if !gate.is_empty() && region_db.is_none() {
            if let Some(db) = &options.ipip_db {
                warn!(
                    "region rules configured; tag rules are inert until a \
                     geolocation database is attached (configured path: {})",
                    db.display()
                );
            }
        }
        let region = RegionCtx {
            gate: Arc::new(gate),
            db: region_db,
        };

        let client_tls = tlsconf::client_config(options.ssl_cacert_dir.as_deref())?;
        let connector = Connector::new(Arc::clone(&options), client_tls, region);

        let mut listeners = Vec::new();
        let mut local_addrs = Vec::new();
        for listen in &options.listens {
            let listener = bind_listener(listen, options.reuse_port)
                .with_context(|| format!("cannot listen on {}", listen.addr))?;
            let local = listener.local_addr()?;
            info!("listening on {}", local);
            local_addrs.push(local);
            listeners.push(listener);
        }
        if listeners.is_empty() {
            return Err(anyhow!("no listeners could be opened"));
        }

        Ok(Server {
            options,
            tls,
            connector,
            listeners,
            local_addrs,
            shutdown: CancellationToken::new(),
            registry: Arc::new(Mutex::new(Slab::new())),
        })
    }

    /// Where we ended up listening.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// A handle for stopping the server from elsewhere.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Serve until [`ServerHandle::close`] is called.
    pub async fn run(self) -> Result<()> {
        let mut acceptors = Vec::new();
        for listener in self.listeners {
            let listener = Arc::new(listener);
            for _ in 0..ACCEPT_LOOPS {
                let listener = Arc::clone(&listener);
                let options = Arc::clone(&self.options);
                let connector = self.connector.clone();
                let tls = self.tls.clone();
                let shutdown = self.shutdown.clone();
                let registry = Arc::clone(&self.registry);
                acceptors.push(tokio::spawn(accept_loop(
                    listener, options, connector, tls, shutdown, registry,
                )));
            }
        }

        self.shutdown.cancelled().await;
        for acceptor in acceptors {
            acceptor.abort();
        }
        info!("server stopped");
        Ok(())
    }
}

/// One acceptor task.
async fn accept_loop(
    listener: Arc<TcpListener>,
    options: Arc<ServerOptions>,
    connector: Connector,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    registry: Registry,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if accept_err_is_fatal(&e) {
                    error!("acceptor failed: {}", e);
                    shutdown.cancel();
                    break;
                }
                warn!("incoming stream failed: {}", e);
                continue;
            }
        };

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("client incoming, connection id: {}, client: {}", id, peer);

        let abort = shutdown.child_token();
        let key = {
            let mut registry = registry.lock().expect("registry poisoned");
            registry.insert(SessionEntry {
                id,
                abort: abort.clone(),
            })
        };

        let ctx = SessionCtx {
            id,
            options: Arc::clone(&options),
            connector: connector.clone(),
            peer,
            abort,
        };
        let tls = tls.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = run_session(ctx, stream, tls).await {
                debug!("connection id: {}, session ended with error: {:#}", id, e);
            }
            registry.lock().expect("registry poisoned").remove(key);
        });
    }
}

/// Bind one listening socket, with SO_REUSEPORT and IPV6_V6ONLY as
/// configured.
fn bind_listener(listen: &Listen, reuse_port: bool) -> Result<TcpListener> {
    let domain = if listen.addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket =
        socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    if listen.addr.is_ipv6() {
        socket.set_only_v6(listen.v6_only)?;
    }
    socket.bind(&socket2::SockAddr::from(listen.addr))?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Is this accept() error fatal for the acceptor?
///
/// Running out of file descriptors is transient; most other errors on
/// the listening socket are not.
fn accept_err_is_fatal(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        !matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        true
    }
}

