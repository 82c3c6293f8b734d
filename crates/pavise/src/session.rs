//! Per-connection session state and dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cfg::ServerOptions;
use crate::connect::Connector;
use crate::detect::{self, Detected};
use crate::{httpd, socks};

/// Everything a connection's protocol drivers need to see.
pub(crate) struct SessionCtx {
    /// Monotonically increasing connection id, for log correlation.
    pub(crate) id: u64,
    /// Server options.
    pub(crate) options: Arc<ServerOptions>,
    /// The outbound connector.
    pub(crate) connector: Connector,
    /// The client's socket address, as accepted.
    pub(crate) peer: SocketAddr,
    /// Cancelled when this session (or the whole server) must stop.
    pub(crate) abort: CancellationToken,
}

/// Run one accepted connection to completion.
///
/// Detection decides the protocol; the matching driver takes the stream
/// from there.  Cancellation of `ctx.abort` races the whole thing and
/// drops both sockets.
pub(crate) async fn run_session(
    ctx: SessionCtx,
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
        debug!("connection id: {}, set_keepalive: {}", ctx.id, e);
    }

    let abort = ctx.abort.clone();
    let work = async {
        match detect::detect(&ctx, stream, tls.as_ref()).await? {
            Detected::Socks(stream, buffered) => socks::handle_socks(&ctx, stream, buffered).await,
            Detected::Http(stream, buffered) => {
                httpd::handle_http(&ctx, stream, buffered).await
            }
            Detected::Close => Ok(()),
        }
    };

    tokio::select! {
        _ = abort.cancelled() => {
            debug!("connection id: {}, aborted", ctx.id);
            Ok(())
        }
        result = work => result,
    }
}
