//! The SOCKS driver: runs the server-side handshake, authenticates,
//! connects outward, and relays.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use pavise_socksproto::{
    Action, AuthChecker, Error as SocksError, SocksAddr, SocksAuth, SocksCmd,
    SocksProxyHandshake, SocksRequest, SocksStatus, Truncated, SOCKS_BUF_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cfg::AuthUser;
use crate::relay::{relay, RelayConfig};
use crate::session::SessionCtx;
use crate::stream::ProxyStream;

/// Handle one connection the detector classified as SOCKS.
///
/// `inbuf` carries any bytes the detector already consumed.
pub(crate) async fn handle_socks(
    ctx: &SessionCtx,
    mut stream: ProxyStream,
    inbuf: Vec<u8>,
) -> Result<()> {
    // When users are configured, the handshake calls back into us to
    // validate credentials; the matched user is captured on the side so
    // we can honor its rate limit and upstream override afterwards.
    let matched: Arc<Mutex<Option<AuthUser>>> = Arc::new(Mutex::new(None));
    let mut handshake = if ctx.options.auth_users.is_empty() {
        SocksProxyHandshake::new()
    } else {
        let options = Arc::clone(&ctx.options);
        let peer_ip = ctx.peer.ip();
        let matched = Arc::clone(&matched);
        let checker: AuthChecker = Box::new(move |auth| {
            let user = match auth {
                SocksAuth::Username(user, pass) => options.find_user(user, pass),
                SocksAuth::Socks4Ident(ident) => options.find_user_by_name(ident),
                _ => None,
            };
            match user {
                Some(user) => {
                    if let Some(net) = &user.source {
                        if !net.contains(&peer_ip) {
                            debug!(
                                "user {} rejected by source restriction",
                                user.username
                            );
                            return false;
                        }
                    }
                    *matched.lock().expect("auth lock poisoned") = Some(user.clone());
                    true
                }
                None => false,
            }
        });
        SocksProxyHandshake::with_auth(checker)
    };

    // Drive the handshake: read, step, drain, reply, repeat.
    let mut buf = [0_u8; SOCKS_BUF_LEN];
    let mut n_read = inbuf.len().min(buf.len());
    buf[..n_read].copy_from_slice(&inbuf[..n_read]);

    let request = loop {
        let action: Action = match handshake.handshake(&buf[..n_read]) {
            Err(Truncated) => {
                if n_read == buf.len() {
                    return Err(anyhow!("SOCKS handshake did not fit in {} bytes", buf.len()));
                }
                let n = stream
                    .read(&mut buf[n_read..])
                    .await
                    .context("error while reading SOCKS handshake")?;
                if n == 0 {
                    debug!("connection id: {}, EOF during SOCKS handshake", ctx.id);
                    return Ok(());
                }
                n_read += n;
                continue;
            }
            Ok(Err(SocksError::BadProtocol(version))) => {
                // Not SOCKS at all; close without a reply.
                debug!(
                    "connection id: {}, not a SOCKS client (first byte {:#x})",
                    ctx.id, version
                );
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(action)) => action,
        };

        if action.drain > 0 {
            buf.copy_within(action.drain..n_read, 0);
            n_read -= action.drain;
        }
        if !action.reply.is_empty() {
            write_all_and_flush(&mut stream, &action.reply).await?;
        }
        if action.finished {
            break handshake.into_request();
        }
    };

    let Some(request) = request else {
        // The handshake already refused the client on the wire.
        debug!("connection id: {}, SOCKS handshake refused", ctx.id);
        return Ok(());
    };

    let addr = request.addr().clone();
    let port = request.port();
    debug!(
        "connection id: {}, socks request: {} {}:{}",
        ctx.id,
        request.command(),
        addr,
        port
    );

    if request.command() != SocksCmd::CONNECT {
        // BIND and UDP ASSOCIATE are recognized but unsupported.
        warn!(
            "connection id: {}, {} is unsupported",
            ctx.id,
            request.command()
        );
        let reply = request.reply(SocksStatus::CommandNotSupported, None, 0);
        write_all_and_close(&mut stream, &reply).await?;
        return Ok(());
    }

    let user = matched.lock().expect("auth lock poisoned").clone();
    let remote = match ctx.connector.connect(&addr, port, user.as_ref()).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(
                "connection id: {}, connect to target {}:{} error: {}",
                ctx.id, addr, port, e
            );
            return reply_error(&mut stream, &request, e.socks_status()).await;
        }
    };

    // Tell the client where we bound, and start moving bytes.
    let bound = remote.local_addr().ok();
    let (bound_addr, bound_port) = match bound {
        Some(sa) => (Some(SocksAddr::Ip(sa.ip())), sa.port()),
        None => (None, 0),
    };
    let reply = request.reply(SocksStatus::Succeeded, bound_addr.as_ref(), bound_port);
    write_all_and_flush(&mut stream, &reply).await?;

    debug!("connection id: {}, connected, start transfer", ctx.id);
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

/// Write `data` and flush.
async fn write_all_and_flush<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(data)
        .await
        .context("error while writing SOCKS reply")?;
    writer
        .flush()
        .await
        .context("error while flushing SOCKS stream")
}

/// Write `data`, then shut the stream down.
async fn write_all_and_close<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(data)
        .await
        .context("error while writing SOCKS reply")?;
    writer
        .shutdown()
        .await
        .context("error while closing SOCKS stream")
}

/// Send a failure reply and close.
async fn reply_error(
    stream: &mut ProxyStream,
    request: &SocksRequest,
    status: SocksStatus,
) -> Result<()> {
    let reply = request.reply(status, None, 0);
    // If writing the refusal fails there is nothing left to salvage.
    let _ = write_all_and_close(stream, &reply).await;
    Ok(())
}
