//! The HTTP engine: proxy requests and the camouflage web server.
//!
//! Any accepted connection whose first byte looks like an HTTP method
//! lands here.  CONNECT requests and absolute-URI requests with valid
//! proxy credentials are proxied; everything else is handed to the web
//! server, so an unauthenticated probe sees only a static site.

pub(crate) mod pages;
pub(crate) mod proxy;
pub(crate) mod web;
pub(crate) mod wire;

use std::net::IpAddr;

use anyhow::Result;
use base64::Engine as _;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cfg::{AuthUser, ServerOptions};
use crate::session::SessionCtx;
use crate::stream::ProxyStream;
use wire::{read_request, Request, WireError};

/// Cap on proxied request/response bodies we buffer.
pub(crate) const PROXY_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Result of checking a Basic authorization header.
#[derive(Clone, Debug)]
pub(crate) enum AuthOutcome {
    /// Credentials accepted (the matched user, or `None` when no users
    /// are configured and everything passes).
    Success(Option<AuthUser>),
    /// No credentials were presented.
    NoCredentials,
    /// The header was not a well-formed Basic token.
    Illegal,
    /// Credentials were presented and are wrong.
    Failed,
}

impl AuthOutcome {
    /// Convenience: did this authenticate?
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, AuthOutcome::Success(_))
    }
}

/// Validate a `Proxy-Authorization`/`Authorization` header value against
/// the configured users.
pub(crate) fn check_basic_auth(
    options: &ServerOptions,
    header: Option<&str>,
    peer: IpAddr,
) -> AuthOutcome {
    if options.auth_users.is_empty() {
        return AuthOutcome::Success(None);
    }
    let Some(header) = header else {
        return AuthOutcome::NoCredentials;
    };
    let Some((scheme, token)) = header.split_once(' ') else {
        return AuthOutcome::Illegal;
    };
    if !scheme.eq_ignore_ascii_case("Basic") {
        return AuthOutcome::Illegal;
    }
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(token.trim()) else {
        return AuthOutcome::Illegal;
    };
    let Some(colon) = decoded.iter().position(|&b| b == b':') else {
        return AuthOutcome::Illegal;
    };
    let (user, pass) = (&decoded[..colon], &decoded[colon + 1..]);

    match options.find_user(user, pass) {
        Some(found) => {
            if let Some(net) = &found.source {
                if !net.contains(&peer) {
                    debug!("user {} rejected by source restriction", found.username);
                    return AuthOutcome::Failed;
                }
            }
            AuthOutcome::Success(Some(found.clone()))
        }
        None => AuthOutcome::Failed,
    }
}

/// Entry point for connections the detector classified as HTTP.
pub(crate) async fn handle_http(
    ctx: &SessionCtx,
    mut stream: ProxyStream,
    buffered: Vec<u8>,
) -> Result<()> {
    let mut buf = buffered;
    let request = match read_request(&mut stream, &mut buf, PROXY_BODY_LIMIT).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(WireError::Io(e)) => {
            debug!("connection id: {}, http read: {}", ctx.id, e);
            return Ok(());
        }
        Err(e) => {
            warn!("connection id: {}, bad http request: {}", ctx.id, e);
            stream.write_all(&pages::raw_400_response()).await.ok();
            stream.flush().await.ok();
            return Ok(());
        }
    };

    debug!(
        "connection id: {}, method: {}, target: {}",
        ctx.id, request.method, request.target
    );

    if request.method.eq_ignore_ascii_case("CONNECT") {
        proxy::handle_connect(ctx, stream, request).await
    } else {
        proxy::handle_forward_or_web(ctx, stream, request, buf).await
    }
}

/// Is this target an absolute `http(s)://` URI (the forward-proxy form)?
pub(crate) fn is_absolute_uri(request: &Request) -> bool {
    let t = &request.target;
    let lower = t.get(..8).map(|p| p.to_ascii_lowercase()).unwrap_or_default();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::cfg::{ProxyArgs, ServerOptions};
    use clap::Parser;

    fn options(users: &[&str]) -> ServerOptions {
        let mut argv = vec!["pavise".to_owned()];
        for u in users {
            argv.push("--auth_users".to_owned());
            argv.push((*u).to_owned());
        }
        ServerOptions::from_args(&ProxyArgs::parse_from(argv)).unwrap()
    }

    #[test]
    fn no_users_means_open() {
        let opts = options(&[]);
        assert!(check_basic_auth(&opts, None, "127.0.0.1".parse().unwrap()).is_success());
    }

    #[test]
    fn basic_auth_outcomes() {
        let opts = options(&["jack:1111"]);
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        // base64("jack:1111") from the proxy handshake examples.
        let ok = check_basic_auth(&opts, Some("Basic amFjazoxMTEx"), peer);
        assert!(ok.is_success());
        match ok {
            AuthOutcome::Success(Some(user)) => assert_eq!(user.username, "jack"),
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            check_basic_auth(&opts, None, peer),
            AuthOutcome::NoCredentials
        ));
        assert!(matches!(
            check_basic_auth(&opts, Some("Bearer zzz"), peer),
            AuthOutcome::Illegal
        ));
        assert!(matches!(
            check_basic_auth(&opts, Some("Basic bm90OnJpZ2h0"), peer),
            AuthOutcome::Failed
        ));
    }

    #[test]
    fn source_restriction_applies() {
        let opts = options(&["jack:1111:10.0.0.0/8"]);
        let inside: IpAddr = "10.1.2.3".parse().unwrap();
        let outside: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(check_basic_auth(&opts, Some("Basic amFjazoxMTEx"), inside).is_success());
        assert!(matches!(
            check_basic_auth(&opts, Some("Basic amFjazoxMTEx"), outside),
            AuthOutcome::Failed
        ));
    }

    #[test]
    fn absolute_uri_detection() {
        let req = |target: &str| Request {
            method: "GET".into(),
            target: target.into(),
            version_minor: 1,
            headers: vec![],
            body: vec![],
        };
        assert!(is_absolute_uri(&req("http://example.com/")));
        assert!(is_absolute_uri(&req("HTTPS://example.com/x")));
        assert!(!is_absolute_uri(&req("/index.html")));
        assert!(!is_absolute_uri(&req("example.com:443")));
    }
}
