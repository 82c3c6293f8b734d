//! A multi-protocol proxy server that camouflages itself as a web server.
//!
//! One listening socket serves SOCKS4/4a, SOCKS5 and HTTP proxy clients
//! (CONNECT and absolute-URI forwarding).  Connections that speak plain
//! HTTP without a proxy request fall through to a built-in static web
//! server, so a probe cannot tell the listener apart from an ordinary
//! nginx box.  TLS is unwrapped in place when a ClientHello arrives, and
//! an optional noise-keyed scramble layer hides all of it behind
//! random-looking bytes.
//!
//! The crate is a binary; the library surface exists so the integration
//! tests can start a server in-process.

#![warn(noop_method_call)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::cognitive_complexity)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]

pub mod cfg;
pub mod server;

pub(crate) mod connect;
pub(crate) mod detect;
mod exit;
pub(crate) mod httpd;
pub(crate) mod limit;
pub(crate) mod relay;
pub(crate) mod session;
pub(crate) mod socks;
pub(crate) mod stream;
pub(crate) mod tlsconf;
pub mod trace;

pub use cfg::{ProxyArgs, ServerOptions};
pub use exit::wait_for_shutdown;
pub use server::{Server, ServerHandle};

/// The `Server:` header value every HTTP response carries.
///
/// Matching a stock nginx banner is part of the camouflage.
pub(crate) const VERSION_STRING: &str = "nginx/1.20.2";
