//! Encode and decode the SOCKS protocol.
//!
//! This crate handles the SOCKS wire protocol (versions 4, 4a and 5,
//! including RFC 1929 username/password authentication) without doing any
//! I/O of its own.  Both sides are implemented: [`SocksProxyHandshake`]
//! drives the server (proxy) side of a handshake, and
//! [`SocksClientHandshake`] drives the client side, which a proxy needs
//! when it chains through a further upstream proxy.
//!
//! The calling convention is buffer-in/action-out: the driver reads bytes
//! from its socket into a buffer and calls
//! [`handshake()`](SocksProxyHandshake::handshake) with everything not yet
//! consumed.  The result is either [`Truncated`] ("I need more bytes; read
//! again and retry with the longer buffer") or an [`Action`] telling the
//! driver how many bytes were consumed, what (if anything) to write to the
//! peer, and whether the handshake is over.  When the handshake finishes
//! successfully, [`into_request()`](SocksProxyHandshake::into_request)
//! yields the decoded [`SocksRequest`].
//!
//! Keeping the state machines free of sockets keeps every parser branch
//! unit-testable from byte fixtures.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::implicit_clone)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]

mod client;
mod err;
mod msg;
mod proxy;

pub use client::{SocksClientHandshake, SocksClientVersion, UpstreamTarget};
pub use err::{Error, Truncated};
pub use msg::{SocksAddr, SocksAuth, SocksCmd, SocksRequest, SocksStatus, SocksVersion};
pub use proxy::{AuthChecker, SocksProxyHandshake};

/// A buffer size that is always sufficient to hold one inbound SOCKS
/// handshake message.
///
/// (The largest message is an RFC 1929 authentication record: 513 bytes.)
pub const SOCKS_BUF_LEN: usize = 1024;

/// An action that a handshake party should take.
///
/// Returned by the `handshake` methods of [`SocksProxyHandshake`] and
/// [`SocksClientHandshake`].
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Action {
    /// Drop this many bytes from the front of the input buffer; the
    /// handshake has consumed them.
    pub drain: usize,
    /// Write these bytes to the peer before reading anything else.
    pub reply: Vec<u8>,
    /// If true, the handshake is over, successfully or not, and the party
    /// should stop feeding bytes in.
    pub finished: bool,
}
