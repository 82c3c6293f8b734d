//! Error types for SOCKS encoding and decoding.

use crate::msg::SocksStatus;

/// "The handshake cannot make progress until it has seen more bytes."
///
/// This is not a failure: the driver should read more data from the peer
/// and call the handshake again with the longer buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct Truncated;

/// An error that occurs while negotiating or encoding SOCKS.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer spoke a protocol version we do not implement.
    ///
    /// Carries the version byte, which detectors use to recognize clients
    /// that are not speaking SOCKS at all.
    #[error("peer asked for SOCKS version {0} which we do not implement")]
    BadProtocol(u8),

    /// A message violated the SOCKS grammar.
    #[error("malformed SOCKS message: {0}")]
    Syntax(&'static str),

    /// A variable-length field exceeded its protocol limit.
    #[error("SOCKS field too long: {0}")]
    FieldTooLong(&'static str),

    /// The username/password subnegotiation used a version we don't know.
    #[error("unsupported SOCKS authentication version {0}")]
    BadAuthVersion(u8),

    /// The peer offered no authentication method we can accept.
    #[error("no acceptable SOCKS authentication method offered")]
    NoAcceptableMethod,

    /// An upstream proxy rejected our client-side request.
    #[error("upstream proxy rejected request: {0}")]
    UpstreamStatus(SocksStatus),

    /// An upstream proxy rejected our authentication.
    #[error("upstream proxy rejected our credentials")]
    UpstreamAuthRejected,

    /// An upstream proxy demands credentials we were not configured with.
    #[error("upstream proxy requires credentials we do not have")]
    UpstreamAuthRequired,

    /// The handshake object was used after it finished.
    #[error("SOCKS handshake was already finished or failed")]
    AlreadyFinished,
}
