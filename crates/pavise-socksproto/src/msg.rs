//! Message types and constants shared by the SOCKS client and proxy sides.

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::Error;

/// A major version of the SOCKS protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksVersion {
    /// SOCKS v4 (including the v4a hostname extension).
    V4,
    /// SOCKS v5.
    V5,
}

impl From<SocksVersion> for u8 {
    fn from(v: SocksVersion) -> u8 {
        match v {
            SocksVersion::V4 => 4,
            SocksVersion::V5 => 5,
        }
    }
}

impl TryFrom<u8> for SocksVersion {
    type Error = Error;
    fn try_from(v: u8) -> Result<SocksVersion, Error> {
        match v {
            4 => Ok(SocksVersion::V4),
            5 => Ok(SocksVersion::V5),
            _ => Err(Error::BadProtocol(v)),
        }
    }
}

/// A command in a SOCKS request.
///
/// This is an open enumeration: unrecognized command values are preserved
/// so a proxy can name them in its refusal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SocksCmd(u8);

impl SocksCmd {
    /// Open a TCP connection to the target.
    pub const CONNECT: SocksCmd = SocksCmd(1);
    /// Bind a listening socket (not supported by this implementation).
    pub const BIND: SocksCmd = SocksCmd(2);
    /// Relay UDP datagrams (SOCKS5 only; not supported by this
    /// implementation).
    pub const UDP_ASSOCIATE: SocksCmd = SocksCmd(3);

    /// Return the wire value for this command.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<u8> for SocksCmd {
    fn from(v: u8) -> SocksCmd {
        SocksCmd(v)
    }
}

impl Display for SocksCmd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            SocksCmd::CONNECT => write!(f, "CONNECT"),
            SocksCmd::BIND => write!(f, "BIND"),
            SocksCmd::UDP_ASSOCIATE => write!(f, "UDP_ASSOCIATE"),
            SocksCmd(other) => write!(f, "CMD_{}", other),
        }
    }
}

/// A status code, as used in SOCKS5 replies and mapped onto SOCKS4 CD
/// codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksStatus {
    /// RFC 1928: "succeeded".
    Succeeded,
    /// RFC 1928: "general SOCKS server failure".
    GeneralFailure,
    /// RFC 1928: "connection not allowed by ruleset".
    NotAllowed,
    /// RFC 1928: "Network unreachable".
    NetworkUnreachable,
    /// RFC 1928: "Host unreachable".
    HostUnreachable,
    /// RFC 1928: "Connection refused".
    ConnectionRefused,
    /// RFC 1928: "TTL expired".
    TtlExpired,
    /// RFC 1928: "Command not supported".
    CommandNotSupported,
    /// RFC 1928: "Address type not supported".
    AddrtypeNotSupported,
    /// A code from the unassigned range.
    Unassigned(u8),
}

impl SocksStatus {
    /// Encode this status as a SOCKS5 REP octet.
    pub fn into_socks5_code(self) -> u8 {
        use SocksStatus::*;
        match self {
            Succeeded => 0x00,
            GeneralFailure => 0x01,
            NotAllowed => 0x02,
            NetworkUnreachable => 0x03,
            HostUnreachable => 0x04,
            ConnectionRefused => 0x05,
            TtlExpired => 0x06,
            CommandNotSupported => 0x07,
            AddrtypeNotSupported => 0x08,
            Unassigned(v) => v,
        }
    }

    /// Decode a SOCKS5 REP octet.
    pub fn from_socks5_code(v: u8) -> SocksStatus {
        use SocksStatus::*;
        match v {
            0x00 => Succeeded,
            0x01 => GeneralFailure,
            0x02 => NotAllowed,
            0x03 => NetworkUnreachable,
            0x04 => HostUnreachable,
            0x05 => ConnectionRefused,
            0x06 => TtlExpired,
            0x07 => CommandNotSupported,
            0x08 => AddrtypeNotSupported,
            other => Unassigned(other),
        }
    }

    /// Encode this status as a SOCKS4 CD octet.
    ///
    /// SOCKS4 only distinguishes "granted", "rejected or failed", "cannot
    /// connect", and "ident rejected", so most SOCKS5 codes collapse.
    pub fn into_socks4_code(self) -> u8 {
        use SocksStatus::*;
        match self {
            Succeeded => 0x5A,
            NotAllowed => 0x5D,
            NetworkUnreachable | HostUnreachable | ConnectionRefused | TtlExpired
            | GeneralFailure => 0x5C,
            _ => 0x5B,
        }
    }

    /// Decode a SOCKS4 CD octet from an upstream reply.
    pub fn from_socks4_code(v: u8) -> SocksStatus {
        use SocksStatus::*;
        match v {
            0x5A => Succeeded,
            0x5C => HostUnreachable,
            0x5D => NotAllowed,
            _ => GeneralFailure,
        }
    }
}

impl Display for SocksStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use SocksStatus::*;
        let msg = match self {
            Succeeded => "succeeded",
            GeneralFailure => "general SOCKS server failure",
            NotAllowed => "connection not allowed by ruleset",
            NetworkUnreachable => "network unreachable",
            HostUnreachable => "host unreachable",
            ConnectionRefused => "connection refused",
            TtlExpired => "TTL expired",
            CommandNotSupported => "command not supported",
            AddrtypeNotSupported => "address type not supported",
            Unassigned(v) => return write!(f, "unassigned status 0x{:02x}", v),
        };
        write!(f, "{}", msg)
    }
}

/// An address as sent in a SOCKS request: either a literal IP address, or
/// a hostname the proxy is expected to resolve.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksAddr {
    /// A literal IP address.
    Ip(IpAddr),
    /// A hostname, at most 255 bytes long.
    Hostname(String),
}

impl SocksAddr {
    /// Construct a hostname address, enforcing the SOCKS5 length limit.
    pub fn hostname(name: impl Into<String>) -> Result<SocksAddr, Error> {
        let name = name.into();
        if name.len() > 255 {
            return Err(Error::FieldTooLong("hostname"));
        }
        Ok(SocksAddr::Hostname(name))
    }
}

impl Display for SocksAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(ip) => write!(f, "{}", ip),
            SocksAddr::Hostname(h) => write!(f, "{}", h),
        }
    }
}

/// Authentication information from a SOCKS handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksAuth {
    /// No authentication was performed (SOCKS5 method 0).
    NoAuth,
    /// RFC 1929 username and password (SOCKS5 method 2).
    Username(Vec<u8>, Vec<u8>),
    /// The user-id field from a SOCKS4 request.  SOCKS4 has no password.
    Socks4Ident(Vec<u8>),
}

/// A completed SOCKS proxy request, as decoded by a
/// [`SocksProxyHandshake`](crate::SocksProxyHandshake).
#[derive(Clone, Debug)]
pub struct SocksRequest {
    /// Protocol version the client spoke.
    version: SocksVersion,
    /// The requested command.
    cmd: SocksCmd,
    /// The requested target address.
    addr: SocksAddr,
    /// The requested target port.
    port: u16,
    /// How the client authenticated.
    auth: SocksAuth,
    /// The DSTIP field of a SOCKS4 request, echoed in every SOCKS4 reply.
    ///
    /// For SOCKS4a this is the 0.0.0.x marker, which the reply echoes too.
    v4_dstip: Option<Ipv4Addr>,
}

impl SocksRequest {
    /// Construct a request.  Used by the handshake machines.
    pub(crate) fn new(
        version: SocksVersion,
        cmd: SocksCmd,
        addr: SocksAddr,
        port: u16,
        auth: SocksAuth,
        v4_dstip: Option<Ipv4Addr>,
    ) -> SocksRequest {
        SocksRequest {
            version,
            cmd,
            addr,
            port,
            auth,
            v4_dstip,
        }
    }

    /// Return the protocol version the client used.
    pub fn version(&self) -> SocksVersion {
        self.version
    }

    /// Return the command the client asked for.
    pub fn command(&self) -> SocksCmd {
        self.cmd
    }

    /// Return the target address.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }

    /// Return the target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the authentication the client presented.
    pub fn auth(&self) -> &SocksAuth {
        &self.auth
    }

    /// Encode a reply to this request.
    ///
    /// For SOCKS5, on success the caller should pass the locally bound
    /// address of the outbound socket as `addr`; the reply's ATYP then
    /// matches its family.  With `addr` absent the reply is zero-filled
    /// (IPv4 0.0.0.0:0), which is what failures send.
    ///
    /// SOCKS4 replies always echo the request's DSTPORT and DSTIP, so
    /// `addr` and `port` are ignored there.
    pub fn reply(&self, status: SocksStatus, addr: Option<&SocksAddr>, port: u16) -> Vec<u8> {
        match self.version {
            SocksVersion::V5 => encode_socks5_reply(status, addr, port),
            SocksVersion::V4 => {
                encode_socks4_reply(status, self.v4_dstip.unwrap_or(Ipv4Addr::UNSPECIFIED), self.port)
            }
        }
    }
}

/// Encode a SOCKS5 `VER REP RSV ATYP BND.ADDR BND.PORT` reply.
fn encode_socks5_reply(status: SocksStatus, addr: Option<&SocksAddr>, port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.push(5);
    out.push(status.into_socks5_code());
    out.push(0);
    match addr {
        Some(SocksAddr::Ip(IpAddr::V4(ip))) => {
            out.push(1);
            out.extend_from_slice(&ip.octets());
        }
        Some(SocksAddr::Ip(IpAddr::V6(ip))) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
        Some(SocksAddr::Hostname(h)) => {
            out.push(3);
            // Length is enforced at construction.
            out.push(h.len() as u8);
            out.extend_from_slice(h.as_bytes());
        }
        None => {
            out.push(1);
            out.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    out
}

/// Encode a SOCKS4 `VN CD DSTPORT DSTIP` reply.
fn encode_socks4_reply(status: SocksStatus, dstip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push(0);
    out.push(status.into_socks4_code());
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(&dstip.octets());
    out
}

/// Parse a 16-byte slice into an IPv6 address.
pub(crate) fn ipv6_from_slice(b: &[u8]) -> Ipv6Addr {
    let mut octets = [0_u8; 16];
    octets.copy_from_slice(b);
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for v in 0..=10_u8 {
            assert_eq!(SocksStatus::from_socks5_code(v).into_socks5_code(), v);
        }
    }

    #[test]
    fn socks4_mapping() {
        assert_eq!(SocksStatus::Succeeded.into_socks4_code(), 0x5A);
        assert_eq!(SocksStatus::CommandNotSupported.into_socks4_code(), 0x5B);
        assert_eq!(SocksStatus::ConnectionRefused.into_socks4_code(), 0x5C);
        assert_eq!(SocksStatus::NotAllowed.into_socks4_code(), 0x5D);
    }

    #[test]
    fn reply_encoding_v5() {
        let req = SocksRequest::new(
            SocksVersion::V5,
            SocksCmd::CONNECT,
            SocksAddr::Ip("192.0.2.7".parse().unwrap()),
            443,
            SocksAuth::NoAuth,
            None,
        );
        let bound = SocksAddr::Ip("10.0.0.1".parse().unwrap());
        assert_eq!(
            req.reply(SocksStatus::Succeeded, Some(&bound), 4000),
            vec![5, 0, 0, 1, 10, 0, 0, 1, 0x0F, 0xA0]
        );
        // Failures zero-fill as IPv4.
        assert_eq!(
            req.reply(SocksStatus::ConnectionRefused, None, 0),
            vec![5, 5, 0, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn reply_encoding_v4() {
        let req = SocksRequest::new(
            SocksVersion::V4,
            SocksCmd::CONNECT,
            SocksAddr::Ip("127.0.0.1".parse().unwrap()),
            80,
            SocksAuth::Socks4Ident(b"jack".to_vec()),
            Some("127.0.0.1".parse().unwrap()),
        );
        // The DSTPORT/DSTIP echo ignores whatever the driver passes.
        assert_eq!(
            req.reply(SocksStatus::Succeeded, None, 0),
            vec![0, 0x5A, 0, 80, 127, 0, 0, 1]
        );
    }

    #[test]
    fn hostname_length_cap() {
        assert!(SocksAddr::hostname("x".repeat(255)).is_ok());
        assert!(SocksAddr::hostname("x".repeat(256)).is_err());
    }

    #[test]
    fn cmd_display() {
        assert_eq!(SocksCmd::CONNECT.to_string(), "CONNECT");
        assert_eq!(SocksCmd::from(9).to_string(), "CMD_9");
    }
}
