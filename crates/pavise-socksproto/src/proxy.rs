//! The proxy (server) side of a SOCKS handshake.

use std::net::{IpAddr, Ipv4Addr};

use crate::err::{Error, Truncated};
use crate::msg::{ipv6_from_slice, SocksAddr, SocksAuth, SocksCmd, SocksRequest, SocksVersion};
use crate::Action;

/// SOCKS5 method octet: no authentication.
const METHOD_NO_AUTH: u8 = 0x00;
/// SOCKS5 method octet: RFC 1929 username/password.
const METHOD_USERPASS: u8 = 0x02;
/// SOCKS5 method octet: no acceptable method.
const METHOD_UNACCEPTABLE: u8 = 0xFF;

/// A callback deciding whether presented credentials are acceptable.
///
/// Receives [`SocksAuth::Username`] for RFC 1929 subnegotiations and
/// [`SocksAuth::Socks4Ident`] for SOCKS4 requests.
pub type AuthChecker = Box<dyn Fn(&SocksAuth) -> bool + Send + Sync>;

/// State machine for the server side of a SOCKS handshake.
///
/// Feed unconsumed input bytes to [`handshake()`](Self::handshake) until an
/// [`Action`] with `finished` set comes back, performing the drains and
/// writes each action asks for.  Then call
/// [`into_request()`](Self::into_request); `None` means the handshake
/// ended in a refusal that has already been written to the peer.
pub struct SocksProxyHandshake {
    /// Where we are in the handshake.
    state: State,
    /// If true, only the username/password method is acceptable in the
    /// SOCKS5 method negotiation.
    require_auth: bool,
    /// Credential validation callback, if any.
    check_auth: Option<AuthChecker>,
    /// Authentication accepted earlier in the handshake.
    auth: SocksAuth,
    /// The completed request, once we have one.
    request: Option<SocksRequest>,
}

/// Handshake states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Waiting for the first message (greeting or whole SOCKS4 request).
    Initial,
    /// SOCKS5: method chosen was username/password; waiting for the
    /// RFC 1929 record.
    Socks5WaitAuth,
    /// SOCKS5: waiting for the request message.
    Socks5WaitRequest,
    /// Handshake finished with a usable request.
    Done,
    /// Handshake finished with a refusal already encoded to the peer.
    Failed,
}

impl SocksProxyHandshake {
    /// Create a handshake that does not require authentication.
    ///
    /// Clients that insist on username/password anyway are accepted with
    /// any credentials, which is what an open proxy does.
    pub fn new() -> Self {
        SocksProxyHandshake {
            state: State::Initial,
            require_auth: false,
            check_auth: None,
            auth: SocksAuth::NoAuth,
            request: None,
        }
    }

    /// Create a handshake that requires authentication, validated by
    /// `check_auth`.
    pub fn with_auth(check_auth: AuthChecker) -> Self {
        SocksProxyHandshake {
            state: State::Initial,
            require_auth: true,
            check_auth: Some(check_auth),
            auth: SocksAuth::NoAuth,
            request: None,
        }
    }

    /// Try to advance the handshake, given `input` as the bytes received
    /// from the client and not yet drained.
    ///
    /// Returns `Err(Truncated)` when more input is needed.
    pub fn handshake(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        match self.state {
            State::Initial => match input.first() {
                None => Err(Truncated),
                Some(5) => self.s5_greeting(input),
                Some(4) => self.s4_request(input),
                Some(&v) => Ok(Err(Error::BadProtocol(v))),
            },
            State::Socks5WaitAuth => self.s5_auth(input),
            State::Socks5WaitRequest => self.s5_request(input),
            State::Done | State::Failed => Ok(Err(Error::AlreadyFinished)),
        }
    }

    /// Consume the handshake and return the decoded request, if the
    /// handshake succeeded.
    pub fn into_request(self) -> Option<SocksRequest> {
        self.request
    }

    /// Run the credential callback, accepting everything if none is set.
    fn creds_ok(&self, auth: &SocksAuth) -> bool {
        match &self.check_auth {
            Some(f) => f(auth),
            None => true,
        }
    }

    /// Handle a SOCKS5 `VER NMETHODS METHODS` greeting.
    fn s5_greeting(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 2 {
            return Err(Truncated);
        }
        let n_methods = usize::from(input[1]);
        if n_methods == 0 {
            return Ok(Err(Error::Syntax("SOCKS5 greeting offered no methods")));
        }
        if input.len() < 2 + n_methods {
            return Err(Truncated);
        }
        let methods = &input[2..2 + n_methods];

        // Pick the first offered method we can accept, like the reference
        // servers do.
        let acceptable: &[u8] = if self.require_auth {
            &[METHOD_USERPASS]
        } else {
            &[METHOD_NO_AUTH, METHOD_USERPASS]
        };
        let chosen = methods
            .iter()
            .copied()
            .find(|m| acceptable.contains(m))
            .unwrap_or(METHOD_UNACCEPTABLE);

        let action = Action {
            drain: 2 + n_methods,
            reply: vec![5, chosen],
            finished: chosen == METHOD_UNACCEPTABLE,
        };
        self.state = match chosen {
            METHOD_USERPASS => State::Socks5WaitAuth,
            METHOD_NO_AUTH => State::Socks5WaitRequest,
            _ => State::Failed,
        };
        Ok(Ok(action))
    }

    /// Handle an RFC 1929 `VER ULEN UNAME PLEN PASSWD` record.
    fn s5_auth(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 2 {
            return Err(Truncated);
        }
        if input[0] != 1 {
            return Ok(Err(Error::BadAuthVersion(input[0])));
        }
        let ulen = usize::from(input[1]);
        if ulen == 0 {
            return Ok(Err(Error::Syntax("empty SOCKS5 username")));
        }
        if input.len() < 2 + ulen + 1 {
            return Err(Truncated);
        }
        let uname = &input[2..2 + ulen];
        let plen = usize::from(input[2 + ulen]);
        if plen == 0 {
            return Ok(Err(Error::Syntax("empty SOCKS5 password")));
        }
        let total = 2 + ulen + 1 + plen;
        if input.len() < total {
            return Err(Truncated);
        }
        let passwd = &input[2 + ulen + 1..total];

        let auth = SocksAuth::Username(uname.to_vec(), passwd.to_vec());
        if self.creds_ok(&auth) {
            self.auth = auth;
            self.state = State::Socks5WaitRequest;
            Ok(Ok(Action {
                drain: total,
                reply: vec![1, 0],
                finished: false,
            }))
        } else {
            self.state = State::Failed;
            Ok(Ok(Action {
                drain: total,
                reply: vec![1, 1],
                finished: true,
            }))
        }
    }

    /// Handle a SOCKS5 `VER CMD RSV ATYP ADDR PORT` request.
    fn s5_request(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 4 {
            return Err(Truncated);
        }
        if input[0] != 5 {
            return Ok(Err(Error::Syntax("bad version in SOCKS5 request")));
        }
        let cmd = SocksCmd::from(input[1]);
        let atyp = input[3];
        let (addr, addr_end) = match atyp {
            1 => {
                if input.len() < 4 + 4 + 2 {
                    return Err(Truncated);
                }
                let ip = Ipv4Addr::new(input[4], input[5], input[6], input[7]);
                (SocksAddr::Ip(IpAddr::V4(ip)), 8)
            }
            3 => {
                if input.len() < 5 {
                    return Err(Truncated);
                }
                let dlen = usize::from(input[4]);
                if input.len() < 5 + dlen + 2 {
                    return Err(Truncated);
                }
                let name = match std::str::from_utf8(&input[5..5 + dlen]) {
                    Ok(s) => s.to_owned(),
                    Err(_) => {
                        return Ok(Err(Error::Syntax("SOCKS5 hostname is not utf-8")));
                    }
                };
                (SocksAddr::Hostname(name), 5 + dlen)
            }
            4 => {
                if input.len() < 4 + 16 + 2 {
                    return Err(Truncated);
                }
                (
                    SocksAddr::Ip(IpAddr::V6(ipv6_from_slice(&input[4..20]))),
                    20,
                )
            }
            _ => {
                // Address type not supported: refuse on the wire.
                self.state = State::Failed;
                return Ok(Ok(Action {
                    drain: 4,
                    reply: vec![5, 0x08, 0, 1, 0, 0, 0, 0, 0, 0],
                    finished: true,
                }));
            }
        };
        let port = u16::from_be_bytes([input[addr_end], input[addr_end + 1]]);

        self.request = Some(SocksRequest::new(
            SocksVersion::V5,
            cmd,
            addr,
            port,
            std::mem::replace(&mut self.auth, SocksAuth::NoAuth),
            None,
        ));
        self.state = State::Done;
        Ok(Ok(Action {
            drain: addr_end + 2,
            reply: Vec::new(),
            finished: true,
        }))
    }

    /// Handle a whole SOCKS4/4a request:
    /// `VN CD DSTPORT DSTIP USERID NUL [HOSTNAME NUL]`.
    fn s4_request(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 8 {
            return Err(Truncated);
        }
        let cmd = SocksCmd::from(input[1]);
        let port = u16::from_be_bytes([input[2], input[3]]);
        let ip = Ipv4Addr::new(input[4], input[5], input[6], input[7]);

        // DSTIP of 0.0.0.x (x nonzero) marks the 4a hostname form.
        let ip_u32 = u32::from(ip);
        let socks4a = ip_u32 != 0 && ip_u32 <= 0xFF;

        let (ident, ident_end) = match read_nul_terminated(input, 8, "SOCKS4 userid")? {
            Ok(found) => found,
            Err(e) => return Ok(Err(e)),
        };
        let (addr, end) = if socks4a {
            let (host, host_end) =
                match read_nul_terminated(input, ident_end, "SOCKS4a hostname")? {
                    Ok(found) => found,
                    Err(e) => return Ok(Err(e)),
                };
            let host = match std::str::from_utf8(host) {
                Ok(s) => s.to_owned(),
                Err(_) => return Ok(Err(Error::Syntax("SOCKS4a hostname is not utf-8"))),
            };
            (SocksAddr::Hostname(host), host_end)
        } else {
            (SocksAddr::Ip(IpAddr::V4(ip)), ident_end)
        };

        let auth = SocksAuth::Socks4Ident(ident.to_vec());
        if !self.creds_ok(&auth) {
            // CD 0x5D: ident rejected.
            let mut reply = vec![0, 0x5D];
            reply.extend_from_slice(&port.to_be_bytes());
            reply.extend_from_slice(&ip.octets());
            self.state = State::Failed;
            return Ok(Ok(Action {
                drain: end,
                reply,
                finished: true,
            }));
        }

        self.request = Some(SocksRequest::new(
            SocksVersion::V4,
            cmd,
            addr,
            port,
            auth,
            Some(ip),
        ));
        self.state = State::Done;
        Ok(Ok(Action {
            drain: end,
            reply: Vec::new(),
            finished: true,
        }))
    }
}

impl Default for SocksProxyHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan `input` from `start` for a NUL terminator; return the bytes before
/// it and the offset just past it.
///
/// Fields are capped at 255 bytes, after which the peer is clearly not
/// sending a terminator.
fn read_nul_terminated<'a>(
    input: &'a [u8],
    start: usize,
    what: &'static str,
) -> Result<Result2<'a>, Truncated> {
    match input[start..].iter().position(|&b| b == 0) {
        Some(pos) if pos <= 255 => Ok(Ok((&input[start..start + pos], start + pos + 1))),
        Some(_) => Ok(Err(Error::FieldTooLong(what))),
        None if input.len() - start > 255 => Ok(Err(Error::FieldTooLong(what))),
        None => Err(Truncated),
    }
}

/// Alias for the nested result returned by [`read_nul_terminated`].
type Result2<'a> = Result<(&'a [u8], usize), Error>;

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::msg::SocksStatus;
    use hex_literal::hex;

    /// Drive a handshake over `wire` as if it arrived in one read,
    /// collecting every reply.
    fn run(hs: &mut SocksProxyHandshake, wire: &[u8]) -> (Vec<u8>, bool) {
        let mut buf = wire.to_vec();
        let mut replies = Vec::new();
        loop {
            let action = match hs.handshake(&buf) {
                Err(Truncated) => panic!("handshake starved with {} bytes left", buf.len()),
                Ok(r) => r.unwrap(),
            };
            buf.drain(..action.drain);
            replies.extend_from_slice(&action.reply);
            if action.finished {
                return (replies, buf.is_empty());
            }
        }
    }

    #[test]
    fn socks5_no_auth_connect_v4() {
        // Greeting `05 01 00`, then CONNECT to 127.0.0.1:80.
        let mut hs = SocksProxyHandshake::new();
        let (replies, drained) = run(&mut hs, &hex!("050100" "05010001 7F000001 0050"));
        assert!(drained);
        assert_eq!(replies, hex!("0500"));
        let req = hs.into_request().unwrap();
        assert_eq!(req.version(), SocksVersion::V5);
        assert_eq!(req.command(), SocksCmd::CONNECT);
        assert_eq!(req.port(), 80);
    }

    #[test]
    fn socks5_spec_bytes() {
        // Greeting 05 01 00, request 05 01 00 01 7F 00 00 01 00 50.
        let mut hs = SocksProxyHandshake::new();
        let (replies, _) = run(&mut hs, &hex!("050100" "05010001 7F000001 0050"));
        assert_eq!(replies, hex!("0500"));
        let req = hs.into_request().unwrap();
        assert_eq!(req.addr().to_string(), "127.0.0.1");
        assert_eq!(req.port(), 80);
        let bound = SocksAddr::Ip("127.0.0.1".parse().unwrap());
        let reply = req.reply(SocksStatus::Succeeded, Some(&bound), 8080);
        assert_eq!(reply[..4], hex!("05000001"));
    }

    #[test]
    fn socks5_userpass() {
        let check: AuthChecker = Box::new(|auth| {
            matches!(auth, SocksAuth::Username(u, p) if u == b"jack" && p == b"1111")
        });
        let mut hs = SocksProxyHandshake::with_auth(check);
        let wire = hex!(
            "050102"                    // offer userpass only
            "01 04 6a61636b 04 31313131" // 1929: jack / 1111
            "05010003 0b 6578616d706c652e636f6d 01bb" // CONNECT example.com:443
        );
        let (replies, drained) = run(&mut hs, &wire);
        assert!(drained);
        assert_eq!(replies, hex!("0502" "0100"));
        let req = hs.into_request().unwrap();
        assert_eq!(req.addr().to_string(), "example.com");
        assert_eq!(req.port(), 443);
        assert!(matches!(req.auth(), SocksAuth::Username(u, _) if u == b"jack"));
    }

    #[test]
    fn socks5_userpass_rejected() {
        let check: AuthChecker = Box::new(|_| false);
        let mut hs = SocksProxyHandshake::with_auth(check);
        let (replies, _) = run(&mut hs, &hex!("050102" "01 01 61 01 62"));
        assert_eq!(replies, hex!("0502" "0101"));
        assert!(hs.into_request().is_none());
    }

    #[test]
    fn socks5_no_acceptable_method() {
        // Auth required, but the client only offers NO AUTH.
        let check: AuthChecker = Box::new(|_| true);
        let mut hs = SocksProxyHandshake::with_auth(check);
        let (replies, _) = run(&mut hs, &hex!("050100"));
        assert_eq!(replies, hex!("05FF"));
        assert!(hs.into_request().is_none());
    }

    #[test]
    fn socks5_truncation_is_not_an_error() {
        let mut hs = SocksProxyHandshake::new();
        let wire = hex!("050100");
        for i in 0..wire.len() {
            match hs.handshake(&wire[..i]) {
                Err(Truncated) => (),
                Ok(r) => panic!("expected Truncated at {}, got {:?}", i, r.map(|a| a.drain)),
            }
        }
        assert!(hs.handshake(&wire).is_ok());
    }

    #[test]
    fn socks5_udp_associate_is_decoded() {
        // The engine refuses it later with REP 0x07; the decoder just
        // reports the command.
        let mut hs = SocksProxyHandshake::new();
        let (_, _) = run(&mut hs, &hex!("050100" "0503000100000000 0000"));
        let req = hs.into_request().unwrap();
        assert_eq!(req.command(), SocksCmd::UDP_ASSOCIATE);
        let reply = req.reply(SocksStatus::CommandNotSupported, None, 0);
        assert_eq!(reply, hex!("05070001000000000000"));
    }

    #[test]
    fn socks5_bad_atyp_refused_on_wire() {
        let mut hs = SocksProxyHandshake::new();
        let (replies, _) = run(&mut hs, &hex!("050100" "050100 09"));
        assert_eq!(replies, hex!("0500" "05080001000000000000"));
        assert!(hs.into_request().is_none());
    }

    #[test]
    fn socks4_connect() {
        let mut hs = SocksProxyHandshake::new();
        let (replies, drained) = run(&mut hs, &hex!("0401 0050 7F000001 6a61636b 00"));
        assert!(drained);
        assert!(replies.is_empty());
        let req = hs.into_request().unwrap();
        assert_eq!(req.version(), SocksVersion::V4);
        assert_eq!(req.addr().to_string(), "127.0.0.1");
        assert_eq!(req.port(), 80);
        assert!(matches!(req.auth(), SocksAuth::Socks4Ident(id) if id == b"jack"));
    }

    #[test]
    fn socks4a_hostname() {
        // Spec scenario 3: DSTIP 0.0.0.127 marks 4a; hostname follows the
        // userid.
        let mut hs = SocksProxyHandshake::new();
        let wire = hex!("0401 0050 0000007F 6a61636b 00 6578616d706c652e636f6d 00");
        let (replies, drained) = run(&mut hs, &wire);
        assert!(drained);
        assert!(replies.is_empty());
        let req = hs.into_request().unwrap();
        assert_eq!(req.addr().to_string(), "example.com");
        assert_eq!(req.port(), 80);
    }

    #[test]
    fn socks4_ident_rejected() {
        let check: AuthChecker = Box::new(|auth| {
            matches!(auth, SocksAuth::Socks4Ident(id) if id == b"jack")
        });
        let mut hs = SocksProxyHandshake::with_auth(check);
        let (replies, _) = run(&mut hs, &hex!("0401 0050 7F000001 6d616c6c6f7279 00"));
        assert_eq!(replies, hex!("005D 0050 7F000001"));
        assert!(hs.into_request().is_none());
    }

    #[test]
    fn socks4_userid_never_terminated() {
        let mut hs = SocksProxyHandshake::new();
        let mut wire = hex!("0401 0050 7F000001").to_vec();
        wire.extend(std::iter::repeat(b'x').take(300));
        match hs.handshake(&wire) {
            Ok(Err(Error::FieldTooLong(_))) => (),
            other => panic!("expected FieldTooLong, got {:?}", other),
        }
    }

    #[test]
    fn not_socks_at_all() {
        let mut hs = SocksProxyHandshake::new();
        match hs.handshake(b"GET / HTTP/1.1\r\n") {
            Ok(Err(Error::BadProtocol(b'G'))) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
