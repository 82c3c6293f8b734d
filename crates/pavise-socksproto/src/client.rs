//! The client side of a SOCKS handshake.
//!
//! A proxy server needs this when it is configured to chain through a
//! further upstream proxy: after connecting to the upstream it speaks
//! SOCKS *as a client* to ask the upstream to reach the real target.

use std::net::IpAddr;

use crate::err::{Error, Truncated};
use crate::msg::{SocksAddr, SocksStatus};
use crate::Action;

/// Which SOCKS dialect to speak to the upstream proxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksClientVersion {
    /// SOCKS4: the target must be an IPv4 literal.
    Socks4,
    /// SOCKS4a: the target hostname is passed to the upstream.
    Socks4a,
    /// SOCKS5.
    Socks5,
}

/// The connect request a [`SocksClientHandshake`] will make.
#[derive(Clone, Debug)]
#[allow(clippy::exhaustive_structs)]
pub struct UpstreamTarget {
    /// Target address (hostname or literal IP) the upstream should reach.
    pub addr: SocksAddr,
    /// Target port.
    pub port: u16,
    /// Username and password, when the upstream wants them.
    ///
    /// For SOCKS4/4a the username doubles as the ident field.
    pub auth: Option<(String, String)>,
}

/// State machine for the client side of a SOCKS handshake.
///
/// Same calling convention as
/// [`SocksProxyHandshake`](crate::SocksProxyHandshake): call
/// [`handshake()`](Self::handshake) with all unconsumed reply bytes from
/// the upstream (initially an empty slice, which yields the opening
/// message to send).
pub struct SocksClientHandshake {
    /// Dialect we are speaking.
    version: SocksClientVersion,
    /// What we are asking the upstream to do.
    target: UpstreamTarget,
    /// Where we are in the handshake.
    state: State,
}

/// Client handshake states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Nothing sent yet.
    Start,
    /// SOCKS5 greeting sent; waiting for the method choice.
    WaitMethod,
    /// RFC 1929 record sent; waiting for the status byte.
    WaitAuthReply,
    /// SOCKS5 request sent; waiting for the reply.
    WaitReply,
    /// SOCKS4 request sent; waiting for the 8-byte reply.
    WaitReply4,
    /// Handshake complete; the stream is now a tunnel to the target.
    Done,
}

impl SocksClientHandshake {
    /// Create a client handshake for `target` speaking `version`.
    pub fn new(version: SocksClientVersion, target: UpstreamTarget) -> Result<Self, Error> {
        if version == SocksClientVersion::Socks4 {
            match target.addr {
                SocksAddr::Ip(IpAddr::V4(_)) => (),
                _ => return Err(Error::Syntax("SOCKS4 requires an IPv4 target")),
            }
        }
        if let SocksAddr::Hostname(h) = &target.addr {
            if h.len() > 255 {
                return Err(Error::FieldTooLong("hostname"));
            }
        }
        Ok(SocksClientHandshake {
            version,
            target,
            state: State::Start,
        })
    }

    /// Try to advance the handshake, given `input` as the bytes received
    /// from the upstream and not yet drained.
    pub fn handshake(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        match self.state {
            State::Start => Ok(self.start()),
            State::WaitMethod => self.s5_method(input),
            State::WaitAuthReply => self.s5_auth_reply(input),
            State::WaitReply => self.s5_reply(input),
            State::WaitReply4 => self.s4_reply(input),
            State::Done => Ok(Err(Error::AlreadyFinished)),
        }
    }

    /// Emit the opening message.
    fn start(&mut self) -> Result<Action, Error> {
        match self.version {
            SocksClientVersion::Socks5 => {
                // Offer NO AUTH, and USERNAME/PASSWORD when we have
                // credentials.
                let reply = match &self.target.auth {
                    Some(_) => vec![5, 2, 0, 2],
                    None => vec![5, 1, 0],
                };
                self.state = State::WaitMethod;
                Ok(Action {
                    drain: 0,
                    reply,
                    finished: false,
                })
            }
            SocksClientVersion::Socks4 | SocksClientVersion::Socks4a => {
                let reply = self.encode_socks4_request()?;
                self.state = State::WaitReply4;
                Ok(Action {
                    drain: 0,
                    reply,
                    finished: false,
                })
            }
        }
    }

    /// Handle the SOCKS5 `VER METHOD` choice.
    fn s5_method(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 2 {
            return Err(Truncated);
        }
        if input[0] != 5 {
            return Ok(Err(Error::BadProtocol(input[0])));
        }
        match input[1] {
            0 => {
                self.state = State::WaitReply;
                Ok(Ok(Action {
                    drain: 2,
                    reply: self.encode_socks5_request(),
                    finished: false,
                }))
            }
            2 => {
                let Some((user, pass)) = self.target.auth.clone() else {
                    return Ok(Err(Error::UpstreamAuthRequired));
                };
                if user.len() > 255 || pass.len() > 255 {
                    return Ok(Err(Error::FieldTooLong("username or password")));
                }
                let mut reply = Vec::with_capacity(3 + user.len() + pass.len());
                reply.push(1);
                reply.push(user.len() as u8);
                reply.extend_from_slice(user.as_bytes());
                reply.push(pass.len() as u8);
                reply.extend_from_slice(pass.as_bytes());
                self.state = State::WaitAuthReply;
                Ok(Ok(Action {
                    drain: 2,
                    reply,
                    finished: false,
                }))
            }
            _ => Ok(Err(Error::NoAcceptableMethod)),
        }
    }

    /// Handle the RFC 1929 `VER STATUS` reply.
    fn s5_auth_reply(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 2 {
            return Err(Truncated);
        }
        if input[0] != 1 {
            return Ok(Err(Error::BadAuthVersion(input[0])));
        }
        if input[1] != 0 {
            return Ok(Err(Error::UpstreamAuthRejected));
        }
        self.state = State::WaitReply;
        Ok(Ok(Action {
            drain: 2,
            reply: self.encode_socks5_request(),
            finished: false,
        }))
    }

    /// Handle the SOCKS5 `VER REP RSV ATYP BND.ADDR BND.PORT` reply.
    fn s5_reply(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 4 {
            return Err(Truncated);
        }
        if input[0] != 5 {
            return Ok(Err(Error::BadProtocol(input[0])));
        }
        let len = match input[3] {
            1 => 4 + 4 + 2,
            3 => {
                if input.len() < 5 {
                    return Err(Truncated);
                }
                4 + 1 + usize::from(input[4]) + 2
            }
            4 => 4 + 16 + 2,
            _ => return Ok(Err(Error::Syntax("bad ATYP in upstream reply"))),
        };
        if input.len() < len {
            return Err(Truncated);
        }
        let status = SocksStatus::from_socks5_code(input[1]);
        if status != SocksStatus::Succeeded {
            return Ok(Err(Error::UpstreamStatus(status)));
        }
        self.state = State::Done;
        Ok(Ok(Action {
            drain: len,
            reply: Vec::new(),
            finished: true,
        }))
    }

    /// Handle the 8-byte SOCKS4 reply.
    fn s4_reply(&mut self, input: &[u8]) -> Result<Result<Action, Error>, Truncated> {
        if input.len() < 8 {
            return Err(Truncated);
        }
        let status = SocksStatus::from_socks4_code(input[1]);
        if status != SocksStatus::Succeeded {
            return Ok(Err(Error::UpstreamStatus(status)));
        }
        self.state = State::Done;
        Ok(Ok(Action {
            drain: 8,
            reply: Vec::new(),
            finished: true,
        }))
    }

    /// Encode our SOCKS5 CONNECT request.
    fn encode_socks5_request(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        out.push(5);
        out.push(1); // CONNECT
        out.push(0);
        match &self.target.addr {
            SocksAddr::Ip(IpAddr::V4(ip)) => {
                out.push(1);
                out.extend_from_slice(&ip.octets());
            }
            SocksAddr::Ip(IpAddr::V6(ip)) => {
                out.push(4);
                out.extend_from_slice(&ip.octets());
            }
            SocksAddr::Hostname(h) => {
                out.push(3);
                // Length is checked in new().
                out.push(h.len() as u8);
                out.extend_from_slice(h.as_bytes());
            }
        }
        out.extend_from_slice(&self.target.port.to_be_bytes());
        out
    }

    /// Encode our SOCKS4/4a request.
    fn encode_socks4_request(&self) -> Result<Vec<u8>, Error> {
        let ident = self
            .target
            .auth
            .as_ref()
            .map(|(u, _)| u.as_bytes())
            .unwrap_or_default();
        if ident.contains(&0) {
            return Err(Error::Syntax("SOCKS4 userid contains NUL"));
        }
        let mut out = Vec::with_capacity(9 + ident.len());
        out.push(4);
        out.push(1); // CONNECT
        out.extend_from_slice(&self.target.port.to_be_bytes());
        match (&self.version, &self.target.addr) {
            (SocksClientVersion::Socks4, SocksAddr::Ip(IpAddr::V4(ip))) => {
                out.extend_from_slice(&ip.octets());
            }
            (SocksClientVersion::Socks4a, _) => {
                // The 0.0.0.1 marker tells the upstream a hostname follows.
                out.extend_from_slice(&[0, 0, 0, 1]);
            }
            _ => return Err(Error::Syntax("SOCKS4 requires an IPv4 target")),
        }
        out.extend_from_slice(ident);
        out.push(0);
        if self.version == SocksClientVersion::Socks4a {
            match &self.target.addr {
                SocksAddr::Hostname(h) => out.extend_from_slice(h.as_bytes()),
                SocksAddr::Ip(ip) => out.extend_from_slice(ip.to_string().as_bytes()),
            }
            out.push(0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::proxy::{AuthChecker, SocksProxyHandshake};
    use crate::msg::{SocksAuth, SocksRequest, SocksStatus};
    use hex_literal::hex;

    fn target(addr: &str, port: u16, auth: Option<(&str, &str)>) -> UpstreamTarget {
        let addr = match addr.parse() {
            Ok(ip) => SocksAddr::Ip(ip),
            Err(_) => SocksAddr::Hostname(addr.to_owned()),
        };
        UpstreamTarget {
            addr,
            port,
            auth: auth.map(|(u, p)| (u.to_owned(), p.to_owned())),
        }
    }

    /// Run a client handshake against the proxy handshake through
    /// in-memory buffers, and return the request the proxy decoded.
    fn interop(
        mut client: SocksClientHandshake,
        mut server: SocksProxyHandshake,
        server_reply_addr: &str,
    ) -> SocksRequest {
        let mut to_server: Vec<u8> = Vec::new();
        let mut to_client: Vec<u8> = Vec::new();
        let mut server_done = false;
        let mut request = None;

        for _ in 0..16 {
            // Client turn.
            match client.handshake(&to_client) {
                Err(Truncated) => (),
                Ok(action) => {
                    let action = action.unwrap();
                    to_client.drain(..action.drain);
                    to_server.extend_from_slice(&action.reply);
                    if action.finished {
                        assert!(server_done);
                        return request.unwrap();
                    }
                }
            }
            // Server turn.
            if !server_done {
                match server.handshake(&to_server) {
                    Err(Truncated) => (),
                    Ok(action) => {
                        let action = action.unwrap();
                        to_server.drain(..action.drain);
                        to_client.extend_from_slice(&action.reply);
                        if action.finished {
                            server_done = true;
                            let req = std::mem::replace(
                                &mut server,
                                SocksProxyHandshake::new(),
                            )
                            .into_request()
                            .unwrap();
                            let bound = SocksAddr::Ip(server_reply_addr.parse().unwrap());
                            to_client.extend_from_slice(&req.reply(
                                SocksStatus::Succeeded,
                                Some(&bound),
                                9999,
                            ));
                            request = Some(req);
                        }
                    }
                }
            }
        }
        panic!("handshakes did not converge");
    }

    #[test]
    fn socks5_no_auth_against_our_server() {
        let client = SocksClientHandshake::new(
            SocksClientVersion::Socks5,
            target("example.com", 443, None),
        )
        .unwrap();
        let server = SocksProxyHandshake::new();
        let req = interop(client, server, "10.1.2.3");
        assert_eq!(req.addr().to_string(), "example.com");
        assert_eq!(req.port(), 443);
    }

    #[test]
    fn socks5_userpass_against_our_server() {
        let client = SocksClientHandshake::new(
            SocksClientVersion::Socks5,
            target("192.0.2.10", 80, Some(("jack", "1111"))),
        )
        .unwrap();
        let check: AuthChecker = Box::new(|auth| {
            matches!(auth, SocksAuth::Username(u, p) if u == b"jack" && p == b"1111")
        });
        let server = SocksProxyHandshake::with_auth(check);
        let req = interop(client, server, "10.1.2.3");
        assert_eq!(req.addr().to_string(), "192.0.2.10");
        assert!(matches!(req.auth(), SocksAuth::Username(_, _)));
    }

    #[test]
    fn socks4a_against_our_server() {
        let client = SocksClientHandshake::new(
            SocksClientVersion::Socks4a,
            target("example.com", 80, Some(("jack", ""))),
        )
        .unwrap();
        let server = SocksProxyHandshake::new();
        let req = interop(client, server, "127.0.0.1");
        assert_eq!(req.addr().to_string(), "example.com");
        assert_eq!(req.port(), 80);
    }

    #[test]
    fn socks5_greeting_bytes() {
        let mut c = SocksClientHandshake::new(
            SocksClientVersion::Socks5,
            target("1.2.3.4", 80, None),
        )
        .unwrap();
        let action = c.handshake(&[]).unwrap().unwrap();
        assert_eq!(action.reply, hex!("050100"));
        let action = c.handshake(&hex!("0500")).unwrap().unwrap();
        assert_eq!(action.reply, hex!("05010001 01020304 0050"));
    }

    #[test]
    fn socks5_upstream_refusal() {
        let mut c = SocksClientHandshake::new(
            SocksClientVersion::Socks5,
            target("1.2.3.4", 80, None),
        )
        .unwrap();
        let _ = c.handshake(&[]).unwrap().unwrap();
        let _ = c.handshake(&hex!("0500")).unwrap().unwrap();
        match c.handshake(&hex!("05050001 00000000 0000")) {
            Ok(Err(Error::UpstreamStatus(SocksStatus::ConnectionRefused))) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn socks4_requires_ipv4() {
        assert!(SocksClientHandshake::new(
            SocksClientVersion::Socks4,
            target("example.com", 80, None),
        )
        .is_err());
    }

    #[test]
    fn socks4_wire_bytes() {
        let mut c = SocksClientHandshake::new(
            SocksClientVersion::Socks4,
            target("127.0.0.1", 80, Some(("jack", ""))),
        )
        .unwrap();
        let action = c.handshake(&[]).unwrap().unwrap();
        assert_eq!(action.reply, hex!("0401 0050 7F000001 6a61636b 00"));
        let action = c.handshake(&hex!("005A 0050 7F000001")).unwrap().unwrap();
        assert!(action.finished);
    }

    #[test]
    fn auth_required_but_missing() {
        let mut c = SocksClientHandshake::new(
            SocksClientVersion::Socks5,
            target("1.2.3.4", 80, None),
        )
        .unwrap();
        let _ = c.handshake(&[]).unwrap().unwrap();
        match c.handshake(&hex!("0502")) {
            Ok(Err(Error::UpstreamAuthRequired)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
