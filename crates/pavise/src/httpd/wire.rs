//! Minimal HTTP/1.x wire handling.
//!
//! The engine deliberately owns its HTTP layer: protocol detection hands
//! us a stream with bytes already buffered, and the camouflage responses
//! must be emitted byte-exactly.  Request heads are parsed with
//! `httparse`; everything else is plain buffers.

use std::io;

use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::VERSION_STRING;

/// Upper bound for a request head.
pub(crate) const MAX_HEADER_LEN: usize = 512 * 1024;

/// Errors while reading one request or response.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The head never fit the size cap.
    #[error("request head exceeds {MAX_HEADER_LEN} bytes")]
    HeadTooLarge,

    /// Unparseable head.
    #[error("malformed HTTP message")]
    Malformed,

    /// A declared body exceeds the caller's limit.
    #[error("message body too large")]
    BodyTooLarge,

    /// A framing we do not implement (chunked request bodies).
    #[error("unsupported message framing: {0}")]
    Unsupported(&'static str),
}

/// One parsed request.
#[derive(Clone, Debug)]
pub(crate) struct Request {
    /// Request method, as sent.
    pub(crate) method: String,
    /// Request target, as sent (no decoding).
    pub(crate) target: String,
    /// 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub(crate) version_minor: u8,
    /// Header name/value pairs in arrival order.
    pub(crate) headers: Vec<(String, String)>,
    /// The request body (Content-Length framing only).
    pub(crate) body: Vec<u8>,
}

impl Request {
    /// First value of a header, by case-insensitive name.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Does the client expect the connection to stay open?
    pub(crate) fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            Some(_) | None => self.version_minor >= 1,
        }
    }

    /// Is this a WebSocket upgrade attempt?
    pub(crate) fn is_upgrade(&self) -> bool {
        let upgrade_hdr = self
            .header("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let conn_hdr = self
            .header("Connection")
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
        upgrade_hdr && conn_hdr
    }
}

/// Read one request from `stream`.
///
/// `buf` carries bytes left over from earlier reads (protocol detection,
/// pipelined requests) and keeps any surplus afterwards.  Returns
/// `Ok(None)` on a clean EOF before the first byte of a request.
pub(crate) async fn read_request<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    body_limit: usize,
) -> Result<Option<Request>, WireError>
where
    S: AsyncRead + Unpin,
{
    let (mut request, head_len) = loop {
        let mut headers = [httparse::EMPTY_HEADER; 128];
        let mut parser = httparse::Request::new(&mut headers);
        match parser.parse(buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = parser.method.ok_or(WireError::Malformed)?.to_owned();
                let target = parser.path.ok_or(WireError::Malformed)?.to_owned();
                let version_minor = parser.version.unwrap_or(1);
                let headers = parser
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                let request = Request {
                    method,
                    target,
                    version_minor,
                    headers,
                    body: Vec::new(),
                };
                break (request, head_len);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADER_LEN {
                    return Err(WireError::HeadTooLarge);
                }
                let mut chunk = [0_u8; 4096];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(WireError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(_) => return Err(WireError::Malformed),
        }
    };

    buf.drain(..head_len);

    if request
        .header("Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Err(WireError::Unsupported("chunked request body"));
    }

    let content_length: usize = match request.header("Content-Length") {
        Some(v) => v.trim().parse().map_err(|_| WireError::Malformed)?,
        None => 0,
    };
    if content_length > body_limit {
        return Err(WireError::BodyTooLarge);
    }
    if content_length > 0 {
        let mut body = Vec::with_capacity(content_length);
        let from_buf = content_length.min(buf.len());
        body.extend_from_slice(&buf[..from_buf]);
        buf.drain(..from_buf);
        while body.len() < content_length {
            let mut chunk = [0_u8; 4096];
            let want = (content_length - body.len()).min(chunk.len());
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(WireError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        request.body = body;
    }

    Ok(Some(request))
}

/// The head of an upstream response, kept raw for faithful forwarding.
#[derive(Clone, Debug)]
pub(crate) struct ResponseHead {
    /// The verbatim head bytes, including the final blank line.
    pub(crate) raw: Vec<u8>,
    /// Parsed status code.
    pub(crate) status: u16,
    /// Content-Length, when declared.
    pub(crate) content_length: Option<u64>,
    /// Chunked transfer coding?
    pub(crate) chunked: bool,
    /// Will the upstream keep the connection open afterwards?
    pub(crate) keep_alive: bool,
}

/// Read a response head from an upstream server; body bytes already read
/// past the head stay in `buf`.
pub(crate) async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> Result<ResponseHead, WireError>
where
    S: AsyncRead + Unpin,
{
    let head_len = loop {
        if let Some(pos) = find_head_end(buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_LEN {
            return Err(WireError::HeadTooLarge);
        }
        let mut chunk = [0_u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(WireError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let raw: Vec<u8> = buf.drain(..head_len).collect();

    let mut headers = [httparse::EMPTY_HEADER; 128];
    let mut parser = httparse::Response::new(&mut headers);
    match parser.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => (),
        _ => return Err(WireError::Malformed),
    }
    let status = parser.code.ok_or(WireError::Malformed)?;
    let minor = parser.version.unwrap_or(1);

    let mut content_length = None;
    let mut chunked = false;
    let mut connection = None;
    for h in parser.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            content_length = String::from_utf8_lossy(h.value).trim().parse::<u64>().ok();
        } else if h.name.eq_ignore_ascii_case("Transfer-Encoding") {
            chunked = String::from_utf8_lossy(h.value)
                .to_ascii_lowercase()
                .contains("chunked");
        } else if h.name.eq_ignore_ascii_case("Connection") {
            connection = Some(String::from_utf8_lossy(h.value).to_ascii_lowercase());
        }
    }
    let keep_alive = match connection.as_deref() {
        Some("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => minor >= 1,
    };

    Ok(ResponseHead {
        raw,
        status,
        content_length,
        chunked,
        keep_alive,
    })
}

/// Find the end of an HTTP head (the index just past `\r\n\r\n`).
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Builder for responses we originate.
#[derive(Clone, Debug)]
pub(crate) struct Reply {
    /// Status code.
    status: u16,
    /// Reason phrase.
    reason: &'static str,
    /// Headers in output order.
    headers: Vec<(String, String)>,
}

impl Reply {
    /// A reply with the camouflage `Server` and a fresh `Date`.
    pub(crate) fn new(status: u16) -> Self {
        Reply {
            status,
            reason: reason_phrase(status),
            headers: vec![
                ("Server".to_owned(), VERSION_STRING.to_owned()),
                ("Date".to_owned(), http_date()),
            ],
        }
    }

    /// Append a header.
    pub(crate) fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    /// Declare keep-alive / close explicitly.
    pub(crate) fn keep_alive(self, keep: bool) -> Self {
        self.header("Connection", if keep { "keep-alive" } else { "close" })
    }

    /// Serialize the head, with Content-Length for `body_len`.
    pub(crate) fn encode(&self, body_len: Option<u64>) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if let Some(len) = body_len {
            out.extend_from_slice(format!("Content-Length: {}\r\n", len).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Write head and body, flushing.
    pub(crate) async fn send<S>(self, stream: &mut S, body: &[u8]) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let head = self.encode(Some(body.len() as u64));
        stream.write_all(&head).await?;
        stream.write_all(body).await?;
        stream.flush().await
    }
}

/// The current time as an RFC 1123 HTTP date, e.g.
/// `Sat, 01 Aug 2026 12:00:00 GMT`.
pub(crate) fn http_date() -> String {
    let fmt = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| String::from("Thu, 01 Jan 1970 00:00:00 GMT"))
}

/// Canonical reason phrases for the statuses we emit.
pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        416 => "Requested Range Not Satisfiable",
        502 => "Bad Gateway",
        _ => "OK",
    }
}
