//! Canned response pages.
//!
//! Every error page matches what a stock nginx would produce, banner
//! included.  Some are sent as complete raw responses (before any request
//! parsing has happened); the rest are bodies attached to a
//! [`Reply`](super::wire::Reply).

use super::wire::http_date;
use crate::VERSION_STRING;

/// Body of the 400 page.
pub(crate) const BODY_400: &str = "<html>\r\n\
<head><title>400 Bad Request</title></head>\r\n\
<body>\r\n\
<center><h1>400 Bad Request</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 401 page.
pub(crate) const BODY_401: &str = "<html>\r\n\
<head><title>401 Authorization Required</title></head>\r\n\
<body>\r\n\
<center><h1>401 Authorization Required</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 302 page.
pub(crate) const BODY_302: &str = "<html>\r\n\
<head><title>302 Found</title></head>\r\n\
<body>\r\n\
<center><h1>302 Found</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 301 page.
pub(crate) const BODY_301: &str = "<html>\r\n\
<head><title>301 Moved Permanently</title></head>\r\n\
<body>\r\n\
<center><h1>301 Moved Permanently</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 403 page.
pub(crate) const BODY_403: &str = "<html>\r\n\
<head><title>403 Forbidden</title></head>\r\n\
<body>\r\n\
<center><h1>403 Forbidden</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 404 page.
pub(crate) const BODY_404: &str = "<html>\r\n\
<head><title>404 Not Found</title></head>\r\n\
<body>\r\n\
<center><h1>404 Not Found</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 407 page.
pub(crate) const BODY_407: &str = "<html>\r\n\
<head><title>407 Proxy Authentication Required</title></head>\r\n\
<body>\r\n\
<center><h1>407 Proxy Authentication Required</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 416 page.
pub(crate) const BODY_416: &str = "<html>\r\n\
<head><title>416 Requested Range Not Satisfiable</title></head>\r\n\
<body>\r\n\
<center><h1>416 Requested Range Not Satisfiable</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// Body of the 502 page.
pub(crate) const BODY_502: &str = "<html>\r\n\
<head><title>502 Bad Gateway</title></head>\r\n\
<body>\r\n\
<center><h1>502 Bad Gateway</h1></center>\r\n\
<hr><center>nginx/1.20.2</center>\r\n\
</body>\r\n\
</html>\r\n";

/// A complete raw 404 response, for paths that answer before any request
/// has been parsed (the "no document root" decoy).
pub(crate) fn raw_404_response() -> Vec<u8> {
    raw_response(404, "Not Found", BODY_404, &[])
}

/// A complete raw 400 response.
pub(crate) fn raw_400_response() -> Vec<u8> {
    raw_response(400, "Bad Request", BODY_400, &[])
}

/// A complete raw 407 response, with the Basic challenge.
pub(crate) fn raw_407_response() -> Vec<u8> {
    raw_response(
        407,
        "Proxy Authentication Required",
        BODY_407,
        &[("Proxy-Authenticate", "Basic realm=\"proxy\"")],
    )
}

/// Assemble a full response with the camouflage headers.
fn raw_response(
    status: u16,
    reason: &str,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    out.extend_from_slice(format!("Server: {}\r\n", VERSION_STRING).as_bytes());
    out.extend_from_slice(format!("Date: {}\r\n", http_date()).as_bytes());
    out.extend_from_slice(b"Content-Type: text/html\r\n");
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_pages_are_complete_responses() {
        let page = raw_404_response();
        let text = String::from_utf8(page).expect("ascii");
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Server: nginx/1.20.2\r\n"));
        assert!(text.contains("<h1>404 Not Found</h1>"));

        let page = raw_407_response();
        let text = String::from_utf8(page).expect("ascii");
        assert!(text.contains("Proxy-Authenticate: Basic realm=\"proxy\"\r\n"));
    }
}
