//! The camouflage web server: static files, directory listings, ranges.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use percent_encoding::percent_decode_str;
use serde_json::json;
use sha1::{Digest, Sha1};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::wire::{read_request, Reply, Request};
use super::{check_basic_auth, pages, AuthOutcome, PROXY_BODY_LIMIT};
use crate::limit::RateLimiter;
use crate::session::SessionCtx;
use crate::stream::ProxyStream;

/// File streaming buffer: 5 MiB, clamped down under a rate limit.
const FILE_BUF_LEN: usize = 5 * 1024 * 1024;

/// Directory listing page head.
const HEAD_FMT: &str = r#"<html><head><meta charset="UTF-8"><title>Index of {target}</title></head><body bgcolor="white"><h1>Index of {target}</h1><hr><div><table><tbody>"#;
/// Directory listing page tail.
const TAIL_FMT: &str = "</tbody></table></div><hr></body></html>";

/// How one request target is routed.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Route {
    /// Directory listing (target ends with `/`).
    Dir(String),
    /// Directory listing as JSON (`/?q=json`, optionally with `hash`).
    Json { dir: String, hash: bool },
    /// Single file.
    File(String),
}

/// Classify a raw request target.
fn route(target: &str) -> Route {
    if let Some(pos) = target.find("/?q=json") {
        let query = &target[pos + 2..];
        return Route::Json {
            dir: format!("{}/", &target[..pos]),
            hash: query.contains("hash"),
        };
    }
    let path = target.split('?').next().unwrap_or(target);
    if path.ends_with('/') {
        Route::Dir(path.to_owned())
    } else {
        Route::File(path.to_owned())
    }
}

/// Serve web requests on this connection until it closes.
pub(crate) async fn serve(
    ctx: &SessionCtx,
    mut stream: ProxyStream,
    first: Request,
    mut buf: Vec<u8>,
) -> Result<()> {
    let Some(doc_root) = ctx.options.doc_directory.clone() else {
        // No document root: the listener is a pure decoy.
        stream.write_all(&pages::raw_404_response()).await.ok();
        stream.flush().await.ok();
        return Ok(());
    };

    let mut request = first;
    loop {
        if request
            .header("Expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
        {
            Reply::new(405).keep_alive(false).send(&mut stream, b"").await.ok();
            return Ok(());
        }
        if request.is_upgrade() {
            stream.write_all(&pages::raw_404_response()).await.ok();
            stream.flush().await.ok();
            return Ok(());
        }

        if ctx.options.htpasswd {
            let auth = check_basic_auth(
                &ctx.options,
                request.header("Authorization"),
                ctx.peer.ip(),
            );
            let authorized = !ctx.options.auth_users.is_empty() && auth.is_success();
            if !authorized {
                debug!("connection id: {}, web auth error: {:?}", ctx.id, auth);
                let retryable = matches!(auth, AuthOutcome::NoCredentials)
                    && request.keep_alive();
                Reply::new(401)
                    .header("Content-Type", "text/html; charset=UTF-8")
                    .header("WWW-Authenticate", "Basic realm=\"proxy\"")
                    .keep_alive(retryable)
                    .send(&mut stream, pages::BODY_401.as_bytes())
                    .await?;
                if !retryable {
                    return Ok(());
                }
                // Let the client retry with credentials.
                match read_request(&mut stream, &mut buf, PROXY_BODY_LIMIT).await {
                    Ok(Some(next)) => {
                        request = next;
                        continue;
                    }
                    _ => return Ok(()),
                }
            }
        }

        let keep_alive = request.keep_alive();
        match route(&request.target) {
            Route::Dir(target) => {
                serve_dir(ctx, &mut stream, &request, &doc_root, &target).await?;
            }
            Route::Json { dir, hash } => {
                serve_json(ctx, &mut stream, &request, &doc_root, &dir, hash).await?;
            }
            Route::File(target) => {
                serve_file(ctx, &mut stream, &request, &doc_root, &target).await?;
            }
        }

        if !keep_alive {
            break;
        }
        request = match read_request(&mut stream, &mut buf, PROXY_BODY_LIMIT).await {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(e) => {
                debug!("connection id: {}, web keepalive read: {}", ctx.id, e);
                break;
            }
        };
    }
    Ok(())
}

/// Resolve a request target under the document root.
///
/// Percent-decodes, strips leading slashes, and refuses any `..` that
/// would climb out of the root.
fn resolve_target(doc_root: &Path, target: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(target).decode_utf8().ok()?;
    if decoded.contains('\0') {
        return None;
    }
    let mut depth = 0_i32;
    let mut relative = PathBuf::new();
    for part in decoded.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
                relative.pop();
            }
            part => {
                depth += 1;
                relative.push(part);
            }
        }
    }
    Some(doc_root.join(relative))
}

/// Serve one file request, honoring a single `Range:`.
async fn serve_file(
    ctx: &SessionCtx,
    stream: &mut ProxyStream,
    request: &Request,
    doc_root: &Path,
    target: &str,
) -> Result<()> {
    let Some(path) = resolve_target(doc_root, target) else {
        warn!("connection id: {}, bad request path: {}", ctx.id, target);
        Reply::new(400)
            .header("Content-Type", "text/html")
            .keep_alive(false)
            .send(stream, pages::BODY_400.as_bytes())
            .await?;
        return Ok(());
    };

    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(_) => {
            warn!("connection id: {}, {} file not exists", ctx.id, target);
            Reply::new(404)
                .header("Content-Type", "text/html")
                .keep_alive(request.keep_alive())
                .send(stream, pages::BODY_404.as_bytes())
                .await?;
            return Ok(());
        }
    };

    if meta.is_dir() {
        // Redirect to the slashed form of the same URL.
        let scheme = if stream.is_tls() { "https" } else { "http" };
        let host = request.header("Host").unwrap_or_default();
        let location = format!("{}://{}{}/", scheme, host, request.target);
        debug!("connection id: {}, {} is directory", ctx.id, target);
        Reply::new(301)
            .header("Content-Type", "text/html")
            .header("Location", location)
            .keep_alive(true)
            .send(stream, pages::BODY_301.as_bytes())
            .await?;
        return Ok(());
    }

    let file_size = meta.len();
    let range = parse_ranges(request.header("Range"));

    let (status, start, end) = match range {
        RangeSpec::None => (200, 0, file_size.saturating_sub(1)),
        RangeSpec::Single(a, b) => match clamp_range(a, b, file_size) {
            Some((start, end)) => (206, start, end),
            None => {
                return send_416(stream, request, file_size).await;
            }
        },
        RangeSpec::Invalid => {
            return send_416(stream, request, file_size).await;
        }
    };

    let content_length = if file_size == 0 { 0 } else { end - start + 1 };
    let mut reply = Reply::new(status)
        .header("Content-Type", mime_for(&path))
        .keep_alive(request.keep_alive());
    if status == 200 {
        reply = reply.header("Accept-Ranges", "bytes");
    } else {
        reply = reply.header(
            "Content-Range",
            format!("bytes {}-{}/{}", start, end, file_size),
        );
    }

    let head = reply.encode(Some(content_length));
    stream.write_all(&head).await?;
    if request.method.eq_ignore_ascii_case("HEAD") {
        stream.flush().await?;
        return Ok(());
    }

    let limiter = ctx
        .options
        .rate_limit_for(None)
        .map(|bps| Arc::new(RateLimiter::new(bps)));
    let buf_len = match &limiter {
        Some(lim) => lim.clamp_buffer(FILE_BUF_LEN),
        None => FILE_BUF_LEN,
    };

    let mut file = tokio::fs::File::open(&path).await?;
    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start)).await?;
    }
    let mut remaining = content_length;
    let mut chunk = vec![0_u8; buf_len.min(content_length.max(1) as usize)];
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = file.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        if let Some(lim) = &limiter {
            lim.throttle(n).await;
        }
        match ctx.options.tcp_timeout {
            Some(t) => {
                tokio::time::timeout(t, stream.write_all(&chunk[..n])).await??;
            }
            None => stream.write_all(&chunk[..n]).await?,
        }
        remaining -= n as u64;
    }
    stream.flush().await?;
    debug!("connection id: {}, http request: {} completed", ctx.id, target);
    Ok(())
}

/// Reply 416 with the canned page.
async fn send_416(
    stream: &mut ProxyStream,
    request: &Request,
    _file_size: u64,
) -> Result<()> {
    Reply::new(416)
        .header("Content-Type", "text/html")
        .keep_alive(request.keep_alive())
        .send(stream, pages::BODY_416.as_bytes())
        .await?;
    Ok(())
}

/// A parsed `Range:` header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RangeSpec {
    /// No (usable) header.
    None,
    /// One `start`/`end` pair; -1 marks an absent bound
    /// (`N-` and `-N` forms).
    Single(i64, i64),
    /// Present but unsatisfiable as sent (multiple ranges, garbage).
    Invalid,
}

/// Parse a `Range: bytes=` header.  Only a single range is supported;
/// multiple ranges are reported as [`RangeSpec::Invalid`].
fn parse_ranges(header: Option<&str>) -> RangeSpec {
    let Some(raw) = header else {
        return RangeSpec::None;
    };
    let raw: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let Some(spec) = raw
        .strip_prefix("bytes=")
        .or_else(|| raw.strip_prefix("Bytes="))
    else {
        return RangeSpec::Invalid;
    };
    if spec.is_empty() {
        return RangeSpec::Invalid;
    }
    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() != 1 {
        return RangeSpec::Invalid;
    }
    let Some((a, b)) = parts[0].split_once('-') else {
        return RangeSpec::Invalid;
    };
    let start = if a.is_empty() {
        -1
    } else {
        match a.parse::<i64>() {
            Ok(v) if v >= 0 => v,
            _ => return RangeSpec::Invalid,
        }
    };
    let end = if b.is_empty() {
        -1
    } else {
        match b.parse::<i64>() {
            Ok(v) if v >= 0 => v,
            _ => return RangeSpec::Invalid,
        }
    };
    RangeSpec::Single(start, end)
}

/// Turn a parsed range into concrete offsets, or None for 416.
fn clamp_range(a: i64, b: i64, file_size: u64) -> Option<(u64, u64)> {
    if file_size == 0 {
        return None;
    }
    let last = file_size - 1;
    match (a, b) {
        // `-N`: the last N bytes.
        (-1, n) if n > 0 => {
            let n = (n as u64).min(file_size);
            Some((file_size - n, last))
        }
        (-1, _) => None,
        // `N-`: from N to EOF.
        (n, -1) => {
            let n = n as u64;
            if n > last {
                return None;
            }
            Some((n, last))
        }
        // `N-M`.
        (n, m) => {
            let (n, m) = (n as u64, m as u64);
            if n > m || n > last {
                return None;
            }
            Some((n, m.min(last)))
        }
    }
}

/// Serve a directory: the index file when present, a listing otherwise.
async fn serve_dir(
    ctx: &SessionCtx,
    stream: &mut ProxyStream,
    request: &Request,
    doc_root: &Path,
    target: &str,
) -> Result<()> {
    let Some(dir) = resolve_target(doc_root, target) else {
        Reply::new(400)
            .header("Content-Type", "text/html")
            .keep_alive(false)
            .send(stream, pages::BODY_400.as_bytes())
            .await?;
        return Ok(());
    };

    // index.html / index.htm win over the listing.
    for index in ["index.html", "index.htm"] {
        let candidate = dir.join(index);
        if tokio::fs::metadata(&candidate).await.is_ok() {
            let content = tokio::fs::read(&candidate).await?;
            Reply::new(200)
                .header("Content-Type", mime_for(&candidate))
                .keep_alive(request.keep_alive())
                .send(stream, &content)
                .await?;
            return Ok(());
        }
    }

    if !ctx.options.autoindex {
        Reply::new(403)
            .header("Content-Type", "text/html")
            .keep_alive(true)
            .send(stream, pages::BODY_403.as_bytes())
            .await?;
        return Ok(());
    }

    let entries = match list_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("connection id: {}, read dir {}: {}", ctx.id, target, e);
            Reply::new(302)
                .header("Content-Type", "text/html")
                .header("Location", "/")
                .keep_alive(request.keep_alive())
                .send(stream, pages::BODY_302.as_bytes())
                .await?;
            return Ok(());
        }
    };

    let mut page = String::with_capacity(4096);
    let decoded = percent_decode_str(target).decode_utf8_lossy();
    page.push_str(&HEAD_FMT.replace("{target}", &decoded));
    page.push_str(&listing_row("../", "../", "", ""));
    for entry in entries {
        page.push_str(&entry.to_row());
    }
    page.push_str(TAIL_FMT);

    Reply::new(200)
        .header("Content-Type", "text/html; charset=utf-8")
        .keep_alive(request.keep_alive())
        .send(stream, page.as_bytes())
        .await?;
    Ok(())
}

/// Serve a directory listing as JSON.
async fn serve_json(
    ctx: &SessionCtx,
    stream: &mut ProxyStream,
    request: &Request,
    doc_root: &Path,
    target: &str,
    hash: bool,
) -> Result<()> {
    let dir = match resolve_target(doc_root, target) {
        Some(dir) => dir,
        None => {
            Reply::new(400)
                .header("Content-Type", "text/html")
                .keep_alive(false)
                .send(stream, pages::BODY_400.as_bytes())
                .await?;
            return Ok(());
        }
    };

    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(read_dir) => read_dir,
        Err(e) => {
            debug!("connection id: {}, json dir {}: {}", ctx.id, target, e);
            Reply::new(302)
                .header("Location", "/")
                .keep_alive(request.keep_alive())
                .send(stream, b"")
                .await?;
            return Ok(());
        }
    };

    let mut items = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let mtime = format_mtime(meta.modified().ok());
        let mut obj = json!({
            "filename": name,
            "is_dir": meta.is_dir(),
            "last_write_time": mtime,
        });
        if !meta.is_dir() {
            obj["filesize"] = json!(meta.len());
            if hash {
                let path = entry.path();
                let digest = tokio::task::spawn_blocking(move || sha1_file(&path))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default();
                obj["hash"] = json!(digest);
            }
        }
        items.push(obj);
    }

    let body = serde_json::to_vec(&items)?;
    Reply::new(200)
        .header("Content-Type", "application/json")
        .keep_alive(request.keep_alive())
        .send(stream, &body)
        .await?;
    Ok(())
}

/// SHA-1 of a file, lowercase hex.  Runs on the blocking pool.
fn sha1_file(path: &Path) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut chunk = vec![0_u8; 4 * 1024 * 1024];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    let mut out = String::with_capacity(40);
    for b in hasher.finalize() {
        out.push_str(&format!("{:02x}", b));
    }
    Ok(out)
}

/// One directory listing entry, ready to format.
struct DirEntryRow {
    /// Link target (with trailing `/` on directories).
    href: String,
    /// Last-write time, already formatted.
    mtime: String,
    /// Human size, or `-` for directories.
    size: String,
}

impl DirEntryRow {
    /// Format as a table row, truncating long display names.
    fn to_row(&self) -> String {
        let mut display = self.href.clone();
        if display.len() > 50 {
            display.truncate(47);
            display.push_str("..&gt;");
        }
        listing_row(&self.href, &display, &self.mtime, &self.size)
    }
}

/// The listing row template.
fn listing_row(href: &str, display: &str, mtime: &str, size: &str) -> String {
    format!(
        "<tr><td class=\"link\"><a href=\"{}\">{}</a></td><td class=\"size\">{}</td><td class=\"date\">{}</td></tr>\r\n",
        href, display, mtime, size
    )
}

/// Collect and sort directory entries: directories first, each group in
/// name order.
async fn list_dir(dir: &Path) -> std::io::Result<Vec<DirEntryRow>> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let mtime = format_mtime(meta.modified().ok());
        if meta.is_dir() {
            dirs.push(DirEntryRow {
                href: format!("{}/", name),
                mtime,
                size: "-".to_owned(),
            });
        } else {
            files.push(DirEntryRow {
                href: name,
                mtime,
                size: human_size(meta.len()),
            });
        }
    }
    dirs.sort_by(|a, b| a.href.cmp(&b.href));
    files.sort_by(|a, b| a.href.cmp(&b.href));
    dirs.extend(files);
    Ok(dirs)
}

/// Format a file modification time as `MM-DD-YYYY HH:MM`.
fn format_mtime(time: Option<SystemTime>) -> String {
    let Some(time) = time else {
        return String::new();
    };
    let fmt = format_description!("[month]-[day]-[year] [hour]:[minute]");
    OffsetDateTime::from(time).format(&fmt).unwrap_or_default()
}

/// Human-readable file size with a binary-scale suffix.
fn human_size(bytes: u64) -> String {
    const SUFFIXES: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx + 1 < SUFFIXES.len() {
        value /= 1024.0;
        idx += 1;
    }
    format!("{:.2}{}", value, SUFFIXES[idx])
}

/// Content-Type by file extension; unknown extensions are plain text.
fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" => "application/javascript",
        "h" | "hpp" | "cpp" | "cxx" | "cc" | "c" => "text/javascript",
        "json" => "application/json",
        "css" => "text/css",
        "woff" => "application/x-font-woff",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "wav" => "audio/x-wav",
        "ogg" => "video/ogg",
        "mp4" => "video/mp4",
        "flv" => "video/x-flv",
        "f4v" => "video/x-f4v",
        "ts" => "video/MP2T",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "3gp" => "video/3gpp",
        "mkv" => "video/x-matroska",
        "7z" => "application/x-7z-compressed",
        "ppt" => "application/vnd.ms-powerpoint",
        "zip" => "application/zip",
        "xz" => "application/x-xz",
        "xml" => "application/xml",
        "webm" => "video/webm",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn routing() {
        assert_eq!(route("/files/"), Route::Dir("/files/".to_owned()));
        assert_eq!(route("/"), Route::Dir("/".to_owned()));
        assert_eq!(route("/a.bin"), Route::File("/a.bin".to_owned()));
        assert_eq!(
            route("/files/?q=json"),
            Route::Json {
                dir: "/files/".to_owned(),
                hash: false
            }
        );
        assert_eq!(
            route("/?q=json&hash=1"),
            Route::Json {
                dir: "/".to_owned(),
                hash: true
            }
        );
    }

    #[test]
    fn target_resolution_blocks_traversal() {
        let root = Path::new("/srv/doc");
        assert_eq!(
            resolve_target(root, "/a/b.txt"),
            Some(PathBuf::from("/srv/doc/a/b.txt"))
        );
        assert_eq!(
            resolve_target(root, "/a/../b.txt"),
            Some(PathBuf::from("/srv/doc/b.txt"))
        );
        assert!(resolve_target(root, "/../etc/passwd").is_none());
        assert!(resolve_target(root, "/a/../../etc").is_none());
        assert_eq!(
            resolve_target(root, "/a%20b.txt"),
            Some(PathBuf::from("/srv/doc/a b.txt"))
        );
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_ranges(None), RangeSpec::None);
        assert_eq!(parse_ranges(Some("bytes=0-99")), RangeSpec::Single(0, 99));
        assert_eq!(parse_ranges(Some("bytes=500-")), RangeSpec::Single(500, -1));
        assert_eq!(parse_ranges(Some("bytes=-10")), RangeSpec::Single(-1, 10));
        assert_eq!(
            parse_ranges(Some("bytes= 0 - 99 ")),
            RangeSpec::Single(0, 99)
        );
        assert_eq!(parse_ranges(Some("bytes=0-1,5-9")), RangeSpec::Invalid);
        assert_eq!(parse_ranges(Some("lines=0-1")), RangeSpec::Invalid);
        assert_eq!(parse_ranges(Some("bytes=")), RangeSpec::Invalid);
    }

    #[test]
    fn range_clamping() {
        // Spec walkthrough: -10 on a 100-byte file is 90..=99.
        assert_eq!(clamp_range(-1, 10, 100), Some((90, 99)));
        assert_eq!(clamp_range(0, 99, 100), Some((0, 99)));
        assert_eq!(clamp_range(50, -1, 100), Some((50, 99)));
        assert_eq!(clamp_range(0, 1000, 100), Some((0, 99)));
        assert_eq!(clamp_range(100, -1, 100), None);
        assert_eq!(clamp_range(9, 5, 100), None);
        assert_eq!(clamp_range(-1, -1, 100), None);
        assert_eq!(clamp_range(0, 0, 0), None);
    }

    #[test]
    fn sizes_are_human() {
        assert_eq!(human_size(100), "100.00B");
        assert_eq!(human_size(1024), "1.00KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00MB");
    }

    #[test]
    fn mime_lookup() {
        assert_eq!(mime_for(Path::new("x.html")), "text/html; charset=utf-8");
        assert_eq!(mime_for(Path::new("x.mp4")), "video/mp4");
        assert_eq!(mime_for(Path::new("x.unknown")), "text/plain");
        assert_eq!(mime_for(Path::new("noext")), "text/plain");
    }

    #[test]
    fn listing_rows_truncate() {
        let row = DirEntryRow {
            href: "x".repeat(60),
            mtime: "01-01-2026 00:00".into(),
            size: "1.00KB".into(),
        };
        let html = row.to_row();
        assert!(html.contains("..&gt;"));
        assert!(html.contains(&"x".repeat(60)));
    }
}
