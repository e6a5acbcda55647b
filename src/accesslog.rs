//! Extended Apache combined access logging.
//!
//! Writes one line per completed request:
//!
//! ```text
//! <remote> - <user> [<ts>] "<method> <uri> <proto>" <status> <size> \
//!     <orig_host> <proxied_host> <srcip> <xff> "<referer>" "<user-agent>"
//! ```
//!
//! Every request-controlled field is escape-quoted byte by byte before it
//! reaches the sink. The line is emitted when the response body finishes
//! draining (or is dropped on client disconnect), so `size` reflects the
//! bytes actually written.

use std::io::Write;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, Request, Version};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tracing::error;

const LOWERHEX: &[u8; 16] = b"0123456789abcdef";

/// The rewritten upstream host, handed from the router to the log line
/// through a response extension.
#[derive(Debug, Clone)]
pub struct ProxiedHost(pub String);

/// Line-oriented log sink, safe for concurrent writers. Each line is
/// written in a single call under the lock.
#[derive(Clone)]
pub struct AccessLog {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl AccessLog {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn write_line(&self, line: &[u8]) {
        let mut out = self.out.lock();
        if let Err(err) = out.write_all(line).and_then(|()| out.flush()) {
            error!(%err, "unable to write access log line");
        }
    }
}

/// Request-side fields captured at handler entry, before any rewriting.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub remote_host: String,
    pub username: String,
    pub method: String,
    pub uri: String,
    pub proto: String,
    pub original_host: String,
    pub srcip: Vec<u8>,
    pub xff: Vec<u8>,
    pub referer: Vec<u8>,
    pub user_agent: Vec<u8>,
}

impl LogEntry {
    fn capture(addr: SocketAddr, req: &Request<Body>) -> Self {
        let headers = req.headers();
        let header_bytes = |name: header::HeaderName| {
            headers
                .get(&name)
                .map(|value| value.as_bytes().to_vec())
                .unwrap_or_default()
        };

        let original_host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();

        // CONNECT over HTTP/2 carries the target in the authority field.
        let uri = if req.version() == Version::HTTP_2 && req.method() == Method::CONNECT {
            original_host.clone()
        } else {
            req.uri().to_string()
        };

        Self {
            remote_host: addr.ip().to_string(),
            username: username_from_authority(req.uri().authority().map(|a| a.as_str())),
            method: req.method().to_string(),
            uri,
            proto: proto_string(req.version()),
            original_host,
            srcip: header_bytes(header::HeaderName::from_static("srcip")),
            xff: header_bytes(header::HeaderName::from_static("x-forwarded-for")),
            referer: header_bytes(header::REFERER),
            user_agent: header_bytes(header::USER_AGENT),
        }
    }
}

fn proto_string(version: Version) -> String {
    match version {
        Version::HTTP_09 => "HTTP/0.9".to_string(),
        Version::HTTP_10 => "HTTP/1.0".to_string(),
        Version::HTTP_11 => "HTTP/1.1".to_string(),
        Version::HTTP_2 => "HTTP/2.0".to_string(),
        Version::HTTP_3 => "HTTP/3.0".to_string(),
        other => format!("{other:?}"),
    }
}

fn username_from_authority(authority: Option<&str>) -> String {
    authority
        .and_then(|a| a.rsplit_once('@'))
        .map(|(userinfo, _)| userinfo.split(':').next().unwrap_or("").to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "-".to_string())
}

/// Append `s` to `buf` with the escape-quoting scheme: printable runes
/// pass through, `"` and `\` are backslashed, the standard C escapes
/// cover `\a\b\f\n\r\t\v`, invalid UTF-8 bytes become `\xHH`, other
/// non-printables `\uHHHH` or `\UHHHHHHHH`. No surrounding quotes are
/// added.
pub fn append_quoted(buf: &mut Vec<u8>, s: &[u8]) {
    let mut rest = s;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                for ch in valid.chars() {
                    append_quoted_char(buf, ch);
                }
                break;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                    for ch in valid.chars() {
                        append_quoted_char(buf, ch);
                    }
                }
                // One invalid byte at a time, as `\xHH`.
                let bad = rest[valid_up_to];
                buf.extend_from_slice(b"\\x");
                buf.push(LOWERHEX[(bad >> 4) as usize]);
                buf.push(LOWERHEX[(bad & 0xf) as usize]);
                rest = &rest[valid_up_to + 1..];
            }
        }
    }
}

fn append_quoted_char(buf: &mut Vec<u8>, ch: char) {
    if ch == '"' || ch == '\\' {
        buf.push(b'\\');
        buf.push(ch as u8);
        return;
    }
    if is_print(ch) {
        let mut encoded = [0u8; 4];
        buf.extend_from_slice(ch.encode_utf8(&mut encoded).as_bytes());
        return;
    }
    match ch {
        '\x07' => buf.extend_from_slice(b"\\a"),
        '\x08' => buf.extend_from_slice(b"\\b"),
        '\x0c' => buf.extend_from_slice(b"\\f"),
        '\n' => buf.extend_from_slice(b"\\n"),
        '\r' => buf.extend_from_slice(b"\\r"),
        '\t' => buf.extend_from_slice(b"\\t"),
        '\x0b' => buf.extend_from_slice(b"\\v"),
        _ => {
            let code = ch as u32;
            if code < 0x20 {
                buf.extend_from_slice(b"\\x");
                buf.push(LOWERHEX[(code >> 4) as usize]);
                buf.push(LOWERHEX[(code & 0xf) as usize]);
            } else if code < 0x10000 {
                buf.extend_from_slice(b"\\u");
                for shift in [12u32, 8, 4, 0] {
                    buf.push(LOWERHEX[((code >> shift) & 0xf) as usize]);
                }
            } else {
                buf.extend_from_slice(b"\\U");
                for shift in [28u32, 24, 20, 16, 12, 8, 4, 0] {
                    buf.push(LOWERHEX[((code >> shift) & 0xf) as usize]);
                }
            }
        }
    }
}

fn is_print(ch: char) -> bool {
    ch == ' ' || (!ch.is_control() && !ch.is_whitespace())
}

/// Render one log line. Public to keep the formatting testable against
/// fixed timestamps.
pub fn render_line<Tz: TimeZone>(
    entry: &LogEntry,
    ts: &DateTime<Tz>,
    status: u16,
    size: u64,
    proxied_host: &str,
) -> Vec<u8>
where
    Tz::Offset: std::fmt::Display,
{
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(entry.remote_host.as_bytes());
    buf.extend_from_slice(b" - ");
    buf.extend_from_slice(entry.username.as_bytes());
    buf.extend_from_slice(b" [");
    buf.extend_from_slice(ts.format("%d/%b/%Y:%H:%M:%S %z").to_string().as_bytes());
    buf.extend_from_slice(b"] \"");
    buf.extend_from_slice(entry.method.as_bytes());
    buf.push(b' ');
    append_quoted(&mut buf, entry.uri.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(entry.proto.as_bytes());
    buf.extend_from_slice(b"\" ");
    buf.extend_from_slice(status.to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(size.to_string().as_bytes());

    append_field(&mut buf, entry.original_host.as_bytes());
    append_field(&mut buf, proxied_host.as_bytes());
    append_field(&mut buf, &entry.srcip);
    append_field(&mut buf, &entry.xff);

    buf.extend_from_slice(b" \"");
    append_quoted(&mut buf, &entry.referer);
    buf.extend_from_slice(b"\" \"");
    append_quoted(&mut buf, &entry.user_agent);
    buf.extend_from_slice(b"\"\n");
    buf
}

fn append_field(buf: &mut Vec<u8>, value: &[u8]) {
    buf.push(b' ');
    if value.is_empty() {
        buf.push(b'-');
    } else {
        append_quoted(buf, value);
    }
}

/// Middleware wrapping the router handler: captures the request context
/// on entry and defers the line to response-body completion.
pub async fn access_log_middleware(
    State(log): State<AccessLog>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ts = Local::now();
    let entry = LogEntry::capture(addr, &req);

    let response = next.run(req).await;
    let (mut parts, body) = response.into_parts();

    let proxied_host = parts
        .extensions
        .remove::<ProxiedHost>()
        .map(|host| host.0)
        .unwrap_or_default();
    let status = parts.status.as_u16();

    let body = Body::new(CountingBody {
        inner: body,
        pending: Some(PendingLine {
            log,
            entry,
            ts,
            status,
            proxied_host,
            size: 0,
        }),
    });
    Response::from_parts(parts, body)
}

struct PendingLine {
    log: AccessLog,
    entry: LogEntry,
    ts: DateTime<Local>,
    status: u16,
    proxied_host: String,
    size: u64,
}

impl PendingLine {
    fn emit(self) {
        let line = render_line(&self.entry, &self.ts, self.status, self.size, &self.proxied_host);
        self.log.write_line(&line);
    }
}

pin_project! {
    /// Response-body wrapper that accumulates the byte count and emits
    /// the log line exactly once, at end of stream or on drop.
    struct CountingBody {
        #[pin]
        inner: Body,
        pending: Option<PendingLine>,
    }

    impl PinnedDrop for CountingBody {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(pending) = this.pending.take() {
                pending.emit();
            }
        }
    }
}

impl http_body::Body for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let poll = this.inner.poll_frame(cx);
        match &poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(pending), Some(data)) = (this.pending.as_mut(), frame.data_ref()) {
                    pending.size += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                if let Some(pending) = this.pending.take() {
                    pending.emit();
                }
            }
            Poll::Pending => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
