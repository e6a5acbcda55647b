//! Throttled, compressing upstream transport.
//!
//! Wraps the upstream HTTP client with two independent features:
//!
//! - Per-host admission control: each upstream host gets a bounded
//!   semaphore; a permit is held from before the round-trip until the
//!   response body is closed.
//! - Streaming gzip: qualifying response bodies are re-compressed on the
//!   fly through a pipe task, without buffering the payload.
//!
//! The transport also performs the static-backend response rewrite
//! (`Location`/`Refresh`) driven by the `x-static-root` request header.

use std::collections::HashMap;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Body;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{header, HeaderMap, HeaderValue, Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

/// Responses with a known length below this are not worth compressing.
const MTU_SIZE: u64 = 1000;

/// Media types eligible for on-the-fly compression. Matched as
/// substrings of `Content-Type`, so parameters do not defeat the check.
const COMPRESSIBLE_TYPES: &[&str] = &[
    "application/atom+xml",
    "application/javascript",
    "application/json",
    "application/rss+xml",
    "application/vnd.ms-fontobject",
    "application/x-font-ttf",
    "application/x-web-app-manifest+json",
    "application/xhtml+xml",
    "application/xml",
    "font/opentype",
    "image/svg+xml",
    "image/x-icon",
    "text/css",
    "text/plain",
    "text/x-component",
];

/// Upstream transport enforcing a per-host concurrency bound and
/// optionally compressing response bodies.
pub struct ThrottledTransport {
    client: Client<HttpConnector, Body>,
    max_concurrency_per_host: usize,
    compression_level: u32,
    // Lazily populated; entries live for the process lifetime.
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ThrottledTransport {
    pub fn new(
        max_concurrency_per_host: usize,
        compression_level: u32,
        dial_timeout: Duration,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(dial_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_concurrency_per_host)
            .build(connector);

        Self {
            client,
            max_concurrency_per_host,
            compression_level,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// The semaphore for `host`, creating it on first use.
    fn semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut table = self.semaphores.lock();
        table
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrency_per_host)))
            .clone()
    }

    /// Forward `req` upstream. Blocks on the per-host semaphore when the
    /// concurrency bound is enabled; the acquired permit is released when
    /// the returned response body is closed.
    pub async fn round_trip(&self, req: Request<Body>) -> anyhow::Result<Response<Body>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let url = req.uri().to_string();
        let wants_gzip = compression_enabled_request(req.headers());
        let static_root = req
            .headers()
            .get("x-static-root")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let permit = if self.max_concurrency_per_host > 0 {
            let semaphore = self.semaphore(&authority);
            Some(
                semaphore
                    .acquire_owned()
                    .await
                    .context("upstream semaphore closed")?,
            )
        } else {
            None
        };

        // An error releases the permit immediately (dropped here).
        let response = self
            .client
            .request(req)
            .await
            .with_context(|| format!("upstream round-trip to {authority:?} failed"))?;
        let mut response = response.map(Body::new);

        if let Some(root) = static_root.as_deref() {
            rewrite_static_headers(response.headers_mut(), root);
        }

        if let Ok(value) = HeaderValue::from_str(&url) {
            response.headers_mut().insert("x-kubernetes-url", value);
        }

        if self.compression_level > 0 && wants_gzip && compressible_response(response.headers()) {
            return Ok(compress_response(response, self.compression_level, permit));
        }

        if let Some(permit) = permit {
            response = response.map(|inner| {
                Body::new(PermitBody {
                    inner,
                    _permit: permit,
                })
            });
        }
        Ok(response)
    }

    #[cfg(test)]
    fn semaphore_count(&self) -> usize {
        self.semaphores.lock().len()
    }
}

/// Does the request accept a gzip response?
fn compression_enabled_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| !accept.is_empty() && accept.to_ascii_lowercase().contains("gzip"))
}

/// Is the response worth compressing? Requires an unknown or
/// MTU-exceeding length, no existing gzip encoding, and a whitelisted
/// content type.
fn compressible_response(headers: &HeaderMap) -> bool {
    if let Some(length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
    {
        if length < MTU_SIZE {
            return false;
        }
    }

    if let Some(encoding) = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
    {
        if !encoding.is_empty() && encoding.contains("gzip") {
            return false;
        }
    }

    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    if content_type.is_empty() {
        return false;
    }
    COMPRESSIBLE_TYPES
        .iter()
        .any(|candidate| content_type.contains(candidate))
}

/// Undo the static-root path prefix in redirect-carrying response
/// headers, mirroring nginx's `proxy_redirect`.
fn rewrite_static_headers(headers: &mut HeaderMap, static_root: &str) {
    if static_root.is_empty() {
        return;
    }

    let location = headers
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Some(location) = location {
        if !location.is_empty() {
            let translated = location.strip_prefix(static_root).unwrap_or(&location);
            if let Ok(value) = HeaderValue::from_str(translated) {
                debug!(location = translated, "location translated");
                headers.insert(header::LOCATION, value);
            }
            return;
        }
    }

    let refresh = headers
        .get("refresh")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Some(refresh) = refresh {
        if !refresh.is_empty() {
            let translated = refresh.replacen(static_root, "/", 1);
            if let Ok(value) = HeaderValue::from_str(&translated) {
                debug!(refresh = %translated, "refresh translated");
                headers.insert("refresh", value);
            }
        }
    }
}

/// Replace the response body with a streaming gzip pipe. A background
/// task reads the upstream body, feeds it through the encoder, and
/// closes everything on exit; the caller reads the compressed side.
/// When a semaphore permit is present it travels into the task and is
/// released when the task exits.
fn compress_response(
    response: Response<Body>,
    level: u32,
    permit: Option<OwnedSemaphorePermit>,
) -> Response<Body> {
    let (mut parts, mut body) = response.into_parts();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);

    tokio::spawn(async move {
        // Held until the upstream body is fully consumed or abandoned.
        let _permit = permit;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));

        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue; // trailers are dropped
                    };
                    if let Err(err) = encoder.write_all(&data) {
                        error!(%err, "gzip encode failed");
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    let compressed = std::mem::take(encoder.get_mut());
                    if !compressed.is_empty()
                        && tx.send(Ok(Bytes::from(compressed))).await.is_err()
                    {
                        // Consumer went away; stop reading upstream.
                        return;
                    }
                }
                Some(Err(err)) => {
                    error!(%err, "upstream body failed mid-compression");
                    let _ = tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, err)))
                        .await;
                    return;
                }
                None => break,
            }
        }

        match encoder.finish() {
            Ok(tail) => {
                if !tail.is_empty() {
                    let _ = tx.send(Ok(Bytes::from(tail))).await;
                }
            }
            Err(err) => {
                error!(%err, "gzip finish failed");
                let _ = tx.send(Err(err)).await;
            }
        }
    });

    parts
        .headers
        .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    // The compressed length is unknown in advance.
    parts.headers.remove(header::CONTENT_LENGTH);

    Response::from_parts(parts, Body::from_stream(ReceiverStream::new(rx)))
}

pin_project! {
    /// Response body holding its admission permit: the permit is
    /// released exactly once, when the body is dropped after draining
    /// or on client disconnect.
    struct PermitBody {
        #[pin]
        inner: Body,
        _permit: OwnedSemaphorePermit,
    }
}

impl http_body::Body for PermitBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn request_compression_requires_gzip_accept_encoding() {
        assert!(compression_enabled_request(&headers(&[(
            "accept-encoding",
            "gzip, deflate"
        )])));
        assert!(compression_enabled_request(&headers(&[(
            "accept-encoding",
            "GZIP"
        )])));
        assert!(!compression_enabled_request(&headers(&[(
            "accept-encoding",
            "br"
        )])));
        assert!(!compression_enabled_request(&headers(&[])));
    }

    #[test]
    fn large_json_is_compressible() {
        assert!(compressible_response(&headers(&[
            ("content-type", "application/json"),
            ("content-length", "2000"),
        ])));
    }

    #[test]
    fn small_response_is_not_compressible() {
        assert!(!compressible_response(&headers(&[
            ("content-type", "application/json"),
            ("content-length", "500"),
        ])));
    }

    #[test]
    fn unknown_length_is_compressible() {
        assert!(compressible_response(&headers(&[(
            "content-type",
            "text/plain"
        )])));
    }

    #[test]
    fn content_type_parameters_do_not_defeat_the_check() {
        assert!(compressible_response(&headers(&[
            ("content-type", "text/plain; charset=utf-8"),
            ("content-length", "4096"),
        ])));
    }

    #[test]
    fn already_gzipped_is_not_recompressed() {
        assert!(!compressible_response(&headers(&[
            ("content-type", "application/json"),
            ("content-encoding", "gzip"),
        ])));
    }

    #[test]
    fn missing_or_unlisted_content_type_is_not_compressible() {
        assert!(!compressible_response(&headers(&[("content-length", "2000")])));
        assert!(!compressible_response(&headers(&[
            ("content-type", "image/png"),
            ("content-length", "2000"),
        ])));
    }

    #[test]
    fn location_prefix_is_stripped_once() {
        let mut map = headers(&[("location", "/well_workout/projects/workouts/")]);
        rewrite_static_headers(&mut map, "/well_workout/");
        assert_eq!(map.get("location").unwrap(), "projects/workouts/");
    }

    #[test]
    fn location_without_prefix_is_untouched() {
        let mut map = headers(&[("location", "/elsewhere")]);
        rewrite_static_headers(&mut map, "/well_workout/");
        assert_eq!(map.get("location").unwrap(), "/elsewhere");
    }

    #[test]
    fn refresh_rewritten_only_when_location_absent() {
        let mut map = headers(&[("refresh", "0; url=/well_workout/next")]);
        rewrite_static_headers(&mut map, "/well_workout/");
        assert_eq!(map.get("refresh").unwrap(), "0; url=/next");

        let mut both = headers(&[
            ("location", "/well_workout/a"),
            ("refresh", "0; url=/well_workout/b"),
        ]);
        rewrite_static_headers(&mut both, "/well_workout/");
        assert_eq!(both.get("location").unwrap(), "a");
        assert_eq!(both.get("refresh").unwrap(), "0; url=/well_workout/b");
    }

    #[tokio::test]
    async fn gzip_stream_round_trips() {
        let payload = "{\"data\": \"abcdefghij\"}".repeat(200);
        let response = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, payload.len().to_string())
            .body(Body::from(payload.clone()))
            .unwrap();

        let compressed = compress_response(response, 4, None);
        assert_eq!(
            compressed.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        assert!(compressed.headers().get(header::CONTENT_LENGTH).is_none());

        let body = compressed.into_body().collect().await.unwrap().to_bytes();
        let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn permit_released_when_body_dropped() {
        let semaphore = Arc::new(Semaphore::new(2));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        assert_eq!(semaphore.available_permits(), 1);

        let body = Body::new(PermitBody {
            inner: Body::from("payload"),
            _permit: permit,
        });
        assert_eq!(semaphore.available_permits(), 1);

        drop(body);
        assert_eq!(semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn permit_released_after_body_drained() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();

        let body = Body::new(PermitBody {
            inner: Body::from("payload"),
            _permit: permit,
        });
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes.as_ref(), b"payload");
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn permit_travels_with_the_compressor_task() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();

        let response = Response::builder()
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("x".repeat(4096)))
            .unwrap();
        let compressed = compress_response(response, 4, Some(permit));

        // Draining the pipe lets the compressor task finish and release.
        let _ = compressed.into_body().collect().await.unwrap();
        tokio::task::yield_now().await;
        let reacquired = semaphore.clone().acquire_owned().await.unwrap();
        drop(reacquired);
    }

    #[tokio::test]
    async fn semaphore_table_is_lazily_populated() {
        let transport = ThrottledTransport::new(4, 0, Duration::from_secs(1));
        assert_eq!(transport.semaphore_count(), 0);

        let first = transport.semaphore("backend-a:80");
        let again = transport.semaphore("backend-a:80");
        assert!(Arc::ptr_eq(&first, &again));
        let _other = transport.semaphore("backend-b:80");
        assert_eq!(transport.semaphore_count(), 2);
        assert_eq!(first.available_permits(), 4);
    }
}
