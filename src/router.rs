//! Request classification and rewriting.
//!
//! Every request lands here and is classified into one of five
//! outcomes: a suffix-matched service proxy, a table-matched service
//! proxy, a static-backend proxy, a 301 redirect, or the fallback.
//! Classification is computed first, as a plain value, and only then
//! applied to the request before it is handed to the transport.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tracing::{debug, error};
use url::Url;

use crate::accesslog::{access_log_middleware, AccessLog, ProxiedHost};
use crate::config::Config;
use crate::director::{Director, RouteError};
use crate::metrics::Metrics;
use crate::paths;
use crate::transport::ThrottledTransport;

/// Shared state for the proxy handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub director: Arc<Director>,
    pub transport: Arc<ThrottledTransport>,
    pub metrics: Arc<Metrics>,
}

/// How a request is to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePlan {
    Proxy(ProxyRewrite),
    Redirect { location: String },
    NoRoute,
}

/// The rewrite applied to a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRewrite {
    pub scheme: String,
    pub host: String,
    /// Replacement request path; `None` keeps the original.
    pub path: Option<String>,
    /// Outbound `Host` header override; `None` keeps the original.
    pub host_header: Option<String>,
    /// `x-static-root` value for the response-side rewrite.
    pub static_root: Option<String>,
    /// `x-original-url` value recorded before the rewrite.
    pub original_url: Option<String>,
    pub strip_cookies: bool,
}

impl ProxyRewrite {
    fn service(scheme: &str, host: String) -> Self {
        Self {
            scheme: scheme.to_string(),
            host,
            path: None,
            host_header: None,
            static_root: None,
            original_url: None,
            strip_cookies: false,
        }
    }
}

/// Classify a request into its dispatch plan. Pure with respect to the
/// request: the caller applies the plan afterwards.
pub fn plan_route(
    config: &Config,
    director: &Director,
    metrics: &Metrics,
    host: &str,
    uri: &Uri,
) -> RoutePlan {
    let path = uri.path();

    match director.service(host, path) {
        Ok((target, prefix)) => {
            if config.static_backend.enable && target.starts_with('/') {
                plan_static(config, host, uri, target)
            } else if let Some(redirect_target) = target.strip_prefix('>') {
                plan_redirect(metrics, uri, prefix, redirect_target)
            } else {
                debug!(host, path, target, "service route");
                RoutePlan::Proxy(ProxyRewrite::service(
                    "http",
                    format!("{}{}", target, config.kubernetes_suffix()),
                ))
            }
        }
        Err(err) => {
            if err == RouteError::NoMatchingService {
                metrics.inc_no_matching_service();
            }
            // Both lookup failures take the suffix-then-fallback path.
            plan_unrouted(config, metrics, host, path)
        }
    }
}

fn plan_static(config: &Config, host: &str, uri: &Uri, target: &str) -> RoutePlan {
    let backend = &config.static_backend;
    let path = uri.path();

    // The response-side rewrite needs to know which prefix to strip.
    let static_root = format!("{}/", paths::join(&[&backend.host, &backend.path, target]));
    let original_url = format!(
        "{}{}",
        host,
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );

    // Joining swallows trailing slashes; restore them, they are
    // significant to file servers.
    let trailing = path.ends_with('/');
    let mut new_path = paths::join(&[&backend.path, target, path]);
    if trailing && !new_path.ends_with('/') {
        new_path.push('/');
    }

    debug!(from = %original_url, to = %format!("{}{}", backend.host, new_path), "static route");

    RoutePlan::Proxy(ProxyRewrite {
        scheme: backend.scheme.clone(),
        host: backend.host.clone(),
        path: Some(new_path),
        host_header: Some(backend.host.clone()),
        static_root: Some(static_root),
        original_url: Some(original_url),
        // The static backend's responses must not vary per user.
        strip_cookies: true,
    })
}

fn plan_redirect(metrics: &Metrics, uri: &Uri, prefix: &str, redirect_target: &str) -> RoutePlan {
    let mut redirect_url = match Url::parse(redirect_target) {
        Ok(url) => url,
        Err(err) => {
            error!(%err, target = redirect_target, "invalid redirect target in routes");
            return RoutePlan::NoRoute;
        }
    };

    let rest = uri.path().replacen(prefix, "/", 1);
    let new_path = paths::join(&[redirect_url.path(), &rest]);
    redirect_url.set_path(&new_path);
    if let Some(query) = uri.query() {
        if !query.is_empty() {
            redirect_url.set_query(Some(query));
        }
    }

    metrics.inc_redirect_301();
    debug!(path = uri.path(), location = %redirect_url, "redirect route");
    RoutePlan::Redirect {
        location: redirect_url.to_string(),
    }
}

fn plan_unrouted(config: &Config, metrics: &Metrics, host: &str, path: &str) -> RoutePlan {
    // Direct service routing: http://{service}{domain-suffix}/ resolves
    // the service through the cluster DNS suffix. First configured
    // suffix wins. DNS names are case-insensitive, so fold both sides.
    for suffix in config.domain_suffixes() {
        if suffix.is_empty() || host.len() < suffix.len() {
            continue;
        }
        let (root, tail) = host.split_at(host.len() - suffix.len());
        if tail.eq_ignore_ascii_case(suffix) {
            let upstream = format!("{}{}", root, config.kubernetes_suffix());
            debug!(host, upstream = %upstream, path, "domain suffix match");
            return RoutePlan::Proxy(ProxyRewrite::service("http", upstream));
        }
    }

    if config.fallback.enable {
        metrics.inc_fallback();
        debug!(host, path, fallback = %config.fallback.host, "fallback route");
        return RoutePlan::Proxy(ProxyRewrite {
            scheme: config.fallback.scheme.clone(),
            host: config.fallback.host.clone(),
            path: Some(paths::join(&[&config.fallback.path, path])),
            host_header: None,
            static_root: None,
            original_url: None,
            strip_cookies: false,
        });
    }

    metrics.inc_no_route_no_fallback();
    error!(host, path, "no route matched and fallback not enabled");
    RoutePlan::NoRoute
}

/// The proxy handler: classify, rewrite, forward.
pub async fn route_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (mut parts, body) = req.into_parts();

    // Drop the connection header to ensure upstream keepalives.
    parts.headers.remove(header::CONNECTION);

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default();

    match plan_route(&state.config, &state.director, &state.metrics, &host, &parts.uri) {
        RoutePlan::Redirect { location } => match HeaderValue::from_str(&location) {
            Ok(value) => Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(header::LOCATION, value)
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(err) => {
                error!(%err, location = %location, "redirect location is not a valid header value");
                (StatusCode::BAD_GATEWAY, "invalid redirect target").into_response()
            }
        },
        RoutePlan::NoRoute => (StatusCode::BAD_GATEWAY, "no route").into_response(),
        RoutePlan::Proxy(rewrite) => {
            let proxied_host = rewrite.host.clone();
            match forward(&state, parts, body, &host, rewrite).await {
                Ok(mut response) => {
                    response.extensions_mut().insert(ProxiedHost(proxied_host));
                    response
                }
                Err(err) => {
                    error!(%err, host = %host, "upstream request failed");
                    (StatusCode::BAD_GATEWAY, "upstream error").into_response()
                }
            }
        }
    }
}

/// Apply a proxy rewrite and delegate to the throttled transport.
async fn forward(
    state: &AppState,
    mut parts: http::request::Parts,
    body: Body,
    original_host: &str,
    rewrite: ProxyRewrite,
) -> anyhow::Result<Response> {
    let path = rewrite.path.as_deref().unwrap_or_else(|| parts.uri.path());
    let target = match parts.uri.query() {
        Some(query) => format!("{}://{}{}?{}", rewrite.scheme, rewrite.host, path, query),
        None => format!("{}://{}{}", rewrite.scheme, rewrite.host, path),
    };
    let uri: Uri = target
        .parse()
        .map_err(|err| anyhow::anyhow!("rewritten URL {target:?} is invalid: {err}"))?;

    if let Some(static_root) = &rewrite.static_root {
        parts
            .headers
            .insert("x-static-root", HeaderValue::from_str(static_root)?);
    }
    if let Some(original_url) = &rewrite.original_url {
        parts
            .headers
            .insert("x-original-url", HeaderValue::from_str(original_url)?);
    }
    if rewrite.strip_cookies {
        parts.headers.remove(header::COOKIE);
    }

    // The Host header on the wire: an explicit override wins; otherwise
    // the client's original host is preserved (HTTP/2 requests carry it
    // in the URI authority instead of a header).
    if let Some(host_header) = &rewrite.host_header {
        parts
            .headers
            .insert(header::HOST, HeaderValue::from_str(host_header)?);
    } else if !parts.headers.contains_key(header::HOST) && !original_host.is_empty() {
        parts
            .headers
            .insert(header::HOST, HeaderValue::from_str(original_host)?);
    }

    parts.uri = uri;
    let response = state
        .transport
        .round_trip(Request::from_parts(parts, body))
        .await?;
    Ok(response.into_response())
}

/// Build the proxy application: the routing handler wrapped in the
/// access-log layer.
pub fn app(state: AppState, access_log: AccessLog) -> Router {
    Router::new()
        .fallback(any(route_handler))
        .layer(middleware::from_fn_with_state(
            access_log,
            access_log_middleware,
        ))
        .with_state(state)
}

/// The status application: answers `ok` on every path.
pub fn status_app() -> Router {
    Router::new().fallback(any(status_handler))
}

async fn status_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.kubernetes.namespace = "default".to_string();
        config.kubernetes.dns_domain = "svc.cluster.local".to_string();
        config.domain_suffixes_raw = ".local".to_string();
        config
    }

    fn plan(config: &Config, director: &Director, host: &str, uri: &str) -> RoutePlan {
        let uri: Uri = uri.parse().unwrap();
        plan_route(config, director, &Metrics::new(), host, &uri)
    }

    #[test]
    fn table_match_routes_to_cluster_service() {
        let config = test_config();
        let mut director = Director::new();
        director.set_service("www.cats.com", "/", "cats");

        let RoutePlan::Proxy(rewrite) = plan(&config, &director, "www.cats.com", "/tabby") else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.scheme, "http");
        assert_eq!(rewrite.host, "cats.default.svc.cluster.local");
        assert_eq!(rewrite.path, None);
        assert_eq!(rewrite.host_header, None);
        assert!(!rewrite.strip_cookies);
    }

    #[test]
    fn redirect_root_prefix() {
        let config = test_config();
        let mut director = Director::new();
        director.set_service("www.dogs.com", "/", ">https://www.cats.com");

        assert_eq!(
            plan(&config, &director, "www.dogs.com", "/"),
            RoutePlan::Redirect {
                location: "https://www.cats.com/".to_string()
            }
        );
    }

    #[test]
    fn redirect_strips_matched_prefix_once() {
        let config = test_config();
        let mut director = Director::new();
        director.set_service("www.dogs.com", "/", ">https://www.cats.com");
        director.set_service("www.dogs.com", "/brown", ">https://www.cats.com");

        assert_eq!(
            plan(&config, &director, "www.dogs.com", "/brown/good"),
            RoutePlan::Redirect {
                location: "https://www.cats.com/good".to_string()
            }
        );
        assert_eq!(
            plan(&config, &director, "www.dogs.com", "/yellow"),
            RoutePlan::Redirect {
                location: "https://www.cats.com/yellow".to_string()
            }
        );
    }

    #[test]
    fn redirect_preserves_query() {
        let config = test_config();
        let mut director = Director::new();
        director.set_service("www.dogs.com", "/", ">https://www.cats.com");

        assert_eq!(
            plan(&config, &director, "www.dogs.com", "/search?q=bones"),
            RoutePlan::Redirect {
                location: "https://www.cats.com/search?q=bones".to_string()
            }
        );
    }

    #[test]
    fn domain_suffix_match_routes_directly() {
        let config = test_config();
        let director = Director::new();

        let RoutePlan::Proxy(rewrite) = plan(&config, &director, "svc.local", "/x") else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.host, "svc.default.svc.cluster.local");
        assert_eq!(rewrite.scheme, "http");
        assert_eq!(rewrite.path, None);
    }

    #[test]
    fn domain_suffix_match_is_case_insensitive() {
        let config = test_config();
        let director = Director::new();

        let RoutePlan::Proxy(rewrite) = plan(&config, &director, "svc.LOCAL", "/") else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.host, "svc.default.svc.cluster.local");
    }

    #[test]
    fn first_configured_suffix_wins() {
        let mut config = test_config();
        config.domain_suffixes_raw = ".a.local,.local".to_string();
        let director = Director::new();

        let RoutePlan::Proxy(rewrite) = plan(&config, &director, "svc.a.local", "/") else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.host, "svc.default.svc.cluster.local");
    }

    #[test]
    fn static_target_rewrites_path_and_headers() {
        let mut config = test_config();
        config.static_backend.enable = true;
        config.static_backend.host = "bucket.example.com".to_string();
        config.static_backend.path = "/".to_string();
        let mut director = Director::new();
        director.set_service("well.example.com", "/", "/well_workout");

        let RoutePlan::Proxy(rewrite) =
            plan(&config, &director, "well.example.com", "/projects/workouts")
        else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.host, "bucket.example.com");
        assert_eq!(rewrite.host_header.as_deref(), Some("bucket.example.com"));
        assert_eq!(rewrite.path.as_deref(), Some("/well_workout/projects/workouts"));
        assert_eq!(
            rewrite.static_root.as_deref(),
            Some("bucket.example.com/well_workout/")
        );
        assert_eq!(
            rewrite.original_url.as_deref(),
            Some("well.example.com/projects/workouts")
        );
        assert!(rewrite.strip_cookies);
    }

    #[test]
    fn static_join_restores_trailing_slash() {
        let mut config = test_config();
        config.static_backend.enable = true;
        config.static_backend.host = "bucket.example.com".to_string();
        let mut director = Director::new();
        director.set_service("well.example.com", "/", "/well_workout");

        let RoutePlan::Proxy(rewrite) =
            plan(&config, &director, "well.example.com", "/projects/workouts/")
        else {
            panic!("expected proxy plan");
        };
        assert_eq!(
            rewrite.path.as_deref(),
            Some("/well_workout/projects/workouts/")
        );
    }

    #[test]
    fn static_target_without_static_backend_is_a_service() {
        let config = test_config();
        let mut director = Director::new();
        director.set_service("well.example.com", "/", "/well_workout");

        // Static disabled: a "/"-leading target falls through to service
        // routing, mirroring the lookup table's precedence.
        let RoutePlan::Proxy(rewrite) = plan(&config, &director, "well.example.com", "/x") else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.host, "/well_workout.default.svc.cluster.local");
    }

    #[test]
    fn fallback_catches_unrouted_hosts() {
        let mut config = test_config();
        config.fallback.enable = true;
        config.fallback.host = "legacy.example.com".to_string();
        config.fallback.path = "/archive".to_string();
        let director = Director::new();

        let RoutePlan::Proxy(rewrite) = plan(&config, &director, "old.example.com", "/page") else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.host, "legacy.example.com");
        assert_eq!(rewrite.path.as_deref(), Some("/archive/page"));
    }

    #[test]
    fn no_route_without_fallback() {
        let config = test_config();
        let director = Director::new();
        let metrics = Metrics::new();

        let uri: Uri = "/page".parse().unwrap();
        let plan = plan_route(&config, &director, &metrics, "old.example.com", &uri);
        assert_eq!(plan, RoutePlan::NoRoute);
        assert_eq!(metrics.snapshot().no_route_no_fallback, 1);
        assert_eq!(metrics.snapshot().no_matching_service, 1);
    }

    #[test]
    fn prefix_miss_on_known_host_takes_unrouted_path() {
        let mut config = test_config();
        config.fallback.enable = true;
        config.fallback.host = "legacy.example.com".to_string();
        let mut director = Director::new();
        director.set_service("www.cats.com", "/api", "cats-api");

        let RoutePlan::Proxy(rewrite) = plan(&config, &director, "www.cats.com", "/web") else {
            panic!("expected proxy plan");
        };
        assert_eq!(rewrite.host, "legacy.example.com");
    }
}
