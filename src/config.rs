//! Proxy configuration and routes file loading.
//!
//! All configuration comes from CLI flags; the routing table comes from
//! an optional JSON file of shape `{ host: { path_prefix: target } }`.
//! The configuration is built once at startup and read-only afterwards.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

/// Decoded routes file: `host -> path_prefix -> target`.
pub type Routes = HashMap<String, HashMap<String, String>>;

/// Proxy configuration, bound directly to the CLI flag surface.
#[derive(Debug, Clone, Parser)]
#[command(name = "kubedns-proxy", version, about, long_about = None)]
pub struct Config {
    /// Address to run the proxy server on
    #[arg(long, default_value = ":8080")]
    pub address: String,

    /// Address to run the status server on
    #[arg(long = "status-address", default_value = ":8081")]
    pub status_address: String,

    /// Comma-separated domain suffixes for direct service routing
    #[arg(long = "domain-suffixes", default_value = ".local")]
    pub domain_suffixes_raw: String,

    #[command(flatten)]
    pub kubernetes: KubernetesConfig,

    #[command(flatten)]
    pub static_backend: StaticBackendConfig,

    #[command(flatten)]
    pub fallback: FallbackConfig,

    /// Path to a routes JSON file
    #[arg(long = "routes", default_value = "")]
    pub routes_filename: String,

    /// Validate the routes file and exit
    #[arg(long = "validate-routes")]
    pub validate_routes: bool,

    /// Maximum in-flight requests per upstream host (0 disables throttling)
    #[arg(long, default_value_t = 32)]
    pub concurrency: usize,

    /// Gzip compression level, 0 to disable
    #[arg(long = "compression-level", default_value_t = 4)]
    pub compression_level: u32,

    /// Upstream dial timeout (e.g. "500ms", "1s")
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Elevate the default log level to debug
    #[arg(long)]
    pub verbose: bool,
}

/// Kubernetes DNS naming, from which the service suffix is derived.
#[derive(Debug, Clone, clap::Args)]
pub struct KubernetesConfig {
    /// Kubernetes namespace to serve
    #[arg(long = "kubernetes-namespace", id = "kubernetes-namespace", default_value = "default")]
    pub namespace: String,

    /// Kubernetes DNS domain
    #[arg(long = "kubernetes-dns-domain", id = "kubernetes-dns-domain", default_value = "cluster.local")]
    pub dns_domain: String,
}

/// The static-content backend, used for targets beginning with `/`.
#[derive(Debug, Clone, clap::Args)]
pub struct StaticBackendConfig {
    /// Enable the static proxy
    #[arg(long = "static", id = "static")]
    pub enable: bool,

    /// Static backend scheme
    #[arg(long = "static-scheme", id = "static-scheme", default_value = "http")]
    pub scheme: String,

    /// Static backend host
    #[arg(long = "static-host", id = "static-host", default_value = "")]
    pub host: String,

    /// Static backend path
    #[arg(long = "static-path", id = "static-path", default_value = "/")]
    pub path: String,
}

/// The catch-all backend for requests matching no route and no suffix.
#[derive(Debug, Clone, clap::Args)]
pub struct FallbackConfig {
    /// Enable the fallback proxy
    #[arg(long = "fallback", id = "fallback")]
    pub enable: bool,

    /// Fallback backend scheme
    #[arg(long = "fallback-scheme", id = "fallback-scheme", default_value = "http")]
    pub scheme: String,

    /// Fallback backend host
    #[arg(long = "fallback-host", id = "fallback-host", default_value = "")]
    pub host: String,

    /// Fallback backend path
    #[arg(long = "fallback-path", id = "fallback-path", default_value = "/")]
    pub path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: ":8080".to_string(),
            status_address: ":8081".to_string(),
            domain_suffixes_raw: ".local".to_string(),
            kubernetes: KubernetesConfig::default(),
            static_backend: StaticBackendConfig::default(),
            fallback: FallbackConfig::default(),
            routes_filename: String::new(),
            validate_routes: false,
            concurrency: 32,
            compression_level: 4,
            timeout: Duration::from_secs(1),
            verbose: false,
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            dns_domain: "cluster.local".to_string(),
        }
    }
}

impl Default for StaticBackendConfig {
    fn default() -> Self {
        Self {
            enable: false,
            scheme: "http".to_string(),
            host: String::new(),
            path: "/".to_string(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enable: false,
            scheme: "http".to_string(),
            host: String::new(),
            path: "/".to_string(),
        }
    }
}

impl Config {
    /// The configured domain suffixes, in flag order.
    pub fn domain_suffixes(&self) -> Vec<&str> {
        self.domain_suffixes_raw.split(',').collect()
    }

    /// The Kubernetes service domain suffix. Appended to a service name,
    /// it gives the in-cluster hostname the service is available on.
    pub fn kubernetes_suffix(&self) -> String {
        format!(".{}.{}", self.kubernetes.namespace, self.kubernetes.dns_domain)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr().context("invalid proxy address")?;
        self.status_listen_addr().context("invalid status address")?;

        if self.compression_level > 9 {
            bail!(
                "compression level must be between 0 and 9, got {}",
                self.compression_level
            );
        }
        if self.static_backend.enable && self.static_backend.host.is_empty() {
            bail!("static backend is enabled but no static host is configured");
        }
        if self.fallback.enable && self.fallback.host.is_empty() {
            bail!("fallback is enabled but no fallback host is configured");
        }

        Ok(())
    }

    /// Proxy listen address. `:8080` shorthand binds all interfaces.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_listen_addr(&self.address)
    }

    /// Status listen address.
    pub fn status_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_listen_addr(&self.status_address)
    }
}

fn parse_listen_addr(raw: &str) -> anyhow::Result<SocketAddr> {
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid listen address {raw:?}"))
}

/// Parse a duration flag value: a number followed by `ms`, `s`, `m`, or
/// `h`. A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (value, unit) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
        Some(index) => raw.split_at(index),
        None => (raw, "s"),
    };
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    if value < 0.0 {
        return Err(format!("duration {raw:?} must not be negative"));
    }
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("unknown duration unit {unit:?} in {raw:?}")),
    };
    Ok(Duration::from_secs_f64(secs))
}

/// Read and decode the routes file.
pub fn load_routes(path: &str) -> anyhow::Result<Routes> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("unable to read routes file {path:?}"))?;
    parse_routes(&raw)
}

/// Decode routes JSON: a two-level object of `host -> prefix -> target`.
pub fn parse_routes(raw: &str) -> anyhow::Result<Routes> {
    serde_json::from_str(raw).context("routes file is not a two-level JSON object")
}
