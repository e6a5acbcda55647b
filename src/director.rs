//! Host and path-prefix routing table.
//!
//! The `Director` owns one `Matcher` per host. A `Matcher` resolves a
//! request path to the target of the longest configured path prefix.
//! Both are built once at startup from the routes file and are read-only
//! while serving, so the lookup path takes no locks.

use std::collections::HashMap;

use thiserror::Error;

/// Routing lookup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteError {
    /// The request host is not present in the routing table.
    #[error("no matching service found")]
    NoMatchingService,
    /// The host is known but no configured prefix matches the path.
    #[error("no matching prefix found")]
    NoMatchingPrefix,
}

/// Longest-prefix resolver for a single host.
///
/// Prefixes are kept sorted by length, descending, with equal-length
/// prefixes in insertion order. A scan from the front therefore returns
/// the most specific match first.
#[derive(Debug, Default)]
pub struct Matcher {
    prefixes_list: Vec<String>,
    prefixes: HashMap<String, String>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` under `prefix`. Re-setting an existing prefix
    /// updates the target without disturbing the ordered list.
    pub fn set_prefix(&mut self, prefix: &str, target: &str) {
        if !self.prefixes.contains_key(prefix) {
            let index = self
                .prefixes_list
                .partition_point(|existing| existing.len() >= prefix.len());
            self.prefixes_list.insert(index, prefix.to_string());
        }
        self.prefixes.insert(prefix.to_string(), target.to_string());
    }

    /// Resolve `path` to `(target, matched_prefix)`.
    ///
    /// Comparison is byte-exact: no case folding, no slash collapsing,
    /// no percent decoding.
    pub fn match_path(&self, path: &str) -> Result<(&str, &str), RouteError> {
        for prefix in &self.prefixes_list {
            if path.starts_with(prefix.as_str()) {
                if let Some(target) = self.prefixes.get(prefix) {
                    return Ok((target.as_str(), prefix.as_str()));
                }
            }
        }
        Err(RouteError::NoMatchingPrefix)
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes_list.is_empty()
    }
}

/// Top-level router mapping hosts to per-host matchers.
///
/// Hosts are compared byte-exact; no port stripping is applied.
#[derive(Debug, Default)]
pub struct Director {
    domains: HashMap<String, Matcher>,
}

impl Director {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a director from a decoded routes file
    /// (`host -> prefix -> target`).
    pub fn from_routes(routes: &HashMap<String, HashMap<String, String>>) -> Self {
        let mut director = Self::new();
        for (host, prefixes) in routes {
            for (prefix, target) in prefixes {
                director.set_service(host, prefix, target);
            }
        }
        director
    }

    pub fn set_service(&mut self, host: &str, prefix: &str, target: &str) {
        self.domains
            .entry(host.to_string())
            .or_default()
            .set_prefix(prefix, target);
    }

    /// Look up the target for `host` and `path`.
    pub fn service(&self, host: &str, path: &str) -> Result<(&str, &str), RouteError> {
        match self.domains.get(host) {
            Some(matcher) => matcher.match_path(path),
            None => Err(RouteError::NoMatchingService),
        }
    }

    /// Number of hosts with at least one route.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
