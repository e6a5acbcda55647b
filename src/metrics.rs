//! Routing decision counters.
//!
//! A plain counter sink: the router increments these at its decision
//! points and `snapshot()` exposes the totals. Export to an external
//! metrics system is left to the embedding platform.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Instance-owned counter registry.
#[derive(Debug, Default)]
pub struct Metrics {
    no_matching_service: AtomicU64,
    redirect_301: AtomicU64,
    fallback: AtomicU64,
    no_route_no_fallback: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request host absent from the routing table.
    pub fn inc_no_matching_service(&self) {
        self.no_matching_service.fetch_add(1, Ordering::Relaxed);
    }

    /// Request answered with a 301 redirect.
    pub fn inc_redirect_301(&self) {
        self.redirect_301.fetch_add(1, Ordering::Relaxed);
    }

    /// Request sent to the fallback backend.
    pub fn inc_fallback(&self) {
        self.fallback.fetch_add(1, Ordering::Relaxed);
    }

    /// Request matched no route while the fallback was disabled.
    pub fn inc_no_route_no_fallback(&self) {
        self.no_route_no_fallback.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            no_matching_service: self.no_matching_service.load(Ordering::Relaxed),
            redirect_301: self.redirect_301.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
            no_route_no_fallback: self.no_route_no_fallback.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub no_matching_service: u64,
    pub redirect_301: u64,
    pub fallback: u64,
    pub no_route_no_fallback: u64,
}
