//! Kubernetes DNS reverse proxy
//!
//! A reverse proxy that routes incoming HTTP requests by `Host` header
//! and longest matching path prefix:
//! - Table-matched services resolve through the cluster DNS suffix
//! - Targets beginning with `/` proxy to a static-content backend
//! - Targets beginning with `>` answer with a 301 redirect
//! - Hosts carrying a configured domain suffix route directly
//! - Everything else goes to an optional fallback backend
//!
//! Upstream traffic is throttled per host with bounded semaphores and
//! qualifying responses are gzip-compressed on the fly. Completed
//! requests are written to an extended Apache combined access log.

pub mod accesslog;
pub mod config;
pub mod director;
pub mod metrics;
pub mod paths;
pub mod router;
pub mod transport;

// Re-export commonly used types
pub use accesslog::AccessLog;
pub use config::Config;
pub use director::{Director, Matcher, RouteError};
pub use metrics::Metrics;
pub use router::{app, status_app, AppState};
pub use transport::ThrottledTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
