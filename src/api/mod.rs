//! API layer
//!
//! HTTP handlers for:
//! - Admin API (dead-letter queue and instance operations)
//! - Metrics (Prometheus)

mod admin;
pub mod metrics;

pub use admin::admin_router;
pub use metrics::metrics_router;
