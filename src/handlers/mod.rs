//! HTTP endpoint handlers for the exporter.
//!
//! - `/metrics`: Prometheus text rendering of the current collector values
//! - `/health`: collector status table

pub mod health;
pub mod metrics;

pub use health::health_handler;
pub use metrics::metrics_handler;
