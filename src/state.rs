//! Application state shared by the HTTP handlers and the collector listeners.

use herakles_res_monitor::{CollectorKind, Collectors};
use prometheus::{Gauge, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::ResourceMetrics;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub registry: Registry,
    pub metrics: ResourceMetrics,
    pub scrape_duration: Gauge,
    pub collectors: Arc<Collectors>,
    pub health_stats: HealthStats,
}

/// Counters behind the /health page.
pub struct HealthStats {
    started: Instant,
    http_requests: AtomicU64,
    notifications: [AtomicU64; 5],
}

impl Default for HealthStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            http_requests: AtomicU64::new(0),
            notifications: Default::default(),
        }
    }

    fn slot(kind: CollectorKind) -> usize {
        match kind {
            CollectorKind::Processor => 0,
            CollectorKind::Memory => 1,
            CollectorKind::Storage => 2,
            CollectorKind::Network => 3,
            CollectorKind::Sensors => 4,
        }
    }

    pub fn record_notification(&self, kind: CollectorKind) {
        self.notifications[Self::slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn notifications(&self, kind: CollectorKind) -> u64 {
        self.notifications[Self::slot(kind)].load(Ordering::Relaxed)
    }

    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_requests(&self) -> u64 {
        self.http_requests.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
