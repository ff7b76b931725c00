//! Settings change bus.
//!
//! One broadcast channel carries every `(collector, setting)` change. Each
//! collector gets a small dispatcher task that turns the changes addressed to
//! it into start/stop/restart calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collector::Collector;
use crate::config::{MAX_UPDATE_INTERVAL_SECS, MIN_UPDATE_INTERVAL_SECS};

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorKind {
    Processor,
    Memory,
    Storage,
    Network,
    Sensors,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 5] = [
        CollectorKind::Processor,
        CollectorKind::Memory,
        CollectorKind::Storage,
        CollectorKind::Network,
        CollectorKind::Sensors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorKind::Processor => "processor",
            CollectorKind::Memory => "memory",
            CollectorKind::Storage => "storage",
            CollectorKind::Network => "network",
            CollectorKind::Sensors => "sensors",
        }
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    Enabled(bool),
    /// Seconds between ticks.
    UpdateInterval(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingChange {
    pub collector: CollectorKind,
    pub setting: Setting,
}

impl SettingChange {
    pub fn new(collector: CollectorKind, setting: Setting) -> Self {
        Self { collector, setting }
    }
}

/// Effective settings of one collector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectorSettings {
    pub enabled: bool,
    pub update_interval: f64,
}

#[derive(Debug, Clone)]
pub struct SettingsBus {
    sender: broadcast::Sender<SettingChange>,
}

impl Default for SettingsBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes a change. Returns the number of dispatchers that received it.
    pub fn publish(&self, change: SettingChange) -> usize {
        debug!("Setting change: {} {:?}", change.collector, change.setting);
        self.sender.send(change).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.sender.subscribe()
    }
}

fn interval_from_secs(secs: f64) -> Option<Duration> {
    if !(MIN_UPDATE_INTERVAL_SECS..=MAX_UPDATE_INTERVAL_SECS).contains(&secs) {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Applies one change to `collector`.
pub fn apply<C: Collector>(collector: &Arc<C>, setting: Setting) {
    let name = collector.monitor().name();
    match setting {
        Setting::Enabled(true) => collector.start(),
        Setting::Enabled(false) => collector.stop(),
        Setting::UpdateInterval(secs) => match interval_from_secs(secs) {
            Some(interval) => collector.set_update_interval(interval),
            None => warn!("{}: ignoring invalid update interval {}", name, secs),
        },
    }
}

/// Applies `initial` to `collector` and spawns its dispatcher.
///
/// The dispatcher holds only a weak reference and ends when the collector is
/// dropped or the bus is closed.
pub fn attach<C: Collector>(
    collector: &Arc<C>,
    kind: CollectorKind,
    initial: CollectorSettings,
    bus: &SettingsBus,
) -> JoinHandle<()> {
    // Subscribe before starting so no change published from here on is lost.
    let mut receiver = bus.subscribe();

    apply(collector, Setting::UpdateInterval(initial.update_interval));
    if initial.enabled {
        collector.start();
    } else {
        info!("{} collector disabled", kind);
    }

    let weak = Arc::downgrade(collector);
    tokio::spawn(async move {
        loop {
            let change = match receiver.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("{} dispatcher lagged, {} setting changes lost", kind, skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if change.collector != kind {
                continue;
            }
            let Some(collector) = weak.upgrade() else {
                break;
            };
            apply(&collector, change.setting);
        }
        debug!("{} dispatcher finished", kind);
    })
}
