//! Network collector: receive/transmit throughput from /proc/net/dev.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::collector::{Collector, CollectorOptions};
use crate::delta::{Counters, KeyedRateSeries};
use crate::error::CollectResult;
use crate::monitor::Monitor;
use crate::procfs::{self, NetDevStat, SourcePaths};
use crate::task::{CancellableTaskManager, TaskContext};

pub const NETWORK_IO: &str = "networkIO";
pub const NETWORK_INTERFACES_IO: &str = "networkInterfacesIO";

const METRIC_KEYS: &[&str] = &[NETWORK_IO, NETWORK_INTERFACES_IO];

const LOOPBACK: &str = "lo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Traffic {
    rx: u64,
    tx: u64,
}

impl Counters for Traffic {
    fn delta(&self, previous: &Self) -> Option<Self> {
        Some(Traffic {
            rx: self.rx.checked_sub(previous.rx)?,
            tx: self.tx.checked_sub(previous.tx)?,
        })
    }

    fn total(&self) -> u64 {
        self.rx + self.tx
    }
}

/// Bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrafficRate {
    pub rx: f64,
    pub tx: f64,
}

impl TrafficRate {
    fn from_delta(delta: Traffic, elapsed: f64) -> Self {
        TrafficRate {
            rx: delta.rx as f64 / elapsed,
            tx: delta.tx as f64 / elapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceIo {
    pub name: String,
    #[serde(flatten)]
    pub rate: TrafficRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkValue {
    Io(TrafficRate),
    InterfacesIo(Vec<InterfaceIo>),
}

#[derive(Default)]
struct SamplingState {
    interfaces: KeyedRateSeries<String, Traffic>,
}

pub struct NetworkCollector {
    monitor: Monitor<NetworkValue>,
    paths: SourcePaths,
    io_task: CancellableTaskManager,
    state: Mutex<SamplingState>,
}

impl NetworkCollector {
    pub fn new(options: CollectorOptions) -> Arc<Self> {
        Arc::new(Self {
            monitor: Monitor::new("network", options.update_interval, options.history_window),
            paths: options.paths,
            io_task: CancellableTaskManager::new("network.io"),
            state: Mutex::new(SamplingState::default()),
        })
    }

    fn refresh_io(self: &Arc<Self>) {
        self.spawn_refresh(
            &self.io_task,
            METRIC_KEYS,
            |this, ctx| async move { this.sample_io(ctx).await },
        );
    }

    async fn sample_io(&self, ctx: TaskContext) -> CollectResult<()> {
        let stats = procfs::read_net_dev(&self.paths.proc_root).await?;
        let now = Instant::now();
        let updated = ctx.commit(|| self.apply_net_dev(stats, now))?;
        for key in updated {
            self.monitor.notify(key);
        }
        Ok(())
    }

    fn apply_net_dev(&self, stats: Vec<NetDevStat>, now: Instant) -> Vec<&'static str> {
        let interfaces: Vec<NetDevStat> = stats.into_iter().filter(|s| s.name != LOOPBACK).collect();
        let mut state = self.state.lock();
        let mut updated = Vec::new();

        let mut rates = Vec::with_capacity(interfaces.len());
        for iface in &interfaces {
            let current = Traffic {
                rx: iface.rx_bytes,
                tx: iface.tx_bytes,
            };
            if let Some((delta, elapsed)) = state
                .interfaces
                .entry(iface.name.clone())
                .sample_at(current, now)
            {
                rates.push(InterfaceIo {
                    name: iface.name.clone(),
                    rate: TrafficRate::from_delta(delta, elapsed),
                });
            }
        }
        let names: Vec<String> = interfaces.into_iter().map(|s| s.name).collect();
        state.interfaces.retain_seen(&names);

        // Only interfaces with a delta this round count, so one that just
        // appeared does not add its lifetime bytes to the total.
        if !rates.is_empty() {
            let total = rates.iter().fold(TrafficRate { rx: 0.0, tx: 0.0 }, |acc, i| TrafficRate {
                rx: acc.rx + i.rate.rx,
                tx: acc.tx + i.rate.tx,
            });
            self.monitor.commit(NETWORK_IO, NetworkValue::Io(total));
            updated.push(NETWORK_IO);
            self.monitor
                .commit(NETWORK_INTERFACES_IO, NetworkValue::InterfacesIo(rates));
            updated.push(NETWORK_INTERFACES_IO);
        }
        updated
    }
}

impl Collector for NetworkCollector {
    type Value = NetworkValue;

    fn monitor(&self) -> &Monitor<NetworkValue> {
        &self.monitor
    }

    fn metric_keys(&self) -> &'static [&'static str] {
        METRIC_KEYS
    }

    fn update(self: &Arc<Self>) {
        if METRIC_KEYS.iter().any(|key| self.monitor.is_listening_for(key)) {
            self.refresh_io();
        }
    }

    fn request_update(self: &Arc<Self>, key: &str, forced: bool) {
        if !METRIC_KEYS.iter().any(|k| *k == key) {
            debug!("network: update requested for unknown metric {}", key);
            return;
        }
        if forced || !self.io_task.is_running() {
            self.refresh_io();
        }
    }

    fn reset(&self) {
        self.io_task.cancel();
        let mut state = self.state.lock();
        state.interfaces.reset();
    }
}
