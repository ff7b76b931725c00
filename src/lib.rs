//! Data-acquisition core of a resource monitor.
//!
//! Per-resource collectors (processor, memory, storage, network, sensors)
//! sample kernel counters on a timer, turn cumulative counters into rates and
//! percentages, keep a bounded history and notify listeners on demand.
//!
//! ```no_run
//! use herakles_res_monitor::collector::{Collector, CollectorOptions};
//! use herakles_res_monitor::collectors::{processor, ProcessorCollector};
//! use herakles_res_monitor::monitor::SubscriberId;
//!
//! # async fn demo() {
//! let cpu = ProcessorCollector::new(CollectorOptions::default());
//! let reader = std::sync::Arc::downgrade(&cpu);
//! cpu.monitor().listen(SubscriberId::next(), processor::CPU_USAGE, move |key| {
//!     if let Some(cpu) = reader.upgrade() {
//!         println!("{:?}", cpu.monitor().current_value(key));
//!     }
//! });
//! cpu.start();
//! # }
//! ```

pub mod cache;
pub mod collector;
pub mod collectors;
pub mod config;
pub mod delta;
pub mod error;
pub mod monitor;
pub mod process;
pub mod procfs;
pub mod settings;
pub mod task;

pub use cache::{CachedProcess, TopProcessesCache};
pub use collector::{Collector, CollectorOptions};
pub use collectors::Collectors;
pub use config::Config;
pub use error::{CollectError, CollectResult};
pub use monitor::{HistorySample, MetricStatus, Monitor, SubscriberId};
pub use settings::{CollectorKind, Setting, SettingChange, SettingsBus};
pub use task::{CancellableTaskManager, RunHandle, TaskContext};
