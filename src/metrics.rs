//! Prometheus gauges mirroring the current collector values.
//!
//! Gauges are rebuilt from `Monitor::current_value` on every scrape, so a
//! metric that has no value yet (warm-up, stopped collector) is absent.

use herakles_res_monitor::collector::Collector;
use herakles_res_monitor::collectors::{
    memory, network, processor, sensors, storage, Collectors, MemoryValue, NetworkValue,
    ProcessorValue, SensorsValue, StorageValue,
};
use herakles_res_monitor::process::TopProcess;
use herakles_res_monitor::CollectorKind;
use prometheus::{GaugeVec, Opts, Registry};

#[derive(Clone)]
pub struct ResourceMetrics {
    pub cpu_usage: GaugeVec,
    pub cpu_core_usage: GaugeVec,
    pub cpu_core_frequency: GaugeVec,
    pub load_average: GaugeVec,
    pub memory: GaugeVec,
    pub storage_io: GaugeVec,
    pub storage_usage: GaugeVec,
    pub network_io: GaugeVec,
    pub temperature: GaugeVec,
    pub top_cpu_percent: GaugeVec,
    pub top_resident_bytes: GaugeVec,
    pub collector_running: GaugeVec,
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> anyhow::Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl ResourceMetrics {
    /// Creates and registers all gauges with the registry.
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        Ok(Self {
            cpu_usage: gauge(
                registry,
                "herakles_res_cpu_usage_percent",
                "CPU time share over the last interval",
                &["mode"],
            )?,
            cpu_core_usage: gauge(
                registry,
                "herakles_res_cpu_core_usage_percent",
                "Busy share per logical core over the last interval",
                &["core"],
            )?,
            cpu_core_frequency: gauge(
                registry,
                "herakles_res_cpu_core_frequency_mhz",
                "Current frequency per logical core",
                &["core"],
            )?,
            load_average: gauge(
                registry,
                "herakles_res_load_average",
                "System load average",
                &["window"],
            )?,
            memory: gauge(
                registry,
                "herakles_res_memory_bytes",
                "Memory and swap usage in bytes",
                &["pool", "kind"],
            )?,
            storage_io: gauge(
                registry,
                "herakles_res_storage_io_bytes_per_second",
                "Disk throughput; device=\"all\" is the sum over whole disks",
                &["device", "direction"],
            )?,
            storage_usage: gauge(
                registry,
                "herakles_res_storage_usage_bytes",
                "Capacity of the monitored filesystem",
                &["kind"],
            )?,
            network_io: gauge(
                registry,
                "herakles_res_network_io_bytes_per_second",
                "Network throughput; interface=\"all\" is the sum without loopback",
                &["interface", "direction"],
            )?,
            temperature: gauge(
                registry,
                "herakles_res_temperature_celsius",
                "Temperature sensor readings",
                &["chip", "label"],
            )?,
            top_cpu_percent: gauge(
                registry,
                "herakles_res_top_process_cpu_percent",
                "Top processes by share of total CPU time",
                &["rank", "pid", "name"],
            )?,
            top_resident_bytes: gauge(
                registry,
                "herakles_res_top_process_resident_bytes",
                "Top processes by resident set size",
                &["rank", "pid", "name"],
            )?,
            collector_running: gauge(
                registry,
                "herakles_res_collector_running",
                "Whether a collector is running (1) or stopped (0)",
                &["collector"],
            )?,
        })
    }

    /// Resets all gauges (used before updating with fresh data).
    pub fn reset(&self) {
        self.cpu_usage.reset();
        self.cpu_core_usage.reset();
        self.cpu_core_frequency.reset();
        self.load_average.reset();
        self.memory.reset();
        self.storage_io.reset();
        self.storage_usage.reset();
        self.network_io.reset();
        self.temperature.reset();
        self.top_cpu_percent.reset();
        self.top_resident_bytes.reset();
        self.collector_running.reset();
    }

    /// Rebuilds every gauge from the collectors' current values.
    pub fn refresh(&self, collectors: &Collectors) {
        self.reset();

        for kind in CollectorKind::ALL {
            let running = if collectors.is_running(kind) { 1.0 } else { 0.0 };
            self.collector_running
                .with_label_values(&[kind.as_str()])
                .set(running);
        }

        self.refresh_processor(collectors);
        self.refresh_memory(collectors);
        self.refresh_storage(collectors);
        self.refresh_network(collectors);
        self.refresh_sensors(collectors);
    }

    fn refresh_processor(&self, collectors: &Collectors) {
        let monitor = collectors.processor.monitor();

        if let Some(ProcessorValue::Usage(usage)) = monitor.current_value(processor::CPU_USAGE) {
            for (mode, value) in [
                ("total", usage.total),
                ("user", usage.user),
                ("system", usage.system),
                ("idle", usage.idle),
            ] {
                self.cpu_usage.with_label_values(&[mode]).set(value);
            }
        }
        if let Some(ProcessorValue::CoresUsage(cores)) =
            monitor.current_value(processor::CPU_CORES_USAGE)
        {
            for (core, value) in cores.iter().enumerate() {
                self.cpu_core_usage
                    .with_label_values(&[&core.to_string()])
                    .set(*value);
            }
        }
        if let Some(ProcessorValue::CoresFrequency(freqs)) =
            monitor.current_value(processor::CPU_CORES_FREQUENCY)
        {
            for (core, value) in freqs.iter().enumerate() {
                self.cpu_core_frequency
                    .with_label_values(&[&core.to_string()])
                    .set(*value);
            }
        }
        if let Some(ProcessorValue::LoadAverage(load)) =
            monitor.current_value(processor::CPU_LOAD_AVERAGE)
        {
            self.load_average.with_label_values(&["1m"]).set(load.one_min);
            self.load_average.with_label_values(&["5m"]).set(load.five_min);
            self.load_average
                .with_label_values(&["15m"])
                .set(load.fifteen_min);
        }
        if let Some(ProcessorValue::TopProcesses(top)) =
            monitor.current_value(processor::TOP_PROCESSES)
        {
            set_top(&self.top_cpu_percent, &top);
        }
    }

    fn refresh_memory(&self, collectors: &Collectors) {
        let monitor = collectors.memory.monitor();
        for key in [memory::MEMORY_USAGE, memory::SWAP_USAGE] {
            let (pool, usage) = match monitor.current_value(key) {
                Some(MemoryValue::Memory(usage)) => ("memory", usage),
                Some(MemoryValue::Swap(usage)) => ("swap", usage),
                _ => continue,
            };
            for (kind, value) in [
                ("total", usage.total),
                ("used", usage.used),
                ("available", usage.available),
            ] {
                self.memory
                    .with_label_values(&[pool, kind])
                    .set(value as f64);
            }
        }
        if let Some(MemoryValue::TopProcesses(top)) = monitor.current_value(memory::TOP_PROCESSES)
        {
            set_top(&self.top_resident_bytes, &top);
        }
    }

    fn refresh_storage(&self, collectors: &Collectors) {
        let monitor = collectors.storage.monitor();
        if let Some(StorageValue::Io(rate)) = monitor.current_value(storage::STORAGE_IO) {
            self.storage_io
                .with_label_values(&["all", "read"])
                .set(rate.read);
            self.storage_io
                .with_label_values(&["all", "write"])
                .set(rate.write);
        }
        if let Some(StorageValue::DevicesIo(devices)) =
            monitor.current_value(storage::STORAGE_DEVICES_IO)
        {
            for device in devices {
                self.storage_io
                    .with_label_values(&[device.name.as_str(), "read"])
                    .set(device.rate.read);
                self.storage_io
                    .with_label_values(&[device.name.as_str(), "write"])
                    .set(device.rate.write);
            }
        }
        if let Some(StorageValue::Usage(usage)) = monitor.current_value(storage::STORAGE_USAGE) {
            for (kind, value) in [
                ("total", usage.total),
                ("used", usage.used),
                ("available", usage.available),
            ] {
                self.storage_usage
                    .with_label_values(&[kind])
                    .set(value as f64);
            }
        }
    }

    fn refresh_network(&self, collectors: &Collectors) {
        let monitor = collectors.network.monitor();
        if let Some(NetworkValue::Io(rate)) = monitor.current_value(network::NETWORK_IO) {
            self.network_io.with_label_values(&["all", "rx"]).set(rate.rx);
            self.network_io.with_label_values(&["all", "tx"]).set(rate.tx);
        }
        if let Some(NetworkValue::InterfacesIo(ifaces)) =
            monitor.current_value(network::NETWORK_INTERFACES_IO)
        {
            for iface in ifaces {
                self.network_io
                    .with_label_values(&[iface.name.as_str(), "rx"])
                    .set(iface.rate.rx);
                self.network_io
                    .with_label_values(&[iface.name.as_str(), "tx"])
                    .set(iface.rate.tx);
            }
        }
    }

    fn refresh_sensors(&self, collectors: &Collectors) {
        if let Some(SensorsValue::Temperatures(temps)) = collectors
            .sensors
            .monitor()
            .current_value(sensors::SENSORS_TEMPERATURES)
        {
            for t in temps {
                self.temperature
                    .with_label_values(&[t.chip.as_str(), t.label.as_str()])
                    .set(t.celsius);
            }
        }
    }
}

fn set_top(gauge: &GaugeVec, top: &[TopProcess]) {
    for (rank, p) in top.iter().enumerate() {
        let rank = (rank + 1).to_string();
        let pid = p.pid.to_string();
        gauge
            .with_label_values(&[rank.as_str(), pid.as_str(), p.name.as_str()])
            .set(p.value);
    }
}
