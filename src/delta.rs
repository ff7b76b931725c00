//! Delta-rate conversion of cumulative kernel counters.
//!
//! Kernel counters only ever grow. A rate needs two samples, so each series
//! keeps the previous one: the first sample after a start (or a reset) is a
//! warm-up and yields nothing. The current sample is always stored, even when
//! the delta is unusable, so a series recovers on the next tick after a
//! counter wrap.

use ahash::AHashMap as HashMap;
use serde::Serialize;
use std::hash::Hash;
use std::time::Instant;

use crate::procfs::CpuStat;

/// A fixed tuple of monotonically increasing counters.
pub trait Counters: Clone {
    /// Elementwise `self - previous`, or `None` if any counter went backwards.
    fn delta(&self, previous: &Self) -> Option<Self>;

    /// Sum of all categories, used as the percentage denominator.
    fn total(&self) -> u64;
}

/// One counter series whose deltas are turned into shares of the total.
#[derive(Debug, Clone)]
pub struct CounterSeries<C> {
    previous: Option<C>,
}

impl<C> Default for CounterSeries<C> {
    fn default() -> Self {
        Self { previous: None }
    }
}

impl<C: Counters> CounterSeries<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `current` and returns the delta against the previous sample.
    ///
    /// Returns `None` on warm-up, on a counter wrap and when the total delta
    /// is zero.
    pub fn sample(&mut self, current: C) -> Option<C> {
        let delta = self
            .previous
            .as_ref()
            .and_then(|previous| current.delta(previous))
            .filter(|delta| delta.total() > 0);
        self.previous = Some(current);
        delta
    }

    pub fn is_warm(&self) -> bool {
        self.previous.is_some()
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// A counter series divided by wall-clock time (bytes per second).
#[derive(Debug, Clone)]
pub struct RateSeries<C> {
    previous: Option<(C, Instant)>,
}

impl<C> Default for RateSeries<C> {
    fn default() -> Self {
        Self { previous: None }
    }
}

impl<C: Counters> RateSeries<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, current: C) -> Option<(C, f64)> {
        self.sample_at(current, Instant::now())
    }

    /// Returns the delta and the elapsed seconds since the previous sample.
    ///
    /// A zero delta is a valid rate here (no traffic); only a non-positive
    /// elapsed time or a counter wrap yields `None`.
    pub fn sample_at(&mut self, current: C, now: Instant) -> Option<(C, f64)> {
        let result = self.previous.as_ref().and_then(|(previous, at)| {
            let elapsed = now.saturating_duration_since(*at).as_secs_f64();
            if elapsed <= 0.0 {
                return None;
            }
            current.delta(previous).map(|delta| (delta, elapsed))
        });
        self.previous = Some((current, now));
        result
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Independent series per key (core id, device, interface, pid).
#[derive(Debug, Clone)]
pub struct Keyed<K, S> {
    series: HashMap<K, S>,
}

impl<K, S> Default for Keyed<K, S> {
    fn default() -> Self {
        Self {
            series: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, S: Default> Keyed<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, key: K) -> &mut S {
        self.series.entry(key).or_default()
    }

    /// Forgets keys that were not part of the latest sample.
    pub fn retain_seen(&mut self, seen: &[K]) {
        self.series.retain(|key, _| seen.contains(key));
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn reset(&mut self) {
        self.series.clear();
    }
}

pub type KeyedSeries<K, C> = Keyed<K, CounterSeries<C>>;
pub type KeyedRateSeries<K, C> = Keyed<K, RateSeries<C>>;

impl Counters for CpuStat {
    fn delta(&self, previous: &Self) -> Option<Self> {
        Some(CpuStat {
            user: self.user.checked_sub(previous.user)?,
            nice: self.nice.checked_sub(previous.nice)?,
            system: self.system.checked_sub(previous.system)?,
            idle: self.idle.checked_sub(previous.idle)?,
            iowait: self.iowait.checked_sub(previous.iowait)?,
            irq: self.irq.checked_sub(previous.irq)?,
            softirq: self.softirq.checked_sub(previous.softirq)?,
            steal: self.steal.checked_sub(previous.steal)?,
        })
    }

    fn total(&self) -> u64 {
        CpuStat::total(self)
    }
}

/// CPU time shares over one interval, in percent.
///
/// `user + system + idle` is 100; `total` is the busy share (`user + system`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuUsage {
    pub total: f64,
    pub user: f64,
    pub system: f64,
    pub idle: f64,
}

impl CpuUsage {
    /// Splits a tick delta into idle-like, user-like and system-like shares.
    pub fn from_delta(delta: &CpuStat) -> Option<Self> {
        let total = delta.total();
        if total == 0 {
            return None;
        }
        let total = total as f64;
        let user = (delta.user + delta.nice) as f64 / total * 100.0;
        let system = (delta.system + delta.irq + delta.softirq) as f64 / total * 100.0;
        let idle = (delta.idle + delta.iowait + delta.steal) as f64 / total * 100.0;

        Some(CpuUsage {
            total: user + system,
            user,
            system,
            idle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stat(user: u64, system: u64, idle: u64) -> CpuStat {
        CpuStat {
            user,
            nice: 0,
            system,
            idle,
            iowait: 0,
            irq: 0,
            softirq: 0,
            steal: 0,
        }
    }

    #[test]
    fn test_first_sample_is_warm_up() {
        let mut series = CounterSeries::new();
        assert!(series.sample(stat(100, 50, 1000)).is_none());
        assert!(series.is_warm());

        let delta = series.sample(stat(200, 50, 1900)).unwrap();
        let usage = CpuUsage::from_delta(&delta).unwrap();
        assert!((usage.total - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_delta_is_no_result() {
        let mut series = CounterSeries::new();
        series.sample(stat(100, 50, 1000));
        assert!(series.sample(stat(100, 50, 1000)).is_none());
        assert!(CpuUsage::from_delta(&stat(0, 0, 0)).is_none());
    }

    #[test]
    fn test_wrap_is_no_result_and_self_heals() {
        let mut series = CounterSeries::new();
        series.sample(stat(100, 50, 1000));
        assert!(series.sample(stat(10, 5, 100)).is_none());

        let delta = series.sample(stat(20, 15, 180)).unwrap();
        assert_eq!(delta.total(), 100);
    }

    #[test]
    fn test_group_shares_sum_to_hundred() {
        let snapshots = [
            (
                CpuStat {
                    user: 10,
                    nice: 3,
                    system: 7,
                    idle: 500,
                    iowait: 4,
                    irq: 1,
                    softirq: 2,
                    steal: 0,
                },
                CpuStat {
                    user: 91,
                    nice: 13,
                    system: 44,
                    idle: 777,
                    iowait: 9,
                    irq: 6,
                    softirq: 3,
                    steal: 5,
                },
            ),
            (stat(0, 0, 0), stat(1, 0, 0)),
            (stat(5, 5, 5), stat(5, 5, 6)),
            (stat(1 << 40, 1 << 30, 1 << 41), stat((1 << 40) + 3, (1 << 30) + 7, (1 << 41) + 11)),
        ];

        for (previous, current) in snapshots {
            let delta = current.delta(&previous).unwrap();
            let usage = CpuUsage::from_delta(&delta).unwrap();
            let sum = usage.user + usage.system + usage.idle;
            assert!((sum - 100.0).abs() < 1e-9, "sum was {}", sum);
            assert!(usage.total >= 0.0 && usage.total.is_finite());
        }
    }

    #[test]
    fn test_reset_returns_to_warm_up() {
        let mut series = CounterSeries::new();
        series.sample(stat(1, 1, 1));
        series.reset();
        assert!(series.sample(stat(50, 50, 50)).is_none());
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Bytes(u64);

    impl Counters for Bytes {
        fn delta(&self, previous: &Self) -> Option<Self> {
            self.0.checked_sub(previous.0).map(Bytes)
        }

        fn total(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_rate_series_divides_by_elapsed() {
        let mut series = RateSeries::new();
        let start = Instant::now();
        assert!(series.sample_at(Bytes(1_000), start).is_none());

        let (delta, elapsed) = series
            .sample_at(Bytes(4_000), start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(delta, Bytes(3_000));
        assert!((delta.0 as f64 / elapsed - 1_500.0).abs() < 1e-9);

        // Idle link: zero delta is still a rate.
        let (delta, _) = series
            .sample_at(Bytes(4_000), start + Duration::from_secs(3))
            .unwrap();
        assert_eq!(delta, Bytes(0));
    }

    #[test]
    fn test_rate_series_rejects_zero_elapsed() {
        let mut series = RateSeries::new();
        let now = Instant::now();
        series.sample_at(Bytes(1), now);
        assert!(series.sample_at(Bytes(2), now).is_none());
    }

    #[test]
    fn test_keyed_series_are_independent() {
        let mut cores: KeyedSeries<usize, CpuStat> = Keyed::new();
        assert!(cores.entry(0).sample(stat(0, 0, 0)).is_none());
        assert!(cores.entry(1).sample(stat(0, 0, 0)).is_none());
        assert!(cores.entry(0).sample(stat(10, 0, 10)).is_some());

        cores.retain_seen(&[0]);
        assert_eq!(cores.len(), 1);
        assert!(cores.entry(1).sample(stat(5, 5, 5)).is_none());
    }
}
