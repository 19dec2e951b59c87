//! Process-wide counters and gauges behind atomics, sampled once a second by the monitor task
//! and on demand by the console (§4.13). Deliberately no locking of its own: every counter it
//! exposes is backed by the same atomics the pools and dispatcher already maintain internally,
//! registered here under a name so `snapshot()` can report them together.
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A single named counter or gauge. Counters only increase (`add`); gauges are overwritten
/// (`set`); both are plain `AtomicI64`s under the hood, so the distinction is purely in how the
/// handle is used.
#[derive(Clone)]
pub struct Metric(Arc<AtomicI64>);

impl Metric {
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, n: i64) {
        self.0.store(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A point-in-time read of every registered metric, keyed by name in sorted order for stable
/// console/log output.
pub type MetricsSnapshot = BTreeMap<String, i64>;

/// Process-wide metrics registry (§6 `Metrics` contract). Constructed once at startup and shared
/// via `Arc`, handed down to every subsystem constructor the way the logger is.
#[derive(Clone)]
pub struct Metrics {
    values: Arc<RwLock<BTreeMap<String, Metric>>>,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics {
            values: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Returns the named counter/gauge handle, creating it at zero on first use.
    pub fn counter(&self, name: &str) -> Metric {
        self.get_or_create(name)
    }

    pub fn gauge(&self, name: &str) -> Metric {
        self.get_or_create(name)
    }

    fn get_or_create(&self, name: &str) -> Metric {
        if let Some(metric) = self.values.read().get(name) {
            return metric.clone();
        }
        let mut values = self.values.write();
        values
            .entry(name.to_string())
            .or_insert_with(|| Metric(Arc::new(AtomicI64::new(0))))
            .clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.values
            .read()
            .iter()
            .map(|(name, metric)| (name.clone(), metric.get()))
            .collect()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

/// Spawns the once-a-second monitor thread that logs [`Metrics::snapshot`]. Returns a stop
/// switch; dropping it does not stop the thread — call `stop()` explicitly during shutdown.
pub fn spawn_monitor(metrics: Metrics, log: flux::logging::Logger) -> MonitorHandle {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let handle = std::thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || {
            while !worker_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_secs(1));
                let snapshot = metrics.snapshot();
                flux::logging::info!(log, "metrics snapshot"; "metrics" => ?snapshot);
            }
        })
        .expect("failed to spawn monitor thread");

    MonitorHandle {
        stop,
        handle: Some(handle),
    }
}

pub struct MonitorHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.counter("pool.allocations").add(1);
        metrics.counter("pool.allocations").add(1);
        metrics.gauge("dispatcher.queue_len").set(42);
        metrics.gauge("dispatcher.queue_len").set(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["pool.allocations"], 2);
        assert_eq!(snapshot["dispatcher.queue_len"], 7);
    }

    #[test]
    fn repeated_lookups_share_the_same_underlying_atomic() {
        let metrics = Metrics::new();
        let a = metrics.counter("sessions.live");
        a.add(5);
        let b = metrics.counter("sessions.live");
        assert_eq!(b.get(), 5);
    }
}
