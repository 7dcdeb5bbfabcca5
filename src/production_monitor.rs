//! Runtime health sampling for a QPU or executor process.
//!
//! Tracks task latency/throughput and registry/channel error counts so an
//! operator polling a process (or scraping its Prometheus exporter) can see
//! whether it's keeping up, without that sampling touching the worker-thread
//! message loop itself — this is a background `tokio` task, not part of the
//! `std::thread` QPU concurrency contract.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::logging::{log_event, LogCategory};

const SAMPLE_WINDOW: usize = 10_000;
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// A point-in-time performance snapshot, returned by [`ProductionMonitor::get_report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub tasks_per_second: f64,
    pub success_rate_percent: f64,
    pub total_tasks: u64,
    pub registry_errors: u64,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: f64,
}

/// Collects task latency, success/failure counts, and system resource usage
/// for one process.
pub struct ProductionMonitor {
    latencies: Arc<RwLock<VecDeque<Duration>>>,
    success_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    registry_error_count: Arc<AtomicU64>,
    task_timestamps: Arc<RwLock<VecDeque<Instant>>>,
    cpu_usage: Arc<RwLock<f64>>,
    memory_usage: Arc<RwLock<u64>>,
}

impl ProductionMonitor {
    /// Build a monitor and start its background system-resource sampling
    /// task. Requires a `tokio` runtime to already be running.
    pub fn new() -> Self {
        let monitor = Self {
            latencies: Arc::new(RwLock::new(VecDeque::with_capacity(SAMPLE_WINDOW))),
            success_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            registry_error_count: Arc::new(AtomicU64::new(0)),
            task_timestamps: Arc::new(RwLock::new(VecDeque::with_capacity(SAMPLE_WINDOW))),
            cpu_usage: Arc::new(RwLock::new(0.0)),
            memory_usage: Arc::new(RwLock::new(0)),
        };
        monitor.start_system_monitoring();
        monitor
    }

    /// Record the outcome of one `QuantumTask` execution.
    pub fn record_task(&self, latency: Duration, success: bool) {
        let mut latencies = self.latencies.write();
        latencies.push_back(latency);
        if latencies.len() > SAMPLE_WINDOW {
            latencies.pop_front();
        }
        drop(latencies);

        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut timestamps = self.task_timestamps.write();
        timestamps.push_back(Instant::now());
        if timestamps.len() > SAMPLE_WINDOW {
            timestamps.pop_front();
        }
    }

    /// Record a registry read/write failure, surfaced separately from task
    /// outcomes since a registry error doesn't necessarily fail a task.
    pub fn record_registry_error(&self) {
        self.registry_error_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("registry_errors_total").increment(1);
    }

    fn start_system_monitoring(&self) {
        let cpu_usage = self.cpu_usage.clone();
        let memory_usage = self.memory_usage.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                interval.tick().await;
                *cpu_usage.write() = Self::sample_cpu_usage();
                *memory_usage.write() = Self::sample_memory_usage();
            }
        });
    }

    fn sample_cpu_usage() -> f64 {
        use std::sync::OnceLock;
        static SYSTEM: OnceLock<std::sync::Mutex<sysinfo::System>> = OnceLock::new();
        let system = SYSTEM.get_or_init(|| {
            let mut sys = sysinfo::System::new_all();
            sys.refresh_cpu();
            std::sync::Mutex::new(sys)
        });
        if let Ok(mut sys) = system.lock() {
            sys.refresh_cpu();
            sys.global_cpu_info().cpu_usage() as f64
        } else {
            0.0
        }
    }

    fn sample_memory_usage() -> u64 {
        use std::sync::OnceLock;
        static SYSTEM: OnceLock<std::sync::Mutex<sysinfo::System>> = OnceLock::new();
        let system = SYSTEM.get_or_init(|| {
            let mut sys = sysinfo::System::new_all();
            sys.refresh_memory();
            std::sync::Mutex::new(sys)
        });
        if let Ok(mut sys) = system.lock() {
            sys.refresh_memory();
            sys.used_memory()
        } else {
            0
        }
    }

    /// Compute a point-in-time report from the samples collected so far.
    pub fn get_report(&self) -> PerformanceReport {
        let latencies = self.latencies.read();
        let timestamps = self.task_timestamps.read();

        let avg_latency = if latencies.is_empty() {
            Duration::ZERO
        } else {
            latencies.iter().sum::<Duration>() / latencies.len() as u32
        };

        let p95_latency = if latencies.is_empty() {
            Duration::ZERO
        } else {
            let mut sorted: Vec<_> = latencies.iter().cloned().collect();
            sorted.sort();
            let index = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
            sorted[index]
        };

        let tasks_per_second = if timestamps.len() < 2 {
            0.0
        } else {
            let span = timestamps
                .back()
                .unwrap()
                .duration_since(*timestamps.front().unwrap());
            if span.as_secs_f64() > 0.0 {
                timestamps.len() as f64 / span.as_secs_f64()
            } else {
                0.0
            }
        };

        let success = self.success_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let total = success + errors;
        let success_rate = if total > 0 {
            (success as f64 / total as f64) * 100.0
        } else {
            100.0
        };

        PerformanceReport {
            avg_latency_ms: avg_latency.as_secs_f64() * 1000.0,
            p95_latency_ms: p95_latency.as_secs_f64() * 1000.0,
            tasks_per_second,
            success_rate_percent: success_rate,
            total_tasks: total,
            registry_errors: self.registry_error_count.load(Ordering::Relaxed),
            cpu_usage_percent: *self.cpu_usage.read(),
            memory_usage_mb: *self.memory_usage.read() as f64 / 1024.0 / 1024.0,
        }
    }

    /// Log the current report under [`LogCategory::System`].
    pub fn log_report(&self) {
        let report = self.get_report();
        log_event(
            LogCategory::System,
            &format!(
                "tasks={} success_rate={:.1}% avg_latency={:.2}ms p95={:.2}ms registry_errors={}",
                report.total_tasks,
                report.success_rate_percent,
                report.avg_latency_ms,
                report.p95_latency_ms,
                report.registry_errors,
            ),
        );
    }
}

impl Default for ProductionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
