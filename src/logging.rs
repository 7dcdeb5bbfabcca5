//! Structured logging for QPU and executor processes.
//!
//! Every worker thread, registry operation, and classical-channel send/recv
//! logs through this module instead of calling `tracing` macros directly, so
//! log volume and the audit trail stay centrally configurable. The
//! underlying subscriber is `tracing-subscriber`, with an optional rolling
//! file appender (`tracing-appender`) for long-lived QPU processes; log
//! categories give operators one consistent field to filter the
//! registry/network/queue/kernel/system boundary this crate cares about.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// In-memory audit trail, kept for operators that poll rather than tail a
/// log file. Bounded so a long-lived QPU process doesn't grow it forever.
pub static AUDIT_TRAIL: Lazy<Arc<RwLock<Vec<AuditEntry>>>> =
    Lazy::new(|| Arc::new(RwLock::new(Vec::with_capacity(1024))));

const AUDIT_TRAIL_CAP: usize = 10_000;

/// Log categories used across the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    /// Registry writes/reads, lock acquisition.
    Registry,
    /// Client-socket and classical-channel traffic.
    Network,
    /// Message-queue push/pop, worker-thread lifecycle.
    Queue,
    /// Backend/kernel dispatch.
    Kernel,
    /// Process startup/shutdown/configuration.
    System,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogCategory::Registry => "registry",
            LogCategory::Network => "network",
            LogCategory::Queue => "queue",
            LogCategory::Kernel => "kernel",
            LogCategory::System => "system",
        };
        write!(f, "{s}")
    }
}

/// A single audit-trail entry. Only `Registry` and `Network` events are
/// audited — the ones an operator reconstructing "who talked to whom" cares
/// about — everything else only goes to the tracing subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub category: LogCategory,
    pub message: String,
}

/// Logging configuration for [`init`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub console_enabled: bool,
    pub file_enabled: bool,
    pub log_dir: String,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            log_dir: "./logs".to_string(),
            json_format: true,
        }
    }
}

/// Initialize the global tracing subscriber. Idempotent: a QPU process and
/// each of its worker threads may call this before doing any work, so only
/// the first call takes effect.
pub fn init(config: &LoggingConfig) {
    if TRACING_INITIALIZED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    if config.file_enabled {
        let _ = std::fs::create_dir_all(&config.log_dir);
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let mut layers = Vec::new();

    if config.console_enabled {
        let console_layer = fmt::layer().with_target(true).with_thread_ids(true);
        layers.push(if config.json_format {
            console_layer.json().boxed()
        } else {
            console_layer.boxed()
        });
    }

    if config.file_enabled {
        let appender = rolling::daily(&config.log_dir, "qpu_mesh.log");
        let (writer, guard) = non_blocking(appender);
        // The guard must outlive this function for the life of the process;
        // `init` only ever runs once, so leaking it is the whole point.
        std::mem::forget(guard);
        let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
        layers.push(if config.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        });
    }

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .is_err()
    {
        TRACING_INITIALIZED.store(false, Ordering::Relaxed);
    }
}

/// Record an informational event under `category`.
pub fn log_event(category: LogCategory, message: &str) {
    info!(category = %category, "{message}");
    record_audit(category, message);
}

/// Record a warning.
pub fn log_warn(category: LogCategory, message: &str) {
    warn!(category = %category, "{message}");
}

/// Record an error.
pub fn log_error(category: LogCategory, message: &str) {
    error!(category = %category, "{message}");
    record_audit(category, message);
}

/// Record a debug-level event — worker-thread suspension points, demux
/// buffering decisions — cheap to call unconditionally since `tracing`
/// filters at the subscriber, not the call site.
pub fn log_debug(category: LogCategory, message: &str) {
    debug!(category = %category, "{message}");
}

fn record_audit(category: LogCategory, message: &str) {
    if !matches!(category, LogCategory::Registry | LogCategory::Network) {
        return;
    }
    let mut trail = AUDIT_TRAIL.write();
    trail.push(AuditEntry {
        timestamp: chrono::Utc::now(),
        category,
        message: message.to_string(),
    });
    if trail.len() > AUDIT_TRAIL_CAP {
        let excess = trail.len() - AUDIT_TRAIL_CAP;
        trail.drain(0..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_trail_records_registry_events() {
        let before = AUDIT_TRAIL.read().len();
        log_event(LogCategory::Registry, "test write");
        let after = AUDIT_TRAIL.read().len();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn audit_trail_ignores_non_audited_categories() {
        let before = AUDIT_TRAIL.read().len();
        log_event(LogCategory::Kernel, "kernel ran");
        let after = AUDIT_TRAIL.read().len();
        assert_eq!(after, before);
    }
}
