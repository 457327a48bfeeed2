//! # Logging
//!
//! Tracing subscriber setup. `RUST_LOG` wins when present, otherwise the
//! operator crate logs at `LOG_LEVEL` and dependencies at `warn`.
//!
//! The filter sits behind a reload layer so the operator object's
//! `operatorLogLevel` can change verbosity at runtime. A `RUST_LOG` filter is
//! never replaced.

use crate::constants::OPERATOR_CR_NAME;
use crate::crd::{ClusterCSIDriver, LogLevel};
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Build the filter used when `RUST_LOG` is not set
pub fn default_filter(log_level: &str) -> String {
    let level = match log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    format!("shared_resource_operator={level},warn")
}

/// Filter for an `operatorLogLevel`; `Normal` falls back to `LOG_LEVEL`
pub fn operator_filter(level: LogLevel, log_level: &str) -> String {
    match level {
        LogLevel::Normal => default_filter(log_level),
        LogLevel::Debug => default_filter("debug"),
        LogLevel::Trace => default_filter("trace"),
        LogLevel::TraceAll => "trace".to_string(),
    }
}

/// Runtime control over the installed filter
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    log_level: String,
    /// `RUST_LOG` was set and owns the filter
    pinned: bool,
    current: Mutex<LogLevel>,
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle")
            .field("log_level", &self.log_level)
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

impl LogLevelHandle {
    fn new(handle: reload::Handle<EnvFilter, Registry>, log_level: &str, pinned: bool) -> Self {
        Self {
            handle,
            log_level: log_level.to_string(),
            pinned,
            current: Mutex::new(LogLevel::Normal),
        }
    }

    /// Switch the operator's verbosity; returns whether the filter changed
    pub fn set(&self, level: LogLevel) -> Result<bool, reload::Error> {
        if self.pinned {
            return Ok(false);
        }
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *current == level {
            return Ok(false);
        }
        self.handle
            .reload(EnvFilter::new(operator_filter(level, &self.log_level)))?;
        *current = level;
        Ok(true)
    }

    /// Apply the cached operator object's `operatorLogLevel`
    ///
    /// A missing object or field means `Normal`.
    pub fn sync_from(&self, operators: &Store<ClusterCSIDriver>) {
        let level = operators
            .get(&ObjectRef::new(OPERATOR_CR_NAME))
            .and_then(|operator| operator.spec.operator_log_level)
            .unwrap_or_default();
        match self.set(level) {
            Ok(true) => info!(level = level.as_str(), "Operator log level changed"),
            Ok(false) => {}
            Err(e) => warn!("Failed to change operator log level: {}", e),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(log_level: &str) -> LogLevelHandle {
    let (filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(default_filter(log_level)), false),
    };
    let (filter, handle) = reload::Layer::new(filter);
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
    {
        warn!("Tracing subscriber already initialized: {}", e);
    }
    info!(
        "Build info: timestamp={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_GIT_HASH")
    );
    LogLevelHandle::new(handle, log_level, pinned)
}
