//! # Operator Configuration
//!
//! Operator-level settings loaded from environment variables.

use crate::constants::*;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Operator-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Image references are injected by the release payload into the operator Deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace holding the webhook, the node DaemonSet and the default ConfigMap
    pub namespace: String,
    /// Port of the metrics and health endpoint
    pub metrics_port: u16,
    /// Serving certificate for the metrics endpoint
    pub metrics_tls_cert_path: PathBuf,
    /// Serving key for the metrics endpoint
    pub metrics_tls_key_path: PathBuf,
    /// Serve plain HTTP instead of TLS
    pub metrics_insecure: bool,
    /// How long in-flight scrapes may run after shutdown starts (seconds)
    pub metrics_shutdown_grace_secs: u64,
    /// Interval between ensure passes (seconds)
    pub ensure_interval_secs: u64,
    /// Static resource and node DaemonSet resync interval (seconds)
    pub resync_interval_secs: u64,
    /// Requeue delay after a failed deployment reconcile (seconds)
    pub reconcile_error_requeue_secs: u64,
    /// Minimum number of eligible nodes before the webhook is scaled up
    pub replica_node_threshold: usize,
    /// Webhook replicas once the threshold is reached
    pub high_availability_replicas: i32,
    /// Webhook image substituted for `${WEBHOOK_IMAGE}`
    pub webhook_image: String,
    /// Driver image substituted for `${DRIVER_IMAGE}`
    pub driver_image: String,
    /// Registrar sidecar image substituted for `${NODE_DRIVER_REGISTRAR_IMAGE}`
    pub node_driver_registrar_image: String,
    /// Global log level, used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
            metrics_tls_cert_path: PathBuf::from(DEFAULT_METRICS_TLS_CERT_PATH),
            metrics_tls_key_path: PathBuf::from(DEFAULT_METRICS_TLS_KEY_PATH),
            metrics_insecure: false,
            metrics_shutdown_grace_secs: DEFAULT_METRICS_SHUTDOWN_GRACE_SECS,
            ensure_interval_secs: DEFAULT_ENSURE_INTERVAL_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            reconcile_error_requeue_secs: DEFAULT_RECONCILE_ERROR_REQUEUE_SECS,
            replica_node_threshold: DEFAULT_REPLICA_NODE_THRESHOLD,
            high_availability_replicas: DEFAULT_HIGH_AVAILABILITY_REPLICAS,
            webhook_image: String::new(),
            driver_image: String::new(),
            node_driver_registrar_image: String::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_source<F>(source: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = &source;
        Self {
            namespace: env_var_or_default_str(
                source,
                "OPERATOR_NAMESPACE",
                DEFAULT_OPERATOR_NAMESPACE,
            ),
            metrics_port: env_var_or_default(source, "METRICS_PORT", DEFAULT_METRICS_PORT),
            metrics_tls_cert_path: PathBuf::from(env_var_or_default_str(
                source,
                "METRICS_TLS_CERT_PATH",
                DEFAULT_METRICS_TLS_CERT_PATH,
            )),
            metrics_tls_key_path: PathBuf::from(env_var_or_default_str(
                source,
                "METRICS_TLS_KEY_PATH",
                DEFAULT_METRICS_TLS_KEY_PATH,
            )),
            metrics_insecure: env_var_or_default_bool(source, "METRICS_INSECURE", false),
            metrics_shutdown_grace_secs: env_var_or_default(
                source,
                "METRICS_SHUTDOWN_GRACE_SECS",
                DEFAULT_METRICS_SHUTDOWN_GRACE_SECS,
            ),
            ensure_interval_secs: env_var_or_default(
                source,
                "ENSURE_INTERVAL_SECS",
                DEFAULT_ENSURE_INTERVAL_SECS,
            ),
            resync_interval_secs: env_var_or_default(
                source,
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            ),
            reconcile_error_requeue_secs: env_var_or_default(
                source,
                "RECONCILE_ERROR_REQUEUE_SECS",
                DEFAULT_RECONCILE_ERROR_REQUEUE_SECS,
            ),
            replica_node_threshold: env_var_or_default(
                source,
                "REPLICA_NODE_THRESHOLD",
                DEFAULT_REPLICA_NODE_THRESHOLD,
            ),
            high_availability_replicas: env_var_or_default(
                source,
                "HIGH_AVAILABILITY_REPLICAS",
                DEFAULT_HIGH_AVAILABILITY_REPLICAS,
            ),
            webhook_image: env_var_or_default_str(source, "WEBHOOK_IMAGE", ""),
            driver_image: env_var_or_default_str(source, "DRIVER_IMAGE", ""),
            node_driver_registrar_image: env_var_or_default_str(
                source,
                "NODE_DRIVER_REGISTRAR_IMAGE",
                "",
            ),
            log_level: env_var_or_default_str(source, "LOG_LEVEL", DEFAULT_LOG_LEVEL),
        }
    }

    /// Address the metrics endpoint listens on
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.metrics_port))
    }

    /// Get metrics shutdown grace duration
    pub fn metrics_shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.metrics_shutdown_grace_secs)
    }

    /// Get ensure interval duration
    pub fn ensure_interval(&self) -> Duration {
        Duration::from_secs(self.ensure_interval_secs.max(1))
    }

    /// Get resync interval duration
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    /// Get reconcile error requeue duration
    pub fn reconcile_error_requeue(&self) -> Duration {
        Duration::from_secs(self.reconcile_error_requeue_secs)
    }
}

/// Read a key or return default value
fn env_var_or_default<F, T>(source: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    source(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a key as boolean or return default
fn env_var_or_default_bool<F>(source: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    source(key)
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read a key as string or return default
fn env_var_or_default_str<F>(source: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    source(key).unwrap_or_else(|| default.to_string())
}
