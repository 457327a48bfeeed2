//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Namespace the driver, its webhook and the operator itself run in
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "openshift-cluster-csi-drivers";

/// Name used for logging, the field manager and event attribution
pub const OPERATOR_NAME: &str = "csi-driver-shared-resource-operator";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "shared-resource-operator";

/// Name of the ClusterCSIDriver instance carrying the operator spec
pub const OPERATOR_CR_NAME: &str = "csi.sharedresource.openshift.io";

/// Name of the cluster-scoped Infrastructure singleton
pub const INFRASTRUCTURE_NAME: &str = "cluster";

/// Webhook Deployment managed by the deployment reconciler
pub const WEBHOOK_DEPLOYMENT_NAME: &str = "shared-resource-csi-driver-webhook";

/// Serving certificate Secret mounted by the webhook; a content change rolls the pods
pub const WEBHOOK_SECRET_NAME: &str = "shared-resource-csi-driver-webhook-serving-cert";

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 6000;

/// Default serving certificate for the metrics endpoint
pub const DEFAULT_METRICS_TLS_CERT_PATH: &str = "/var/run/secrets/serving-cert/tls.crt";

/// Default serving key for the metrics endpoint
pub const DEFAULT_METRICS_TLS_KEY_PATH: &str = "/var/run/secrets/serving-cert/tls.key";

/// Default grace period given to in-flight scrapes on shutdown (seconds)
pub const DEFAULT_METRICS_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Default interval between ensure passes (seconds)
pub const DEFAULT_ENSURE_INTERVAL_SECS: u64 = 60;

/// Default resync interval for static resources and the node DaemonSet (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 20 * 60;

/// Default requeue interval for deployment reconcile errors (seconds)
pub const DEFAULT_RECONCILE_ERROR_REQUEUE_SECS: u64 = 30;

/// Below this many eligible nodes the webhook runs a single replica
pub const DEFAULT_REPLICA_NODE_THRESHOLD: usize = 2;

/// Replica count used once the node threshold is reached
pub const DEFAULT_HIGH_AVAILABILITY_REPLICAS: i32 = 2;

/// Default log level when neither `RUST_LOG` nor `LOG_LEVEL` is set
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Image placeholders substituted into embedded manifests
pub const WEBHOOK_IMAGE_PLACEHOLDER: &str = "${WEBHOOK_IMAGE}";
pub const DRIVER_IMAGE_PLACEHOLDER: &str = "${DRIVER_IMAGE}";
pub const NODE_DRIVER_REGISTRAR_IMAGE_PLACEHOLDER: &str = "${NODE_DRIVER_REGISTRAR_IMAGE}";

/// Operand `--v` placeholder filled from the operator object's `logLevel`
pub const LOG_LEVEL_PLACEHOLDER: &str = "${LOG_LEVEL}";

/// How often the operator's own log level is re-read from the operator object (seconds)
pub const LOG_LEVEL_SYNC_INTERVAL_SECS: u64 = 10;

/// Pod template annotation prefix written by the secret-hash hook
pub const SECRET_HASH_ANNOTATION_PREFIX: &str = "operator.openshift.io/secret-hash";

/// Annotation recording the hash of the last applied Deployment spec
pub const SPEC_HASH_ANNOTATION: &str = "operator.openshift.io/spec-hash";
