//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use shared_resource_operator::prelude::*;
//! ```

// CRD types - most commonly used
pub use crate::crd::*;

// Manifest hooks - for composing rendering pipelines
pub use crate::controller::hooks::{
    ControlPlaneTopologyHook, HookError, LogLevelHook, ManifestHook, ManifestPipeline,
    NamespaceHook, RenderError, ReplaceHook, ReplicaCountHook, ReplicaPolicy, SecretHashHook,
    SecretHashState,
};

// Reconciler types - core controller functionality
pub use crate::controller::apply::{ApplyOutcome, DeploymentApplier};
pub use crate::controller::deployment::{reconcile, DeploymentReconciler, ReconcileError};

// Ensure loops
pub use crate::runtime::ensure_loop::{
    run_ensure_pass, spawn_ensure_loop, CreateOutcome, EnsureError, EnsureLoopHandle,
    EnsureOutcome, EnsureTask,
};

// Config types - for configuration management
pub use crate::config::OperatorConfig;

// Metrics and logging
pub use crate::observability::logging::LogLevelHandle;
pub use crate::observability::{ListerError, OperatorMetrics, ShareCollector, ShareLister};

// Orchestration
pub use crate::runtime::{run_operator, ExitReason};
pub use crate::server::{MetricsServer, ServerError, ServerState, TlsPaths};
