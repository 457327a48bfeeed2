//! # Custom Resource Definitions
//!
//! Typed views of the cluster objects the operator reads or counts.
//!
//! ## Module Structure
//!
//! - `share.rs` - SharedSecret and SharedConfigMap, counted by the metrics collector
//! - `operator.rs` - ClusterCSIDriver, the operator's own spec and management state
//! - `infrastructure.rs` - the cluster Infrastructure singleton (control plane topology)

mod infrastructure;
mod operator;
mod share;

// Re-export all public types
pub use infrastructure::{Infrastructure, InfrastructureSpec, InfrastructureStatus, TopologyMode};
pub use operator::{
    ClusterCSIDriver, ClusterCSIDriverSpec, ClusterCSIDriverStatus, LogLevel, ManagementState,
    OperatorSpec,
};
pub use share::{
    ShareReference, ShareStatus, SharedConfigMap, SharedConfigMapSpec, SharedSecret,
    SharedSecretSpec,
};
