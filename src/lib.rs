//! Shared Resource Operator Library
//!
//! Keeps the shared resource CSI driver installed and converged: its CRDs and
//! default configuration, the admission webhook Deployment, the static driver
//! manifests, and the metrics counting shared Secrets and ConfigMaps.
//!
//! ## Quick Start
//!
//! ```rust
//! use shared_resource_operator::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod assets;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod server;
