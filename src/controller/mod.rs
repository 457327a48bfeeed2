//! # Controller
//!
//! Reconciliation logic for the objects the operator owns.
//!
//! - `hooks`: manifest transforms folded over embedded manifests
//! - `deployment`: webhook Deployment reconciler
//! - `apply`: create/update and server-side apply primitives
//! - `ensure_tasks`: CRD and ConfigMap presence guards
//! - `static_resources`: periodic apply of the driver's static manifests

pub mod apply;
pub mod deployment;
pub mod ensure_tasks;
pub mod hooks;
pub mod static_resources;
