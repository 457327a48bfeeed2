//! # Error Policy
//!
//! Error handling for the webhook Deployment controller. Failed reconciles
//! are counted, logged and requeued after a fixed delay; the controller
//! runtime supplies the rest of the retry behaviour.

use crate::controller::deployment::{DeploymentReconciler, ReconcileError};
use crate::crd::ClusterCSIDriver;
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::error;

/// Handle reconciliation errors with a fixed requeue
pub fn handle_reconciliation_error(
    obj: Arc<ClusterCSIDriver>,
    error: &ReconcileError,
    ctx: Arc<DeploymentReconciler>,
) -> Action {
    let name = obj.metadata.name.as_deref().unwrap_or("unknown");

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.deployment.reconciliation_error",
        operator = name,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!(
        "Webhook Deployment reconcile failed, retrying in {}s: {:?}",
        ctx.error_requeue().as_secs(),
        error
    );
    ctx.metrics().increment_deployment_reconcile_errors();
    ctx.metrics().record_deployment_reconcile("error");
    Action::requeue(ctx.error_requeue())
}
