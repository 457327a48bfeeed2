//! # Webhook Deployment Reconciler
//!
//! Keeps the webhook Deployment aligned with the manifest pipeline's output.
//! Every trigger (the operator object, the Deployment, the serving Secret, the
//! Infrastructure object or any Node) renders the embedded manifest through the
//! hook chain and applies the result.
//!
//! An operator reporting `Unmanaged` or `Removed` is skipped entirely.
//! Failures are returned to the controller runtime, which requeues through
//! the error policy.
//!
//! The controller only sees an operator object that exists. While it is
//! absent, [`spawn_default_reconcile`] reconciles a default (managed) one on
//! the resync interval instead.

use crate::config::OperatorConfig;
use crate::constants::{
    DRIVER_IMAGE_PLACEHOLDER, NODE_DRIVER_REGISTRAR_IMAGE_PLACEHOLDER, OPERATOR_CR_NAME,
    WEBHOOK_IMAGE_PLACEHOLDER,
};
use crate::controller::apply::{ApplyOutcome, DeploymentApplier};
use crate::controller::hooks::{
    ControlPlaneTopologyHook, LogLevelHook, ManifestPipeline, NamespaceHook, RenderError,
    ReplaceHook, ReplicaCountHook, ReplicaPolicy, SecretHashHook, SecretHashState,
};
use crate::crd::{ClusterCSIDriver, ClusterCSIDriverSpec, Infrastructure};
use crate::observability::OperatorMetrics;
use crate::runtime::periodic::spawn_periodic;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube_runtime::controller::Action;
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("rendered manifest is not a Deployment: {0}")]
    Decode(#[source] serde_yaml::Error),
    #[error("rendered Deployment has no name or namespace")]
    MissingName,
    #[error("failed to hash Deployment spec: {0}")]
    Hash(#[source] serde_json::Error),
    #[error("failed to apply Deployment {namespace}/{name}: {source}")]
    Apply {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Caches read by the webhook hooks
#[derive(Clone)]
pub struct HookStores {
    pub infrastructure: Store<Infrastructure>,
    pub nodes: Store<Node>,
    pub secrets: Store<Secret>,
}

impl std::fmt::Debug for HookStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookStores").finish_non_exhaustive()
    }
}

/// Standard webhook hook chain: namespace, image, log level, topology,
/// replicas, secret hash
pub fn webhook_pipeline(
    config: &OperatorConfig,
    stores: &HookStores,
    secret_state: Arc<SecretHashState>,
) -> ManifestPipeline {
    ManifestPipeline::default()
        .with_hook(NamespaceHook::new(config.namespace.clone()))
        .with_hook(ReplaceHook::new(
            WEBHOOK_IMAGE_PLACEHOLDER,
            config.webhook_image.clone(),
        ))
        .with_hook(LogLevelHook)
        .with_hook(ControlPlaneTopologyHook::new(stores.infrastructure.clone()))
        .with_hook(ReplicaCountHook::new(
            stores.nodes.clone(),
            ReplicaPolicy {
                node_threshold: config.replica_node_threshold,
                high_availability_replicas: config.high_availability_replicas,
            },
        ))
        .with_hook(SecretHashHook::new(stores.secrets.clone(), secret_state))
}

/// Namespace, image substitutions and log level for the node DaemonSet
pub fn node_pipeline(config: &OperatorConfig) -> ManifestPipeline {
    ManifestPipeline::default()
        .with_hook(NamespaceHook::new(config.namespace.clone()))
        .with_hook(ReplaceHook::new(
            DRIVER_IMAGE_PLACEHOLDER,
            config.driver_image.clone(),
        ))
        .with_hook(ReplaceHook::new(
            NODE_DRIVER_REGISTRAR_IMAGE_PLACEHOLDER,
            config.node_driver_registrar_image.clone(),
        ))
        .with_hook(LogLevelHook)
}

/// Namespace rewrite for the static manifests
pub fn static_pipeline(config: &OperatorConfig) -> ManifestPipeline {
    ManifestPipeline::default().with_hook(NamespaceHook::new(config.namespace.clone()))
}

/// Reconciler context
pub struct DeploymentReconciler {
    pipeline: ManifestPipeline,
    applier: Arc<dyn DeploymentApplier>,
    base_manifest: &'static [u8],
    metrics: OperatorMetrics,
    resync: Duration,
    error_requeue: Duration,
}

impl std::fmt::Debug for DeploymentReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentReconciler")
            .field("pipeline", &self.pipeline)
            .field("resync", &self.resync)
            .field("error_requeue", &self.error_requeue)
            .finish_non_exhaustive()
    }
}

impl DeploymentReconciler {
    pub fn new(
        pipeline: ManifestPipeline,
        applier: Arc<dyn DeploymentApplier>,
        base_manifest: &'static [u8],
        metrics: OperatorMetrics,
    ) -> Self {
        Self {
            pipeline,
            applier,
            base_manifest,
            metrics,
            resync: Duration::from_secs(crate::constants::DEFAULT_RESYNC_INTERVAL_SECS),
            error_requeue: Duration::from_secs(
                crate::constants::DEFAULT_RECONCILE_ERROR_REQUEUE_SECS,
            ),
        }
    }

    #[must_use]
    pub fn with_intervals(mut self, resync: Duration, error_requeue: Duration) -> Self {
        self.resync = resync;
        self.error_requeue = error_requeue;
        self
    }

    pub fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    pub fn error_requeue(&self) -> Duration {
        self.error_requeue
    }

    /// Render the Deployment for `operator` without applying it
    pub fn render(&self, operator: &ClusterCSIDriver) -> Result<Deployment, ReconcileError> {
        let manifest = self.pipeline.render(&operator.spec, self.base_manifest)?;
        serde_yaml::from_slice(&manifest).map_err(ReconcileError::Decode)
    }
}

/// Reconcile the webhook Deployment for one operator object
pub async fn reconcile(
    operator: Arc<ClusterCSIDriver>,
    ctx: Arc<DeploymentReconciler>,
) -> Result<Action, ReconcileError> {
    let name = operator.metadata.name.as_deref().unwrap_or("unknown").to_string();
    let state = operator.spec.management_state;
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.deployment.reconcile",
        operator = %name,
        management_state = state.as_str()
    );

    async move {
        if !state.is_managed() {
            info!("Operator is {}, skipping webhook Deployment", state.as_str());
            ctx.metrics.record_deployment_reconcile("skipped");
            return Ok(Action::await_change());
        }

        let deployment = ctx.render(&operator)?;
        let outcome = ctx.applier.apply(deployment).await?;
        ctx.metrics.record_deployment_reconcile(outcome.as_str());
        if outcome != ApplyOutcome::Unchanged {
            info!("Webhook Deployment {}", outcome.as_str());
        } else {
            debug!("Webhook Deployment unchanged");
        }
        Ok(Action::requeue(ctx.resync))
    }
    .instrument(span)
    .await
}

/// Reconcile a default operator object when `operators` has none
///
/// Returns `None` without doing anything while the real object is cached;
/// the controller owns that case.
pub async fn reconcile_missing_operator(
    operators: &Store<ClusterCSIDriver>,
    ctx: Arc<DeploymentReconciler>,
) -> Option<Result<Action, ReconcileError>> {
    if operators.get(&ObjectRef::new(OPERATOR_CR_NAME)).is_some() {
        return None;
    }
    debug!("Operator object absent, reconciling with defaults");
    let operator = ClusterCSIDriver::new(OPERATOR_CR_NAME, ClusterCSIDriverSpec::default());
    Some(reconcile(Arc::new(operator), ctx).await)
}

/// Keep the webhook Deployment applied while the operator object is absent
///
/// Waits for the operator cache to sync so an existing object is never
/// mistaken for a missing one.
pub fn spawn_default_reconcile(
    operators: Store<ClusterCSIDriver>,
    ctx: Arc<DeploymentReconciler>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => return,
            synced = operators.wait_until_ready() => {
                if let Err(e) = synced {
                    warn!("Operator cache never synced: {}", e);
                    return;
                }
            }
        }
        let task = spawn_periodic("default-deployment-reconcile", interval, token, move || {
            let operators = operators.clone();
            let ctx = Arc::clone(&ctx);
            async move {
                if let Some(Err(e)) = reconcile_missing_operator(&operators, ctx).await {
                    warn!("Webhook Deployment reconcile without operator object failed: {}", e);
                }
            }
        });
        if let Err(e) = task.await {
            warn!("Default Deployment reconcile panicked: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets;
    use crate::crd::{ClusterCSIDriverSpec, ManagementState};
    use async_trait::async_trait;
    use kube_runtime::reflector::store;
    use kube_runtime::watcher;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApplier {
        applied: Mutex<Vec<Deployment>>,
    }

    #[async_trait]
    impl DeploymentApplier for RecordingApplier {
        async fn apply(&self, deployment: Deployment) -> Result<ApplyOutcome, ReconcileError> {
            self.applied.lock().unwrap().push(deployment);
            Ok(ApplyOutcome::Updated)
        }
    }

    fn stores() -> HookStores {
        HookStores {
            infrastructure: store().0,
            nodes: store().0,
            secrets: store().0,
        }
    }

    fn reconciler(
        applier: Arc<RecordingApplier>,
        metrics: OperatorMetrics,
    ) -> Arc<DeploymentReconciler> {
        let config = OperatorConfig {
            webhook_image: "quay.io/example/webhook:v1".to_string(),
            ..OperatorConfig::default()
        };
        let pipeline = webhook_pipeline(
            &config,
            &stores(),
            Arc::new(SecretHashState::new(&config.namespace, "serving-cert")),
        );
        Arc::new(
            DeploymentReconciler::new(
                pipeline,
                applier,
                assets::read_file(assets::WEBHOOK_DEPLOYMENT).unwrap(),
                metrics,
            )
            .with_intervals(Duration::from_secs(600), Duration::from_secs(5)),
        )
    }

    fn operator(state: ManagementState) -> Arc<ClusterCSIDriver> {
        Arc::new(ClusterCSIDriver::new(
            crate::constants::OPERATOR_CR_NAME,
            ClusterCSIDriverSpec {
                management_state: state,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_pipeline_order() {
        let config = OperatorConfig::default();
        let pipeline = webhook_pipeline(
            &config,
            &stores(),
            Arc::new(SecretHashState::new("ns", "secret")),
        );
        assert_eq!(
            pipeline.hook_names(),
            vec![
                "namespace",
                "replace",
                "log-level",
                "control-plane-topology",
                "replica-count",
                "secret-hash"
            ]
        );
        assert_eq!(
            node_pipeline(&config).hook_names(),
            vec!["namespace", "replace", "replace", "log-level"]
        );
        assert_eq!(static_pipeline(&config).hook_names(), vec!["namespace"]);
    }

    #[tokio::test]
    async fn test_managed_operator_applies_rendered_deployment() {
        let applier = Arc::new(RecordingApplier::default());
        let metrics = OperatorMetrics::new().unwrap();
        let ctx = reconciler(Arc::clone(&applier), metrics);

        let action = reconcile(operator(ManagementState::Managed), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(600)));

        let applied = applier.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        let spec = applied[0].spec.as_ref().unwrap();
        // No nodes in cache: single replica
        assert_eq!(spec.replicas, Some(1));
        let image = spec.template.spec.as_ref().unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some("quay.io/example/webhook:v1"));
    }

    #[tokio::test]
    async fn test_unmanaged_operator_is_skipped() {
        let applier = Arc::new(RecordingApplier::default());
        let ctx = reconciler(Arc::clone(&applier), OperatorMetrics::new().unwrap());

        for state in [ManagementState::Unmanaged, ManagementState::Removed] {
            let action = reconcile(operator(state), Arc::clone(&ctx)).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
        assert!(applier.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_operator_reconciles_with_defaults() {
        let applier = Arc::new(RecordingApplier::default());
        let ctx = reconciler(Arc::clone(&applier), OperatorMetrics::new().unwrap());
        let (operators, _writer) = store::<ClusterCSIDriver>();

        let result = reconcile_missing_operator(&operators, ctx).await;
        assert_eq!(
            result.unwrap().unwrap(),
            Action::requeue(Duration::from_secs(600))
        );
        assert_eq!(applier.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_present_operator_is_left_to_the_controller() {
        let applier = Arc::new(RecordingApplier::default());
        let ctx = reconciler(Arc::clone(&applier), OperatorMetrics::new().unwrap());
        let (operators, mut writer) = store();
        let unmanaged = operator(ManagementState::Unmanaged);
        writer.apply_watcher_event(&watcher::Event::Apply((*unmanaged).clone()));

        assert!(reconcile_missing_operator(&operators, ctx).await.is_none());
        assert!(applier.applied.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_reconcile_waits_for_cache_sync() {
        let applier = Arc::new(RecordingApplier::default());
        let ctx = reconciler(Arc::clone(&applier), OperatorMetrics::new().unwrap());
        let (operators, mut writer) = store::<ClusterCSIDriver>();
        let token = CancellationToken::new();
        let task = spawn_default_reconcile(
            operators,
            ctx,
            Duration::from_secs(60),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(applier.applied.lock().unwrap().is_empty());

        // An empty initial list marks the cache ready
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitDone);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(applier.applied.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(applier.applied.lock().unwrap().len(), 2);

        token.cancel();
        task.await.unwrap();
    }
}
