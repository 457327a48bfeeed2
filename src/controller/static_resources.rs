//! # Static Resources
//!
//! Server-side applies the driver's static manifests (CSIDriver, service
//! account, services, RBAC) and the node DaemonSet on every resync tick.
//! A failing object is logged and the rest of the tick carries on.
//!
//! Static manifests go through their own pipeline first so they land in the
//! configured operator namespace.

use crate::assets;
use crate::constants::OPERATOR_CR_NAME;
use crate::controller::apply::apply_manifest;
use crate::controller::hooks::ManifestPipeline;
use crate::crd::{ClusterCSIDriver, OperatorSpec};
use crate::runtime::periodic::spawn_periodic;
use kube_runtime::reflector::{ObjectRef, Store};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

/// Result of one resync tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub applied: usize,
    pub failed: usize,
    pub skipped: bool,
}

pub struct StaticResources {
    client: Client,
    operators: Store<ClusterCSIDriver>,
    static_pipeline: ManifestPipeline,
    node_pipeline: ManifestPipeline,
}

impl std::fmt::Debug for StaticResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticResources")
            .field("static_pipeline", &self.static_pipeline)
            .field("node_pipeline", &self.node_pipeline)
            .finish_non_exhaustive()
    }
}

impl StaticResources {
    pub fn new(
        client: Client,
        operators: Store<ClusterCSIDriver>,
        static_pipeline: ManifestPipeline,
        node_pipeline: ManifestPipeline,
    ) -> Self {
        Self {
            client,
            operators,
            static_pipeline,
            node_pipeline,
        }
    }

    /// Operator spec from the cache; a missing object counts as managed
    fn operator_spec(&self) -> OperatorSpec {
        self.operators
            .get(&ObjectRef::new(OPERATOR_CR_NAME))
            .map(|operator| operator.spec.clone())
            .unwrap_or_default()
    }

    /// Apply every static manifest and the node DaemonSet once
    pub async fn sync(&self) -> SyncSummary {
        let spec = self.operator_spec();
        if !spec.management_state.is_managed() {
            info!(
                "Operator is {}, skipping static resources",
                spec.management_state.as_str()
            );
            return SyncSummary {
                skipped: true,
                ..SyncSummary::default()
            };
        }

        let mut summary = SyncSummary::default();
        for name in assets::STATIC_RESOURCES {
            let result = match self.render_static(&spec, name) {
                Ok(rendered) => apply_manifest(&self.client, name, &rendered)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => summary.applied += 1,
                Err(e) => {
                    warn!(asset = name, "Failed to apply static resource: {}", e);
                    summary.failed += 1;
                }
            }
        }

        let daemonset = assets::NODE_DAEMONSET;
        match self.render_node_daemonset(&spec) {
            Ok(rendered) => match apply_manifest(&self.client, daemonset, &rendered).await {
                Ok(()) => summary.applied += 1,
                Err(e) => {
                    warn!(asset = daemonset, "Failed to apply node DaemonSet: {}", e);
                    summary.failed += 1;
                }
            },
            Err(e) => {
                warn!(asset = daemonset, "Failed to render node DaemonSet: {}", e);
                summary.failed += 1;
            }
        }

        summary
    }

    fn render_static(&self, spec: &OperatorSpec, name: &str) -> anyhow::Result<Vec<u8>> {
        let base = assets::read_file(name)?;
        Ok(self.static_pipeline.render(spec, base)?)
    }

    fn render_node_daemonset(&self, spec: &OperatorSpec) -> anyhow::Result<Vec<u8>> {
        let base = assets::read_file(assets::NODE_DAEMONSET)?;
        Ok(self.node_pipeline.render(spec, base)?)
    }
}

/// Resync static resources every `interval` until `token` is cancelled
pub fn spawn_static_resources(
    resources: Arc<StaticResources>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    spawn_periodic("static-resources", interval, token, move || {
        let resources = Arc::clone(&resources);
        async move {
            let summary = resources.sync().await;
            if !summary.skipped {
                info!(
                    applied = summary.applied,
                    failed = summary.failed,
                    "Static resources synced"
                );
            }
        }
        .instrument(tracing::info_span!("controller.static_resources.sync"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::controller::apply::resolve_manifest;
    use crate::controller::deployment::{node_pipeline, static_pipeline};
    use crate::crd::{ClusterCSIDriverSpec, ManagementState};
    use kube_runtime::reflector::store;
    use kube_runtime::watcher;

    fn client() -> Client {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn test_unmanaged_operator_skips_every_apply() {
        let (operators, mut writer) = store();
        writer.apply_watcher_event(&watcher::Event::Apply(ClusterCSIDriver::new(
            OPERATOR_CR_NAME,
            ClusterCSIDriverSpec {
                management_state: ManagementState::Unmanaged,
                ..Default::default()
            },
        )));
        let resources = StaticResources::new(
            client(),
            operators,
            ManifestPipeline::default(),
            ManifestPipeline::default(),
        );

        let summary = resources.sync().await;
        assert!(summary.skipped);
        assert_eq!(summary.applied + summary.failed, 0);
    }

    #[tokio::test]
    async fn test_missing_operator_counts_as_managed() {
        let (operators, _writer) = store();
        let resources = StaticResources::new(
            client(),
            operators,
            ManifestPipeline::default(),
            ManifestPipeline::default(),
        );
        assert!(resources.operator_spec().management_state.is_managed());
    }

    #[tokio::test]
    async fn test_manifests_render_into_configured_namespace() {
        let config = OperatorConfig {
            namespace: "csi-test".to_string(),
            ..OperatorConfig::default()
        };
        let (operators, _writer) = store();
        let resources = StaticResources::new(
            client(),
            operators,
            static_pipeline(&config),
            node_pipeline(&config),
        );
        let spec = OperatorSpec::default();

        for name in assets::STATIC_RESOURCES {
            let rendered = resources.render_static(&spec, name).unwrap();
            let (object, _) = resolve_manifest(name, &rendered).unwrap();
            if let Some(namespace) = object.metadata.namespace.as_deref() {
                assert_eq!(namespace, "csi-test", "{name} should be re-namespaced");
            }
        }

        let binding = resources
            .render_static(&spec, assets::NODE_BINDING)
            .unwrap();
        let binding: serde_yaml::Value = serde_yaml::from_slice(&binding).unwrap();
        assert_eq!(
            binding["subjects"][0]["namespace"],
            serde_yaml::Value::from("csi-test")
        );

        let daemonset = resources.render_node_daemonset(&spec).unwrap();
        let (daemonset, _) = resolve_manifest(assets::NODE_DAEMONSET, &daemonset).unwrap();
        assert_eq!(daemonset.metadata.namespace.as_deref(), Some("csi-test"));
    }
}
