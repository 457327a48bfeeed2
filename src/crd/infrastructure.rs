//! # Infrastructure
//!
//! The cluster-wide `Infrastructure` singleton. Only the control plane
//! topology is read; everything else stays opaque.

use serde::{Deserialize, Serialize};

/// How control plane nodes are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum TopologyMode {
    HighlyAvailable,
    SingleReplica,
    /// Control plane runs outside the cluster, so no master nodes exist
    External,
}

#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Infrastructure",
    group = "config.openshift.io",
    version = "v1",
    status = "InfrastructureStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_spec: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(default)]
    pub control_plane_topology: Option<TopologyMode>,
    #[serde(default)]
    pub infrastructure_topology: Option<TopologyMode>,
    #[serde(default)]
    pub platform: Option<String>,
}

impl Infrastructure {
    /// Control plane topology, if the status has been populated
    #[must_use]
    pub fn control_plane_topology(&self) -> Option<TopologyMode> {
        self.status.as_ref().and_then(|s| s.control_plane_topology)
    }
}
