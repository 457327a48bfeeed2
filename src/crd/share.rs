//! # Shared Resources
//!
//! Cluster-scoped references that let workloads in any namespace mount a
//! Secret or ConfigMap owned by another namespace through the CSI driver.

use serde::{Deserialize, Serialize};

/// Namespaced object a share points at
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareReference {
    pub name: String,
    pub namespace: String,
}

/// Status reported by the driver for a share
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareStatus {
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
}

/// SharedSecret exposes one Secret to other namespaces
///
/// # Example
///
/// ```yaml
/// apiVersion: sharedresource.openshift.io/v1alpha1
/// kind: SharedSecret
/// metadata:
///   name: shared-pull-secret
/// spec:
///   secretRef:
///     name: pull-secret
///     namespace: openshift-config
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "SharedSecret",
    group = "sharedresource.openshift.io",
    version = "v1alpha1",
    status = "ShareStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SharedSecretSpec {
    pub secret_ref: ShareReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// SharedConfigMap exposes one ConfigMap to other namespaces
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "SharedConfigMap",
    group = "sharedresource.openshift.io",
    version = "v1alpha1",
    status = "ShareStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SharedConfigMapSpec {
    pub config_map_ref: ShareReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
