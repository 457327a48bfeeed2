//! # Embedded Assets
//!
//! Manifests compiled into the binary. Every object the operator keeps present
//! is addressed by a logical path such as `webhook/deployment.yaml`.
//!
//! [`validate`] parses every payload once at startup. A payload that fails to
//! parse is a build defect, so the caller treats it as fatal.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors raised when reading or decoding an embedded payload
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset {0} not found")]
    NotFound(String),
    #[error("asset {name} is malformed: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("asset {name} is missing required field {field}")]
    MissingField { name: String, field: &'static str },
}

macro_rules! asset {
    ($path:literal) => {
        (
            $path,
            include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/", $path)).as_slice(),
        )
    };
}

pub const CSI_DRIVER: &str = "csidriver.yaml";
pub const NODE_SERVICE_ACCOUNT: &str = "node_sa.yaml";
pub const SERVICE: &str = "service.yaml";
pub const METRICS_SERVICE: &str = "metrics_service.yaml";
pub const NODE_DAEMONSET: &str = "node.yaml";
pub const PRIVILEGED_ROLE: &str = "rbac/privileged_role.yaml";
pub const NODE_ROLE: &str = "rbac/node_role.yaml";
pub const NODE_PRIVILEGED_BINDING: &str = "rbac/node_privileged_binding.yaml";
pub const NODE_BINDING: &str = "rbac/node_binding.yaml";
pub const PROMETHEUS_ROLE: &str = "rbac/prometheus_role.yaml";
pub const PROMETHEUS_ROLE_BINDING: &str = "rbac/prometheus_rolebinding.yaml";
pub const WEBHOOK_DEPLOYMENT: &str = "webhook/deployment.yaml";
pub const SHARED_SECRETS_CRD: &str = "crds/sharedsecrets.yaml";
pub const SHARED_CONFIGMAPS_CRD: &str = "crds/sharedconfigmaps.yaml";
pub const DEFAULT_CONFIGMAP: &str = "configmap.yaml";

static ASSETS: &[(&str, &[u8])] = &[
    asset!("csidriver.yaml"),
    asset!("node_sa.yaml"),
    asset!("service.yaml"),
    asset!("metrics_service.yaml"),
    asset!("node.yaml"),
    asset!("rbac/privileged_role.yaml"),
    asset!("rbac/node_role.yaml"),
    asset!("rbac/node_privileged_binding.yaml"),
    asset!("rbac/node_binding.yaml"),
    asset!("rbac/prometheus_role.yaml"),
    asset!("rbac/prometheus_rolebinding.yaml"),
    asset!("webhook/deployment.yaml"),
    asset!("crds/sharedsecrets.yaml"),
    asset!("crds/sharedconfigmaps.yaml"),
    asset!("configmap.yaml"),
];

/// Static manifests server-side applied on every resync, in apply order
pub const STATIC_RESOURCES: &[&str] = &[
    CSI_DRIVER,
    NODE_SERVICE_ACCOUNT,
    SERVICE,
    METRICS_SERVICE,
    PRIVILEGED_ROLE,
    NODE_ROLE,
    NODE_PRIVILEGED_BINDING,
    NODE_BINDING,
    PROMETHEUS_ROLE,
    PROMETHEUS_ROLE_BINDING,
];

/// Read an embedded payload by logical path
pub fn read_file(name: &str) -> Result<&'static [u8], AssetError> {
    ASSETS
        .iter()
        .find(|(path, _)| *path == name)
        .map(|(_, bytes)| *bytes)
        .ok_or_else(|| AssetError::NotFound(name.to_string()))
}

/// Logical paths of every embedded payload, in declaration order
pub fn names() -> impl Iterator<Item = &'static str> {
    ASSETS.iter().map(|(path, _)| *path)
}

/// Decode a payload into a typed object
pub fn decode<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<T, AssetError> {
    serde_yaml::from_slice(bytes).map_err(|source| AssetError::Malformed {
        name: name.to_string(),
        source,
    })
}

/// Read and decode an embedded payload in one step
pub fn load<T: DeserializeOwned>(name: &str) -> Result<T, AssetError> {
    decode(name, read_file(name)?)
}

/// Parse every payload and check it names an object
pub fn validate() -> Result<(), AssetError> {
    for (name, bytes) in ASSETS {
        let value: serde_yaml::Value = decode(name, bytes)?;
        for field in ["apiVersion", "kind"] {
            if value.get(field).and_then(serde_yaml::Value::as_str).is_none() {
                return Err(AssetError::MissingField {
                    name: (*name).to_string(),
                    field,
                });
            }
        }
        if value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(serde_yaml::Value::as_str)
            .is_none()
        {
            return Err(AssetError::MissingField {
                name: (*name).to_string(),
                field: "metadata.name",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    #[test]
    fn test_all_embedded_assets_validate() {
        validate().expect("embedded assets should be well formed");
    }

    #[test]
    fn test_read_file_unknown_name() {
        let err = read_file("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, AssetError::NotFound(ref n) if n == "does/not/exist.yaml"));
        assert_eq!(err.to_string(), "asset does/not/exist.yaml not found");
    }

    #[test]
    fn test_static_resources_are_embedded() {
        for name in STATIC_RESOURCES {
            assert!(read_file(name).is_ok(), "{name} should be embedded");
        }
        assert_eq!(names().count(), 15);
    }

    #[test]
    fn test_typed_payloads_decode() {
        let deployment: Deployment = load(WEBHOOK_DEPLOYMENT).unwrap();
        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("shared-resource-csi-driver-webhook")
        );

        let daemonset: DaemonSet = load(NODE_DAEMONSET).unwrap();
        assert_eq!(
            daemonset.metadata.namespace.as_deref(),
            Some("openshift-cluster-csi-drivers")
        );

        let configmap: ConfigMap = load(DEFAULT_CONFIGMAP).unwrap();
        assert!(configmap.data.unwrap().contains_key("config.yaml"));

        for crd in [SHARED_SECRETS_CRD, SHARED_CONFIGMAPS_CRD] {
            let crd: CustomResourceDefinition = load(crd).unwrap();
            assert_eq!(crd.spec.group, "sharedresource.openshift.io");
            assert_eq!(crd.spec.scope, "Cluster");
        }
    }

    #[test]
    fn test_decode_reports_malformed_payload() {
        let err = decode::<serde_yaml::Value>("broken.yaml", b"kind: [unterminated").unwrap_err();
        assert!(matches!(err, AssetError::Malformed { ref name, .. } if name == "broken.yaml"));
    }
}
