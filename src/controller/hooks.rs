//! # Manifest Hooks
//!
//! Transforms folded over an embedded manifest before it is applied. Each hook
//! receives the operator spec and the bytes produced by the previous hook and
//! returns new bytes. Hooks run in the order they were declared and never rely
//! on an earlier hook having run.
//!
//! Standard hooks, in order:
//!
//! 1. [`NamespaceHook`] - moves the manifest into the operator namespace
//! 2. [`ReplaceHook`] - literal placeholder substitution (image references)
//! 3. [`LogLevelHook`] - operand verbosity from the operator object
//! 4. [`ControlPlaneTopologyHook`] - drops control plane scheduling on external topologies
//! 5. [`ReplicaCountHook`] - replica count from the number of eligible nodes
//! 6. [`SecretHashHook`] - pod template annotation tracking a Secret's content

use crate::constants::{
    DEFAULT_OPERATOR_NAMESPACE, INFRASTRUCTURE_NAME, LOG_LEVEL_PLACEHOLDER,
    SECRET_HASH_ANNOTATION_PREFIX,
};
use crate::crd::{Infrastructure, OperatorSpec, TopologyMode};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube_runtime::reflector::{ObjectRef, Store};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

/// Node labels marking control plane nodes
const CONTROL_PLANE_NODE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

#[derive(Debug, Error)]
pub enum HookError {
    #[error("manifest is not a valid Deployment: {0}")]
    Decode(#[source] serde_yaml::Error),
    #[error("manifest is not valid YAML: {0}")]
    Yaml(#[source] serde_yaml::Error),
    #[error("failed to encode manifest: {0}")]
    Encode(#[source] serde_yaml::Error),
    #[error("failed to hash Secret {namespace}/{name}: {source}")]
    SecretHash {
        namespace: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of one hook inside a pipeline
#[derive(Debug, Error)]
#[error("manifest hook {hook} failed: {source}")]
pub struct RenderError {
    pub hook: &'static str,
    #[source]
    pub source: HookError,
}

pub trait ManifestHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, spec: &OperatorSpec, manifest: Vec<u8>) -> Result<Vec<u8>, HookError>;
}

/// Ordered hook chain built once at startup
#[derive(Default)]
pub struct ManifestPipeline {
    hooks: Vec<Box<dyn ManifestHook>>,
}

impl std::fmt::Debug for ManifestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestPipeline")
            .field("hooks", &self.hook_names())
            .finish()
    }
}

impl ManifestPipeline {
    pub fn new(hooks: Vec<Box<dyn ManifestHook>>) -> Self {
        Self { hooks }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: impl ManifestHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn hook_names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    /// Fold every hook over `base`, stopping at the first failure
    pub fn render(&self, spec: &OperatorSpec, base: &[u8]) -> Result<Vec<u8>, RenderError> {
        self.hooks
            .iter()
            .try_fold(base.to_vec(), |manifest, hook| {
                hook.apply(spec, manifest).map_err(|source| RenderError {
                    hook: hook.name(),
                    source,
                })
            })
    }
}

fn decode_deployment(manifest: &[u8]) -> Result<Deployment, HookError> {
    serde_yaml::from_slice(manifest).map_err(HookError::Decode)
}

fn encode_deployment(deployment: &Deployment) -> Result<Vec<u8>, HookError> {
    serde_yaml::to_string(deployment)
        .map(String::into_bytes)
        .map_err(HookError::Encode)
}

fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    if from.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.windows(from.len()).position(|w| w == from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(to);
        rest = &rest[pos + from.len()..];
    }
    out.extend_from_slice(rest);
    out
}

/// Replaces every occurrence of a literal placeholder
#[derive(Debug, Clone)]
pub struct ReplaceHook {
    placeholder: String,
    value: String,
}

impl ReplaceHook {
    pub fn new(placeholder: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
            value: value.into(),
        }
    }
}

impl ManifestHook for ReplaceHook {
    fn name(&self) -> &'static str {
        "replace"
    }

    fn apply(&self, _spec: &OperatorSpec, manifest: Vec<u8>) -> Result<Vec<u8>, HookError> {
        Ok(replace_all(
            &manifest,
            self.placeholder.as_bytes(),
            self.value.as_bytes(),
        ))
    }
}

/// Rewrites every reference to the shipped namespace to the operator namespace
///
/// Covers `metadata.namespace` and the namespace of RBAC `subjects`. References
/// to any other namespace are left alone.
#[derive(Debug, Clone)]
pub struct NamespaceHook {
    shipped: String,
    namespace: String,
}

impl NamespaceHook {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            shipped: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            namespace: namespace.into(),
        }
    }

    fn rewrite(&self, field: Option<&mut Value>) -> bool {
        match field {
            Some(value) if value.as_str() == Some(self.shipped.as_str()) => {
                *value = Value::from(self.namespace.as_str());
                true
            }
            _ => false,
        }
    }
}

impl ManifestHook for NamespaceHook {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn apply(&self, _spec: &OperatorSpec, manifest: Vec<u8>) -> Result<Vec<u8>, HookError> {
        if self.namespace == self.shipped {
            return Ok(manifest);
        }

        let mut object: Value = serde_yaml::from_slice(&manifest).map_err(HookError::Yaml)?;
        let mut changed = self.rewrite(
            object
                .get_mut("metadata")
                .and_then(|metadata| metadata.get_mut("namespace")),
        );
        if let Some(subjects) = object.get_mut("subjects").and_then(Value::as_sequence_mut) {
            for subject in subjects {
                changed |= self.rewrite(subject.get_mut("namespace"));
            }
        }
        if !changed {
            return Ok(manifest);
        }
        serde_yaml::to_string(&object)
            .map(String::into_bytes)
            .map_err(HookError::Encode)
    }
}

/// Fills the operand `--v` placeholder from the operator object's `logLevel`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLevelHook;

impl ManifestHook for LogLevelHook {
    fn name(&self) -> &'static str {
        "log-level"
    }

    fn apply(&self, spec: &OperatorSpec, manifest: Vec<u8>) -> Result<Vec<u8>, HookError> {
        let verbosity = spec.log_level.unwrap_or_default().verbosity().to_string();
        Ok(replace_all(
            &manifest,
            LOG_LEVEL_PLACEHOLDER.as_bytes(),
            verbosity.as_bytes(),
        ))
    }
}

/// Removes control plane node selectors and tolerations when the control
/// plane is external and no such nodes exist
#[derive(Clone)]
pub struct ControlPlaneTopologyHook {
    infrastructure: Store<Infrastructure>,
}

impl std::fmt::Debug for ControlPlaneTopologyHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneTopologyHook")
            .finish_non_exhaustive()
    }
}

impl ControlPlaneTopologyHook {
    pub fn new(infrastructure: Store<Infrastructure>) -> Self {
        Self { infrastructure }
    }

    fn topology(&self) -> Option<TopologyMode> {
        self.infrastructure
            .get(&ObjectRef::new(INFRASTRUCTURE_NAME))
            .and_then(|infra| infra.control_plane_topology())
    }
}

impl ManifestHook for ControlPlaneTopologyHook {
    fn name(&self) -> &'static str {
        "control-plane-topology"
    }

    fn apply(&self, _spec: &OperatorSpec, manifest: Vec<u8>) -> Result<Vec<u8>, HookError> {
        if self.topology() != Some(TopologyMode::External) {
            return Ok(manifest);
        }

        let mut deployment = decode_deployment(&manifest)?;
        let Some(pod_spec) = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        else {
            return Ok(manifest);
        };

        if let Some(selector) = pod_spec.node_selector.as_mut() {
            for label in CONTROL_PLANE_NODE_LABELS {
                selector.remove(*label);
            }
            if selector.is_empty() {
                pod_spec.node_selector = None;
            }
        }
        if let Some(tolerations) = pod_spec.tolerations.as_mut() {
            tolerations.retain(|t| {
                !t.key
                    .as_deref()
                    .is_some_and(|key| CONTROL_PLANE_NODE_LABELS.contains(&key))
            });
            if tolerations.is_empty() {
                pod_spec.tolerations = None;
            }
        }
        debug!("External control plane, removed control plane scheduling constraints");
        encode_deployment(&deployment)
    }
}

/// Replica policy applied by [`ReplicaCountHook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaPolicy {
    /// Fewer eligible nodes than this runs a single replica
    pub node_threshold: usize,
    /// Replicas once the threshold is reached
    pub high_availability_replicas: i32,
}

impl ReplicaPolicy {
    #[must_use]
    pub fn replicas_for(&self, eligible_nodes: usize) -> i32 {
        if eligible_nodes < self.node_threshold {
            1
        } else {
            self.high_availability_replicas
        }
    }
}

/// Sets `spec.replicas` from the number of nodes the pod template can land on
#[derive(Clone)]
pub struct ReplicaCountHook {
    nodes: Store<Node>,
    policy: ReplicaPolicy,
}

impl std::fmt::Debug for ReplicaCountHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaCountHook")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ReplicaCountHook {
    pub fn new(nodes: Store<Node>, policy: ReplicaPolicy) -> Self {
        Self { nodes, policy }
    }

    fn eligible_nodes(&self, selector: Option<&BTreeMap<String, String>>) -> usize {
        self.nodes
            .state()
            .iter()
            .filter(|node| {
                let Some(selector) = selector else {
                    return true;
                };
                let labels = node.metadata.labels.as_ref();
                selector.iter().all(|(key, value)| {
                    labels
                        .and_then(|l| l.get(key))
                        .is_some_and(|actual| actual == value)
                })
            })
            .count()
    }
}

impl ManifestHook for ReplicaCountHook {
    fn name(&self) -> &'static str {
        "replica-count"
    }

    fn apply(&self, _spec: &OperatorSpec, manifest: Vec<u8>) -> Result<Vec<u8>, HookError> {
        let mut deployment = decode_deployment(&manifest)?;
        let Some(spec) = deployment.spec.as_mut() else {
            return Ok(manifest);
        };
        let selector = spec
            .template
            .spec
            .as_ref()
            .and_then(|p| p.node_selector.as_ref());
        let eligible = self.eligible_nodes(selector);
        let replicas = self.policy.replicas_for(eligible);
        debug!(eligible_nodes = eligible, replicas, "Computed webhook replicas");
        spec.replicas = Some(replicas);
        encode_deployment(&deployment)
    }
}

/// Last content hash seen for the tracked Secret
#[derive(Debug)]
pub struct SecretHashState {
    namespace: String,
    secret_name: String,
    last_observed_hash: Mutex<Option<String>>,
}

impl SecretHashState {
    pub fn new(namespace: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            secret_name: secret_name.into(),
            last_observed_hash: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    /// Pod template annotation written for this Secret
    pub fn annotation_key(&self) -> String {
        format!("{SECRET_HASH_ANNOTATION_PREFIX}.{}", self.secret_name)
    }

    pub fn last_observed_hash(&self) -> Option<String> {
        self.last_observed_hash
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Record `observed` if present and return the hash to write
    fn observe(&self, observed: Option<String>) -> Option<String> {
        let mut last = self
            .last_observed_hash
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(hash) = observed {
            if last.as_deref() != Some(hash.as_str()) {
                info!(
                    secret = %self.secret_name,
                    namespace = %self.namespace,
                    hash = %hash,
                    "Observed new Secret content"
                );
            }
            *last = Some(hash);
        }
        last.clone()
    }
}

/// Hex md5 of a Secret's data, stable across key order
pub fn secret_content_hash(secret: &Secret) -> Result<String, serde_json::Error> {
    let data = serde_json::to_vec(&secret.data)?;
    Ok(format!("{:x}", md5::compute(data)))
}

/// Annotates the pod template with the tracked Secret's content hash so a
/// content change rolls the pods
///
/// A missing Secret reuses the last hash seen. If none was ever seen, the
/// manifest is left unchanged.
#[derive(Clone)]
pub struct SecretHashHook {
    secrets: Store<Secret>,
    state: Arc<SecretHashState>,
}

impl std::fmt::Debug for SecretHashHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretHashHook")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SecretHashHook {
    pub fn new(secrets: Store<Secret>, state: Arc<SecretHashState>) -> Self {
        Self { secrets, state }
    }
}

impl ManifestHook for SecretHashHook {
    fn name(&self) -> &'static str {
        "secret-hash"
    }

    fn apply(&self, _spec: &OperatorSpec, manifest: Vec<u8>) -> Result<Vec<u8>, HookError> {
        let key = ObjectRef::new(self.state.secret_name()).within(self.state.namespace());
        let observed = match self.secrets.get(&key) {
            Some(secret) => {
                Some(
                    secret_content_hash(&secret).map_err(|source| HookError::SecretHash {
                        namespace: self.state.namespace().to_string(),
                        name: self.state.secret_name().to_string(),
                        source,
                    })?,
                )
            }
            None => {
                debug!(
                    secret = %self.state.secret_name(),
                    namespace = %self.state.namespace(),
                    "Secret not in cache, keeping last observed hash"
                );
                None
            }
        };

        let Some(hash) = self.state.observe(observed) else {
            return Ok(manifest);
        };

        let mut deployment = decode_deployment(&manifest)?;
        let Some(spec) = deployment.spec.as_mut() else {
            return Ok(manifest);
        };
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(self.state.annotation_key(), hash);
        encode_deployment(&deployment)
    }
}
