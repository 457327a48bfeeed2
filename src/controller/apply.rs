//! # Apply
//!
//! Writes rendered manifests to the cluster.
//!
//! - [`KubeDeploymentApplier`] creates or updates the webhook Deployment and
//!   skips the write only when the rendered spec matches what was last applied
//!   and nobody else has changed the object since.
//! - [`apply_manifest`] server-side applies an arbitrary embedded manifest.

use crate::constants::{FIELD_MANAGER, SPEC_HASH_ANNOTATION};
use crate::controller::deployment::ReconcileError;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::gvk::ParseGroupVersionError;
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// What an apply call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

impl ApplyOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

#[async_trait]
pub trait DeploymentApplier: Send + Sync {
    async fn apply(&self, deployment: Deployment) -> Result<ApplyOutcome, ReconcileError>;
}

/// Hex md5 of the Deployment spec
pub fn spec_hash(deployment: &Deployment) -> Result<String, serde_json::Error> {
    let spec = serde_json::to_vec(&deployment.spec)?;
    Ok(format!("{:x}", md5::compute(spec)))
}

/// Server-side applies the webhook Deployment
///
/// Remembers the `metadata.generation` each write produced. A live object whose
/// generation moved on was edited out-of-band and is re-applied even when its
/// spec-hash annotation still matches.
pub struct KubeDeploymentApplier {
    client: Client,
    /// `namespace/name` to the generation returned by our last write
    generations: Mutex<HashMap<String, i64>>,
}

impl std::fmt::Debug for KubeDeploymentApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeDeploymentApplier").finish_non_exhaustive()
    }
}

impl KubeDeploymentApplier {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            generations: Mutex::new(HashMap::new()),
        }
    }

    fn recorded_generation(&self, key: &str) -> Option<i64> {
        self.generations
            .lock()
            .ok()
            .and_then(|generations| generations.get(key).copied())
    }

    fn record_generation(&self, key: String, written: &Deployment) {
        let Some(generation) = written.metadata.generation else {
            return;
        };
        if let Ok(mut generations) = self.generations.lock() {
            generations.insert(key, generation);
        }
    }
}

/// True when `live` carries `hash` and has not changed since our last write
fn is_current(live: &Deployment, hash: &str, recorded_generation: Option<i64>) -> bool {
    let applied = live
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION));
    applied.map(String::as_str) == Some(hash)
        && recorded_generation.is_some()
        && live.metadata.generation == recorded_generation
}

#[async_trait]
impl DeploymentApplier for KubeDeploymentApplier {
    async fn apply(&self, mut deployment: Deployment) -> Result<ApplyOutcome, ReconcileError> {
        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or(ReconcileError::MissingName)?;
        let namespace = deployment
            .metadata
            .namespace
            .clone()
            .ok_or(ReconcileError::MissingName)?;
        let hash = spec_hash(&deployment).map_err(ReconcileError::Hash)?;
        deployment
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());

        let key = format!("{namespace}/{name}");
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let apply_error = |source| ReconcileError::Apply {
            namespace: namespace.clone(),
            name: name.clone(),
            source,
        };

        let existing = api.get_opt(&name).await.map_err(apply_error)?;
        match existing {
            None => {
                let params = PostParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                };
                match api.create(&params, &deployment).await {
                    Ok(created) => {
                        self.record_generation(key, &created);
                        info!(deployment = %name, namespace = %namespace, "Created Deployment");
                        return Ok(ApplyOutcome::Created);
                    }
                    // Created concurrently; fall through to the patch
                    Err(kube::Error::Api(e)) if e.code == 409 => {}
                    Err(e) => return Err(apply_error(e)),
                }
            }
            Some(existing) => {
                if is_current(&existing, &hash, self.recorded_generation(&key)) {
                    debug!(deployment = %name, namespace = %namespace, "Deployment up to date");
                    return Ok(ApplyOutcome::Unchanged);
                }
            }
        }

        // Server-side apply needs the managed fields cleared
        deployment.metadata.managed_fields = None;
        deployment.metadata.resource_version = None;
        let patched = api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&deployment),
            )
            .await
            .map_err(apply_error)?;
        self.record_generation(key, &patched);
        info!(deployment = %name, namespace = %namespace, "Updated Deployment");
        Ok(ApplyOutcome::Updated)
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("manifest {name} is malformed: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("manifest {0} has no apiVersion, kind or name")]
    Incomplete(String),
    #[error("manifest {name} has an invalid apiVersion: {source}")]
    ApiVersion {
        name: String,
        #[source]
        source: ParseGroupVersionError,
    },
    #[error("failed to apply {kind} {name}: {source}")]
    Kube {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Decode a manifest and resolve the API it belongs to
pub fn resolve_manifest(
    asset: &str,
    bytes: &[u8],
) -> Result<(DynamicObject, ApiResource), ApplyError> {
    let object: DynamicObject =
        serde_yaml::from_slice(bytes).map_err(|source| ApplyError::Malformed {
            name: asset.to_string(),
            source,
        })?;
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| ApplyError::Incomplete(asset.to_string()))?;
    if object.metadata.name.is_none() {
        return Err(ApplyError::Incomplete(asset.to_string()));
    }
    let gvk = GroupVersionKind::try_from(types).map_err(|source| ApplyError::ApiVersion {
        name: asset.to_string(),
        source,
    })?;
    let resource = ApiResource::from_gvk(&gvk);
    Ok((object, resource))
}

/// Server-side apply one manifest, forcing ownership of conflicting fields
pub async fn apply_manifest(client: &Client, asset: &str, bytes: &[u8]) -> Result<(), ApplyError> {
    let (object, resource) = resolve_manifest(asset, bytes)?;
    let name = object.metadata.name.clone().unwrap_or_default();
    let api: Api<DynamicObject> = match object.metadata.namespace.as_deref() {
        Some(namespace) => Api::namespaced_with(client.clone(), namespace, &resource),
        None => Api::all_with(client.clone(), &resource),
    };
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&object),
    )
    .await
    .map_err(|source| ApplyError::Kube {
        kind: resource.kind.clone(),
        name: name.clone(),
        source,
    })?;
    debug!(kind = %resource.kind, name = %name, "Applied manifest");
    Ok(())
}
