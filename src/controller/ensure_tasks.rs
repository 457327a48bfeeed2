//! # Ensure Tasks
//!
//! Kubernetes-backed [`EnsureTask`]s guarding the shared resource CRDs and the
//! driver's default ConfigMap. The desired object is decoded from its embedded
//! manifest on every create so a deleted object comes back exactly as shipped.

use crate::assets::{self, AssetError};
use crate::constants::FIELD_MANAGER;
use crate::runtime::ensure_loop::{CreateOutcome, EnsureError, EnsureTask};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Guards one object decoded from an embedded manifest
pub struct KubeEnsureTask<K> {
    api: Api<K>,
    asset: &'static str,
    kind: String,
    name: String,
    namespace: Option<String>,
}

impl<K> Debug for KubeEnsureTask<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEnsureTask")
            .field("asset", &self.asset)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K> KubeEnsureTask<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    /// Build a task for `asset`, learning the object name from the manifest
    pub fn new(api: Api<K>, asset: &'static str) -> Result<Self, AssetError> {
        let object: K = assets::load(asset)?;
        let name = object
            .meta()
            .name
            .clone()
            .ok_or(AssetError::MissingField {
                name: asset.to_string(),
                field: "metadata.name",
            })?;
        Ok(Self {
            api,
            asset,
            kind: K::kind(&()).into_owned(),
            name,
            namespace: None,
        })
    }

    /// Create the object in `namespace` regardless of the manifest's namespace
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

#[async_trait]
impl<K> EnsureTask for KubeEnsureTask<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    type Object = K;

    fn kind(&self) -> &str {
        &self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> Result<K, EnsureError> {
        let mut object: K = assets::load(self.asset)?;
        if let Some(namespace) = &self.namespace {
            object.meta_mut().namespace = Some(namespace.clone());
        }
        Ok(object)
    }

    async fn exists(&self, name: &str) -> Result<bool, EnsureError> {
        self.api
            .get_opt(name)
            .await
            .map(|object| object.is_some())
            .map_err(|source| EnsureError::Read {
                kind: self.kind.clone(),
                name: name.to_string(),
                source,
            })
    }

    async fn create(&self, object: K) -> Result<CreateOutcome, EnsureError> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.api.create(&params, &object).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(source) => Err(EnsureError::Create {
                kind: self.kind.clone(),
                name: self.name.clone(),
                source,
            }),
        }
    }
}

/// One task per shared resource CRD
pub fn crd_tasks(
    client: &Client,
) -> Result<Vec<KubeEnsureTask<CustomResourceDefinition>>, AssetError> {
    [assets::SHARED_SECRETS_CRD, assets::SHARED_CONFIGMAPS_CRD]
        .into_iter()
        .map(|asset| KubeEnsureTask::new(Api::all(client.clone()), asset))
        .collect()
}

/// Task guarding the driver's default ConfigMap
pub fn configmap_task(
    client: &Client,
    namespace: &str,
) -> Result<KubeEnsureTask<ConfigMap>, AssetError> {
    let api = Api::namespaced(client.clone(), namespace);
    Ok(KubeEnsureTask::new(api, assets::DEFAULT_CONFIGMAP)?.in_namespace(namespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tasks_learn_names_from_manifests() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        // Api construction does not touch the network
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();

        let crds = crd_tasks(&client).unwrap();
        let names: Vec<&str> = crds.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                "sharedsecrets.sharedresource.openshift.io",
                "sharedconfigmaps.sharedresource.openshift.io"
            ]
        );
        assert_eq!(crds[0].kind(), "CustomResourceDefinition");

        let configmap = configmap_task(&client, "other-ns").unwrap();
        assert_eq!(configmap.name(), "csi-driver-shared-resource-config");
        let desired = configmap.fetch().unwrap();
        assert_eq!(desired.metadata.namespace.as_deref(), Some("other-ns"));
    }
}
