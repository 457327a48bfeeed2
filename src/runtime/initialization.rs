//! # Initialization
//!
//! Process setup shared by every entry point: rustls crypto provider, the
//! Kubernetes client, signal handling and the operator namespace labels.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Labels the operator namespace needs: cluster monitoring scrapes it and the
/// node DaemonSet runs privileged
const NAMESPACE_LABELS: &[(&str, &str)] = &[
    ("openshift.io/cluster-monitoring", "true"),
    ("pod-security.kubernetes.io/enforce", "privileged"),
    ("pod-security.kubernetes.io/audit", "privileged"),
    ("pod-security.kubernetes.io/warn", "privileged"),
];

/// Install ring as the process-wide rustls provider
///
/// Must run before any TLS client or server is built. A second call is a no-op.
pub fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("rustls crypto provider already installed");
    }
}

/// Build a client from `kubeconfig`, or from in-cluster credentials when absent
pub async fn build_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => Config::incluster().context("Failed to load in-cluster configuration")?,
    };
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Cancel `token` on SIGINT or SIGTERM
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, initiating graceful shutdown...");
            }
            () = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
            () = token.cancelled() => return,
        }
        token.cancel();
    });
}

/// Merge the required labels into the operator namespace
///
/// Best effort: a failure is logged and startup continues.
pub async fn label_namespace(client: &Client, namespace: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let labels: serde_json::Map<String, serde_json::Value> = NAMESPACE_LABELS
        .iter()
        .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
        .collect();
    let patch = serde_json::json!({ "metadata": { "labels": labels } });

    match api
        .patch(namespace, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => info!(namespace = %namespace, "Operator namespace labelled"),
        Err(e) => warn!(namespace = %namespace, "Failed to label operator namespace: {}", e),
    }
}
