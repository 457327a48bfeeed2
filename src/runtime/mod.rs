//! # Runtime
//!
//! Operator startup and shutdown.
//!
//! Startup order:
//!
//! 1. Embedded manifests are validated; a malformed one aborts startup
//! 2. The share collector and self-metrics are registered
//! 3. Ensure loops start for both CRDs and the default ConfigMap
//! 4. Once both CRDs exist, the share reflectors start and feed the collector
//! 5. Hook caches, the webhook Deployment controller, the default-object
//!    fallback, the static resource resync and the log level sync start
//! 6. The metrics server binds and readiness is reported
//!
//! Shutdown order: ensure loops are stopped first, then the metrics server
//! drains for its grace period, then every remaining worker is cancelled.

pub mod ensure_loop;
pub mod error_policy;
pub mod initialization;
pub mod periodic;
pub mod watch_loop;

use crate::assets;
use crate::config::OperatorConfig;
use crate::constants::{
    INFRASTRUCTURE_NAME, LOG_LEVEL_SYNC_INTERVAL_SECS, OPERATOR_CR_NAME, WEBHOOK_SECRET_NAME,
};
use crate::controller::apply::KubeDeploymentApplier;
use crate::controller::deployment::{
    node_pipeline, spawn_default_reconcile, static_pipeline, webhook_pipeline,
    DeploymentReconciler, HookStores,
};
use crate::controller::ensure_tasks::{configmap_task, crd_tasks};
use crate::controller::hooks::SecretHashState;
use crate::controller::static_resources::{spawn_static_resources, StaticResources};
use crate::crd::{ClusterCSIDriver, Infrastructure, SharedConfigMap, SharedSecret};
use crate::observability::logging::LogLevelHandle;
use crate::observability::{OperatorMetrics, ShareCollector};
use crate::runtime::ensure_loop::{spawn_ensure_loop, EnsureLoopHandle};
use crate::runtime::initialization::label_namespace;
use crate::runtime::periodic::spawn_periodic;
use crate::runtime::watch_loop::{by_name, run_deployment_controller, spawn_reflector};
use crate::server::{MetricsServer, ServerState, TlsPaths};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::Api;
use kube::Client;
use kube_runtime::watcher;
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Why [`run_operator`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The root token was cancelled
    Cancelled,
    /// A long-running component ended without being asked to
    ComponentExited(&'static str),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::ComponentExited(name) => write!(f, "{name} exited unexpectedly"),
        }
    }
}

/// Everything started by the orchestrator, in shutdown order
struct RunningComponents {
    ensure_loops: Vec<EnsureLoopHandle>,
    server: Option<MetricsServer>,
    workers: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningComponents {
    async fn shutdown(mut self) {
        for ensure_loop in &self.ensure_loops {
            ensure_loop.stop();
        }
        if let Some(server) = self.server.as_mut() {
            if let Err(e) = server.stop().await {
                warn!("Metrics server stopped with error: {}", e);
            }
        }
        self.workers.cancel();

        for ensure_loop in self.ensure_loops {
            let name = ensure_loop.name().to_string();
            if let Err(e) = ensure_loop.join().await {
                warn!(task = %name, "Ensure loop panicked: {}", e);
            }
        }
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, "Worker panicked: {}", e);
            }
        }
        info!("Operator stopped");
    }
}

/// Run the operator until `root` is cancelled or a component exits
///
/// With `log_levels`, the operator object's `operatorLogLevel` drives the
/// process log filter.
pub async fn run_operator(
    config: OperatorConfig,
    client: Client,
    log_levels: Option<LogLevelHandle>,
    root: CancellationToken,
) -> Result<ExitReason> {
    assets::validate().context("Embedded manifests are invalid")?;

    let registry = Registry::new();
    let metrics = OperatorMetrics::new().context("Failed to create operator metrics")?;
    metrics
        .register(&registry)
        .context("Failed to register operator metrics")?;
    let collector = ShareCollector::new().context("Failed to create share collector")?;
    collector
        .create(&registry)
        .context("Failed to register share collector")?;

    let mut running = RunningComponents {
        ensure_loops: Vec::new(),
        server: None,
        workers: CancellationToken::new(),
        tasks: Vec::new(),
    };

    let crd_tasks = crd_tasks(&client).context("Failed to prepare CRD ensure tasks")?;
    let configmap_task = configmap_task(&client, &config.namespace)
        .context("Failed to prepare ConfigMap ensure task")?;
    let crd_loops = crd_tasks.len();
    for task in crd_tasks {
        running.ensure_loops.push(spawn_ensure_loop(
            task,
            config.ensure_interval(),
            &root,
            metrics.clone(),
        ));
    }
    running.ensure_loops.push(spawn_ensure_loop(
        configmap_task,
        config.ensure_interval(),
        &root,
        metrics.clone(),
    ));

    label_namespace(&client, &config.namespace).await;

    // Share reflectors would fail against a missing CRD
    info!("Waiting for shared resource CRDs...");
    let crds_ready = futures::future::join_all(
        running.ensure_loops[..crd_loops]
            .iter()
            .map(EnsureLoopHandle::wait_ready),
    );
    tokio::select! {
        () = root.cancelled() => {
            running.shutdown().await;
            collector.clear_state(&registry);
            return Ok(ExitReason::Cancelled);
        }
        ready = crds_ready => {
            if !ready.into_iter().all(|ready| ready) {
                running.shutdown().await;
                collector.clear_state(&registry);
                return Ok(ExitReason::ComponentExited("crd-ensure-loop"));
            }
        }
    }
    info!("Shared resource CRDs present");

    let (shared_secrets, task) = spawn_reflector(
        "sharedsecrets",
        Api::<SharedSecret>::all(client.clone()),
        watcher::Config::default(),
        running.workers.clone(),
    );
    running.tasks.push(("sharedsecrets-reflector", task));
    let (shared_config_maps, task) = spawn_reflector(
        "sharedconfigmaps",
        Api::<SharedConfigMap>::all(client.clone()),
        watcher::Config::default(),
        running.workers.clone(),
    );
    running.tasks.push(("sharedconfigmaps-reflector", task));
    collector.set_listers(Arc::new(shared_secrets), Arc::new(shared_config_maps));

    let (infrastructure, task) = spawn_reflector(
        "infrastructure",
        Api::<Infrastructure>::all(client.clone()),
        by_name(INFRASTRUCTURE_NAME),
        running.workers.clone(),
    );
    running.tasks.push(("infrastructure-reflector", task));
    let (nodes, task) = spawn_reflector(
        "nodes",
        Api::<Node>::all(client.clone()),
        watcher::Config::default(),
        running.workers.clone(),
    );
    running.tasks.push(("nodes-reflector", task));
    let (secrets, task) = spawn_reflector(
        "webhook-secret",
        Api::<Secret>::namespaced(client.clone(), &config.namespace),
        by_name(WEBHOOK_SECRET_NAME),
        running.workers.clone(),
    );
    running.tasks.push(("webhook-secret-reflector", task));
    let (operators, task) = spawn_reflector(
        "clustercsidrivers",
        Api::<ClusterCSIDriver>::all(client.clone()),
        by_name(OPERATOR_CR_NAME),
        running.workers.clone(),
    );
    running.tasks.push(("clustercsidrivers-reflector", task));

    let stores = HookStores {
        infrastructure,
        nodes,
        secrets,
    };
    let secret_state = Arc::new(SecretHashState::new(&config.namespace, WEBHOOK_SECRET_NAME));
    let reconciler = Arc::new(
        DeploymentReconciler::new(
            webhook_pipeline(&config, &stores, secret_state),
            Arc::new(KubeDeploymentApplier::new(client.clone())),
            assets::read_file(assets::WEBHOOK_DEPLOYMENT)?,
            metrics.clone(),
        )
        .with_intervals(config.resync_interval(), config.reconcile_error_requeue()),
    );
    let mut controller = tokio::spawn(run_deployment_controller(
        client.clone(),
        config.namespace.clone(),
        Arc::clone(&reconciler),
        running.workers.clone(),
    ));
    running.tasks.push((
        "default-deployment-reconcile",
        spawn_default_reconcile(
            operators.clone(),
            reconciler,
            config.resync_interval(),
            running.workers.clone(),
        ),
    ));

    if let Some(log_levels) = log_levels {
        let log_levels = Arc::new(log_levels);
        let operators = operators.clone();
        running.tasks.push((
            "log-level-sync",
            spawn_periodic(
                "log-level-sync",
                Duration::from_secs(LOG_LEVEL_SYNC_INTERVAL_SECS),
                running.workers.clone(),
                move || {
                    log_levels.sync_from(&operators);
                    futures::future::ready(())
                },
            ),
        ));
    }

    let static_resources = Arc::new(StaticResources::new(
        client.clone(),
        operators,
        static_pipeline(&config),
        node_pipeline(&config),
    ));
    running.tasks.push((
        "static-resources",
        spawn_static_resources(
            static_resources,
            config.resync_interval(),
            running.workers.clone(),
        ),
    ));

    let state = Arc::new(ServerState::new(registry.clone()));
    let tls = (!config.metrics_insecure).then(|| TlsPaths {
        cert: config.metrics_tls_cert_path.clone(),
        key: config.metrics_tls_key_path.clone(),
    });
    let started = match MetricsServer::build(
        config.metrics_addr(),
        tls,
        config.metrics_shutdown_grace(),
        Arc::clone(&state),
    ) {
        Ok(server) => running.server.insert(server).run().await,
        Err(e) => Err(e),
    };
    if let Err(e) = started {
        running.tasks.push(("deployment-controller", controller));
        running.shutdown().await;
        collector.clear_state(&registry);
        return Err(e).context("Failed to start metrics server");
    }

    state.set_ready(true);
    info!("Operator started");

    let server = running.server.as_mut();
    let reason = tokio::select! {
        () = root.cancelled() => ExitReason::Cancelled,
        result = &mut controller => {
            if let Err(e) = result {
                error!("Webhook Deployment controller panicked: {}", e);
            }
            ExitReason::ComponentExited("deployment-controller")
        }
        result = async {
            match server {
                Some(server) => server.exited().await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!("Metrics server failed: {}", e);
            }
            ExitReason::ComponentExited("metrics-server")
        }
    };
    info!(reason = %reason, "Shutting down");

    if reason != ExitReason::ComponentExited("deployment-controller") {
        running.tasks.push(("deployment-controller", controller));
    }
    running.shutdown().await;
    collector.clear_state(&registry);
    Ok(reason)
}
