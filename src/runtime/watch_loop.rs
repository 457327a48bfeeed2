//! # Watch Loop
//!
//! Reflectors feeding the caches the operator reads, and the controller that
//! triggers webhook Deployment reconciles when any watched input changes.

use crate::constants::{
    INFRASTRUCTURE_NAME, OPERATOR_CR_NAME, WEBHOOK_DEPLOYMENT_NAME, WEBHOOK_SECRET_NAME,
};
use crate::controller::deployment::{reconcile, DeploymentReconciler};
use crate::crd::{ClusterCSIDriver, Infrastructure};
use crate::runtime::error_policy::handle_reconciliation_error;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::Api;
use kube_runtime::controller::{self, Controller};
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Quiet period before a burst of watch events turns into one reconcile
const RECONCILE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Field selector matching a single object by name
pub fn by_name(name: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("metadata.name={name}"))
}

/// Start a reflector populating a cache until `token` is cancelled
///
/// Watch errors are retried with the default backoff and never end the
/// reflector.
pub fn spawn_reflector<K>(
    name: &'static str,
    api: Api<K>,
    config: watcher::Config,
    token: CancellationToken,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (store, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, config)).default_backoff();

    let join = tokio::spawn(async move {
        let drain = stream.for_each(|event| {
            if let Err(e) = event {
                warn!(reflector = name, "Watch error, retrying: {}", e);
            }
            futures::future::ready(())
        });
        tokio::select! {
            () = token.cancelled() => debug!(reflector = name, "Reflector stopped"),
            () = drain => warn!(reflector = name, "Watch stream ended"),
        }
    });
    (store, join)
}

fn to_operator<K>(_: K) -> Option<ObjectRef<ClusterCSIDriver>> {
    Some(ObjectRef::new(OPERATOR_CR_NAME))
}

/// Run the webhook Deployment controller until `token` is cancelled
///
/// The operator object is the primary resource. The Deployment, its serving
/// Secret, the Infrastructure object and every Node map back to it.
pub async fn run_deployment_controller(
    client: Client,
    namespace: String,
    reconciler: Arc<DeploymentReconciler>,
    token: CancellationToken,
) {
    let watch_span = tracing::span!(
        tracing::Level::INFO,
        "controller.watch",
        operation = "deployment_controller"
    );

    let operators: Api<ClusterCSIDriver> = Api::all(client.clone());
    let controller_future = Controller::new(operators, by_name(OPERATOR_CR_NAME))
        .with_config(controller::Config::default().debounce(RECONCILE_DEBOUNCE))
        .watches(
            Api::<Deployment>::namespaced(client.clone(), &namespace),
            by_name(WEBHOOK_DEPLOYMENT_NAME),
            to_operator,
        )
        .watches(
            Api::<Secret>::namespaced(client.clone(), &namespace),
            by_name(WEBHOOK_SECRET_NAME),
            to_operator,
        )
        .watches(
            Api::<Infrastructure>::all(client.clone()),
            by_name(INFRASTRUCTURE_NAME),
            to_operator,
        )
        .watches(
            Api::<Node>::all(client),
            watcher::Config::default(),
            to_operator,
        )
        .run(reconcile, handle_reconciliation_error, reconciler)
        .for_each(|result| {
            match result {
                Ok((object, _)) => debug!(operator = %object.name, "watch.event.success"),
                Err(e) => warn!("Deployment controller event failed: {}", e),
            }
            futures::future::ready(())
        });

    async {
        info!("Starting webhook Deployment controller...");
        tokio::select! {
            () = token.cancelled() => info!("Webhook Deployment controller stopped"),
            () = controller_future => warn!("Webhook Deployment controller stream ended"),
        }
    }
    .instrument(watch_span)
    .await;
}
