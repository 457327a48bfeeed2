//! # Ensure Loop
//!
//! Keeps a single named cluster object present. Each pass checks whether the
//! object exists and, only if it does not, creates it from its embedded
//! payload. An object that already exists is never touched, so the loop can
//! run next to anything else that manages the same object.
//!
//! A failed pass is logged and retried on the next tick. The fixed interval is
//! the whole retry policy.

use crate::assets::AssetError;
use crate::observability::OperatorMetrics;
use crate::runtime::periodic::spawn_periodic;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum EnsureError {
    #[error("failed to read {kind} {name}: {source}")]
    Read {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to create {kind} {name}: {source}")]
    Create {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error(transparent)]
    Asset(#[from] AssetError),
}

/// Result of a create call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Someone else created the object between the existence check and the create
    AlreadyExists,
}

/// Result of one ensure pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Present,
    Created,
    RaceLost,
    Failed,
}

impl EnsureOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Created => "created",
            Self::RaceLost => "already_exists",
            Self::Failed => "failed",
        }
    }

    /// The object is known to exist after this pass
    #[must_use]
    pub fn is_ready(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// One guarded object
#[async_trait]
pub trait EnsureTask: Send + Sync {
    type Object: Send;

    /// Kind of the guarded object, for logs
    fn kind(&self) -> &str;

    /// Name of the guarded object
    fn name(&self) -> &str;

    /// Build the desired object
    fn fetch(&self) -> Result<Self::Object, EnsureError>;

    async fn exists(&self, name: &str) -> Result<bool, EnsureError>;

    async fn create(&self, object: Self::Object) -> Result<CreateOutcome, EnsureError>;
}

/// Run a single ensure pass
pub async fn run_ensure_pass<T>(task: &T) -> EnsureOutcome
where
    T: EnsureTask + ?Sized,
{
    let span = tracing::info_span!("ensure.pass", kind = task.kind(), name = task.name());
    async {
        match task.exists(task.name()).await {
            Ok(true) => {
                debug!("Object present, nothing to do");
                EnsureOutcome::Present
            }
            Ok(false) => {
                let object = match task.fetch() {
                    Ok(object) => object,
                    Err(e) => {
                        error!("Failed to build desired object: {}", e);
                        return EnsureOutcome::Failed;
                    }
                };
                match task.create(object).await {
                    Ok(CreateOutcome::Created) => {
                        info!("Created missing object");
                        EnsureOutcome::Created
                    }
                    Ok(CreateOutcome::AlreadyExists) => {
                        info!("Object was created concurrently, treating as present");
                        EnsureOutcome::RaceLost
                    }
                    Err(e) => {
                        warn!("Ensure pass failed, retrying next tick: {}", e);
                        EnsureOutcome::Failed
                    }
                }
            }
            Err(e) => {
                warn!("Ensure pass failed, retrying next tick: {}", e);
                EnsureOutcome::Failed
            }
        }
    }
    .instrument(span)
    .await
}

/// Running ensure loop
#[derive(Debug)]
pub struct EnsureLoopHandle {
    name: String,
    stop: CancellationToken,
    ready: watch::Receiver<bool>,
    join: JoinHandle<()>,
}

impl EnsureLoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send the stop signal; the loop exits without starting another pass
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// At least one pass observed the object present or created it
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the object is known to exist
    ///
    /// Returns `false` if the loop ended first.
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.clone();
        let ready = ready.wait_for(|ready| *ready).await.is_ok();
        ready
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.join.await
    }
}

/// Start an ensure loop for `task`
///
/// The first pass runs immediately. The loop ends when `parent` is cancelled
/// or [`EnsureLoopHandle::stop`] is called.
pub fn spawn_ensure_loop<T>(
    task: T,
    interval: Duration,
    parent: &CancellationToken,
    metrics: OperatorMetrics,
) -> EnsureLoopHandle
where
    T: EnsureTask + 'static,
{
    let name = format!("{}/{}", task.kind(), task.name());
    let stop = parent.child_token();
    let (ready_tx, ready_rx) = watch::channel(false);
    let ready_tx = Arc::new(ready_tx);
    let task = Arc::new(task);

    info!(task = %name, interval_secs = interval.as_secs(), "Starting ensure loop");
    let join = spawn_periodic(name.clone(), interval, stop.clone(), move || {
        let task = Arc::clone(&task);
        let metrics = metrics.clone();
        let ready_tx = Arc::clone(&ready_tx);
        async move {
            let outcome = run_ensure_pass(task.as_ref()).await;
            metrics.record_ensure_pass(task.name(), outcome.as_str());
            if outcome.is_ready() {
                ready_tx.send_if_modified(|ready| !std::mem::replace(ready, true));
            }
        }
    });

    EnsureLoopHandle {
        name,
        stop,
        ready: ready_rx,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTask {
        present: AtomicBool,
        fail_reads: AtomicBool,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl EnsureTask for FakeTask {
        type Object = String;

        fn kind(&self) -> &str {
            "ConfigMap"
        }

        fn name(&self) -> &str {
            "fake"
        }

        fn fetch(&self) -> Result<String, EnsureError> {
            Ok("fake".to_string())
        }

        async fn exists(&self, _name: &str) -> Result<bool, EnsureError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(EnsureError::Asset(AssetError::NotFound("fake".to_string())));
            }
            Ok(self.present.load(Ordering::SeqCst))
        }

        async fn create(&self, _object: String) -> Result<CreateOutcome, EnsureError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.present.store(true, Ordering::SeqCst);
            Ok(CreateOutcome::Created)
        }
    }

    #[tokio::test]
    async fn test_pass_skips_present_object() {
        let task = FakeTask::default();
        task.present.store(true, Ordering::SeqCst);
        assert_eq!(run_ensure_pass(&task).await, EnsureOutcome::Present);
        assert_eq!(task.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pass_creates_missing_object_once() {
        let task = FakeTask::default();
        assert_eq!(run_ensure_pass(&task).await, EnsureOutcome::Created);
        assert_eq!(run_ensure_pass(&task).await, EnsureOutcome::Present);
        assert_eq!(task.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_failure_is_not_ready() {
        let task = FakeTask::default();
        task.fail_reads.store(true, Ordering::SeqCst);
        let outcome = run_ensure_pass(&task).await;
        assert_eq!(outcome, EnsureOutcome::Failed);
        assert!(!outcome.is_ready());
        assert_eq!(task.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_becomes_ready_and_stops() {
        let token = CancellationToken::new();
        let metrics = OperatorMetrics::new().unwrap();
        let handle = spawn_ensure_loop(
            FakeTask::default(),
            Duration::from_secs(60),
            &token,
            metrics.clone(),
        );

        assert!(handle.wait_ready().await);
        assert!(handle.is_ready());
        assert_eq!(handle.name(), "ConfigMap/fake");
        assert_eq!(metrics.ensure_passes("fake", "created"), 1);

        handle.stop();
        handle.join().await.unwrap();
        assert!(!token.is_cancelled());
    }
}
