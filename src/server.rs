//! # HTTP Server
//!
//! HTTP server for metrics, and health checks.
//!
//! Provides endpoints:
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness check (always returns 200)
//! - `/readyz` - Readiness check (returns 200 once the operator finished startup)
//!
//! The server runs on port 6000 by default (configurable via `METRICS_PORT`)
//! and serves TLS from the mounted serving certificate unless
//! `METRICS_INSECURE` is set.
//!
//! Lifecycle: [`MetricsServer::build`] validates configuration without
//! binding, [`MetricsServer::run`] binds and serves in the background, and
//! [`MetricsServer::stop`] lets in-flight requests finish for at most the grace
//! period before connections are closed.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Extra time allowed on top of the grace period before the serve task is aborted
const STOP_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("TLS material not found at {0}")]
    MissingTls(PathBuf),
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),
    #[error("failed to bind metrics server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("metrics server terminated: {0}")]
    Io(#[source] std::io::Error),
    #[error("metrics server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("metrics server is already running")]
    AlreadyRunning,
}

/// Certificate and key served by the metrics endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug)]
pub struct ServerState {
    pub registry: Registry,
    pub is_ready: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            is_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Relaxed);
    }
}

pub struct MetricsServer {
    addr: SocketAddr,
    tls: Option<TlsPaths>,
    grace: Duration,
    state: Arc<ServerState>,
    handle: Handle,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer")
            .field("addr", &self.addr)
            .field("tls", &self.tls)
            .field("grace", &self.grace)
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl MetricsServer {
    /// Validate configuration; nothing is bound until [`MetricsServer::run`]
    pub fn build(
        addr: SocketAddr,
        tls: Option<TlsPaths>,
        grace: Duration,
        state: Arc<ServerState>,
    ) -> Result<Self, ServerError> {
        if let Some(tls) = &tls {
            for path in [&tls.cert, &tls.key] {
                if !path.exists() {
                    return Err(ServerError::MissingTls(path.clone()));
                }
            }
        }
        Ok(Self {
            addr,
            tls,
            grace,
            state,
            handle: Handle::new(),
            task: None,
        })
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Bind and serve in the background, returning the bound address
    pub async fn run(&mut self) -> Result<SocketAddr, ServerError> {
        if self.task.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let app = router(Arc::clone(&self.state)).layer(TraceLayer::new_for_http());
        let handle = self.handle.clone();
        let mut task = match &self.tls {
            Some(tls) => {
                let config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                    .await
                    .map_err(ServerError::Tls)?;
                tokio::spawn(
                    axum_server::bind_rustls(self.addr, config)
                        .handle(handle)
                        .serve(app.into_make_service()),
                )
            }
            None => tokio::spawn(
                axum_server::bind(self.addr)
                    .handle(handle)
                    .serve(app.into_make_service()),
            ),
        };

        if let Some(local) = self.handle.listening().await {
            info!(
                addr = %local,
                tls = self.tls.is_some(),
                "Metrics server listening"
            );
            self.task = Some(task);
            return Ok(local);
        }

        // listening() only yields None when the serve future ended before binding
        match (&mut task).await {
            Ok(Err(source)) => Err(ServerError::Bind {
                addr: self.addr,
                source,
            }),
            Ok(Ok(())) => Err(ServerError::Bind {
                addr: self.addr,
                source: std::io::Error::other("server exited before listening"),
            }),
            Err(e) => Err(ServerError::Join(e)),
        }
    }

    /// Stop accepting connections and drain in-flight requests
    ///
    /// Requests still running after the grace period are cut off.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        self.state.set_ready(false);
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        info!(grace_secs = self.grace.as_secs_f64(), "Stopping metrics server");
        self.handle.graceful_shutdown(Some(self.grace));
        let abort = task.abort_handle();
        match tokio::time::timeout(self.grace + STOP_SLACK, task).await {
            Ok(Ok(Ok(()))) => {
                info!("Metrics server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(ServerError::Io(e)),
            Ok(Err(e)) => Err(ServerError::Join(e)),
            Err(_) => {
                warn!("Metrics server did not drain in time, closing connections");
                self.handle.shutdown();
                abort.abort();
                Ok(())
            }
        }
    }

    /// Resolves when the serve task ends on its own
    ///
    /// Never resolves while the server is not running.
    pub async fn exited(&mut self) -> Result<(), ServerError> {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let result = task.await;
        self.task = None;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServerError::Io(e)),
            Err(e) => Err(ServerError::Join(e)),
        }
    }
}

/// Routes served by the metrics endpoint
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

fn encode(registry: &Registry) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    // Collectors list caches synchronously; keep that off the async workers
    let registry = state.registry.clone();
    let encoded = tokio::task::spawn_blocking(move || encode(&registry)).await;

    match encoded {
        Ok(Ok(buffer)) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Ok(Err(e)) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
        Err(e) => {
            error!("Metrics encoding task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                b"Failed to encode metrics".to_vec(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
