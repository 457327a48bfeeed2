//! Common test utilities for integration tests
//!
//! Provides rustls crypto provider setup, a metrics server bound to an
//! ephemeral port, and a stub Kubernetes API server.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use prometheus::Registry;
use serde_json::{json, Value};
use shared_resource_operator::server::{MetricsServer, ServerState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::net::TcpListener;

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests
///
/// Uses a `Once` to ensure it's only called once across all tests.
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Plain HTTP metrics server on 127.0.0.1 with an ephemeral port
pub async fn start_server(
    registry: Registry,
    grace: Duration,
) -> (MetricsServer, SocketAddr, Arc<ServerState>) {
    init_rustls();
    let state = Arc::new(ServerState::new(registry));
    let mut server = MetricsServer::build(
        "127.0.0.1:0".parse().unwrap(),
        None,
        grace,
        Arc::clone(&state),
    )
    .expect("server config should be valid");
    let addr = server.run().await.expect("server should bind");
    (server, addr, state)
}

pub fn http_client() -> reqwest::Client {
    init_rustls();
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("client should build")
}

/// In-memory stand-in for the Kubernetes API server
///
/// Serves GET, POST and PATCH on object paths, answering with `Status` bodies
/// the way the real server does. `metadata.generation` starts at 1 and is
/// bumped whenever a write changes `spec`.
#[derive(Debug, Clone, Default)]
pub struct ApiStub {
    state: Arc<Mutex<StubState>>,
}

#[derive(Debug, Default)]
struct StubState {
    objects: HashMap<String, Value>,
    conflict_on_create: bool,
    fail_all: bool,
    requests: Vec<(String, String)>,
}

impl ApiStub {
    /// Start the stub on an ephemeral port and return a client pointed at it
    pub async fn start() -> (Self, kube::Client) {
        init_rustls();
        let stub = Self::default();
        let router = Router::new().fallback(stub_handler).with_state(stub.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        let config = kube::Config::new(format!("http://{addr}").parse().unwrap());
        let client = kube::Client::try_from(config).expect("client should build");
        (stub, client)
    }

    pub fn insert(&self, path: &str, object: Value) {
        self.state().objects.insert(path.to_string(), object);
    }

    pub fn object(&self, path: &str) -> Option<Value> {
        self.state().objects.get(path).cloned()
    }

    /// Apply `edit` to a stored object as another client would
    pub fn edit(&self, path: &str, edit: impl FnOnce(&mut Value)) {
        let mut state = self.state();
        let object = state.objects.get_mut(path).expect("object should exist");
        let before = object["spec"].clone();
        edit(object);
        if object["spec"] != before {
            bump_generation(object);
        }
    }

    /// The next creates store the object but answer 409, as if another writer won
    pub fn conflict_on_create(&self) {
        self.state().conflict_on_create = true;
    }

    /// Answer every request with 500
    pub fn fail_all(&self) {
        self.state().fail_all = true;
    }

    /// `(method, path)` of every request served so far
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state().requests.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }
}

fn bump_generation(object: &mut Value) {
    let generation = object["metadata"]["generation"].as_i64().unwrap_or(0);
    object["metadata"]["generation"] = json!(generation + 1);
}

fn status(code: StatusCode, reason: &str) -> Response {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code.as_u16(),
    });
    (code, Json(body)).into_response()
}

async fn stub_handler(
    State(stub): State<ApiStub>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path().trim_end_matches('/').to_string();
    let mut state = stub.state();
    state.requests.push((method.to_string(), path.clone()));
    if state.fail_all {
        return status(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
    }

    match method {
        Method::GET => match state.objects.get(&path) {
            Some(object) => Json(object.clone()).into_response(),
            None => status(StatusCode::NOT_FOUND, "NotFound"),
        },
        Method::POST => {
            let Ok(mut object) = serde_json::from_slice::<Value>(&body) else {
                return status(StatusCode::BAD_REQUEST, "BadRequest");
            };
            let name = object["metadata"]["name"].as_str().unwrap_or_default();
            let key = format!("{path}/{name}");
            if state.objects.contains_key(&key) {
                return status(StatusCode::CONFLICT, "AlreadyExists");
            }
            object["metadata"]["generation"] = json!(1);
            state.objects.insert(key, object.clone());
            if state.conflict_on_create {
                return status(StatusCode::CONFLICT, "AlreadyExists");
            }
            (StatusCode::CREATED, Json(object)).into_response()
        }
        Method::PATCH => {
            let Ok(mut object) = serde_json::from_slice::<Value>(&body) else {
                return status(StatusCode::BAD_REQUEST, "BadRequest");
            };
            let generation = match state.objects.get(&path) {
                Some(live) if live["spec"] == object["spec"] => {
                    live["metadata"]["generation"].as_i64().unwrap_or(1)
                }
                Some(live) => live["metadata"]["generation"].as_i64().unwrap_or(0) + 1,
                None => 1,
            };
            object["metadata"]["generation"] = json!(generation);
            state.objects.insert(path, object.clone());
            Json(object).into_response()
        }
        _ => status(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
    }
}
