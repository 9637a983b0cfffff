//! In-process mock HTTP server for exercising `RemoteClient` and the
//! downloader against canned responses, instead of mocking `reqwest`
//! itself.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct Route {
    /// One entry per call to this path; the last entry repeats once
    /// exhausted, so a route configured with one response behaves like an
    /// always-on stub.
    responses: Arc<Mutex<Vec<(StatusCode, serde_json::Value)>>>,
    calls: Arc<Mutex<usize>>,
    received_bodies: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[derive(Clone, Default)]
struct AppState {
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

pub struct MockServer {
    addr: std::net::SocketAddr,
    state: AppState,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = AppState::default();
        let app = Router::new().route("/*path", any(dispatch)).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockServer { addr, state, _handle: handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Every request to `path` gets `status`/`body` back.
    pub async fn respond_json(&self, path: &str, status: u16, body: serde_json::Value) {
        self.set_responses(path, vec![(StatusCode::from_u16(status).unwrap(), body)]);
    }

    /// The first `failures` requests to `path` get a 503; every request
    /// after that gets a 200 with an empty body.
    pub async fn respond_failing_then_ok(&self, path: &str, failures: usize) {
        let mut responses = vec![(StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({})); failures];
        responses.push((StatusCode::OK, serde_json::json!({})));
        self.set_responses(path, responses);
    }

    pub async fn respond_always_failing(&self, path: &str) {
        self.set_responses(path, vec![(StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({}))]);
    }

    /// JSON bodies received so far for `path`, in arrival order. Empty if
    /// the route was never configured or never called.
    pub fn received_bodies(&self, path: &str) -> Vec<serde_json::Value> {
        let routes = self.state.routes.lock().unwrap();
        routes
            .get(path.trim_start_matches('/'))
            .map(|route| route.received_bodies.lock().unwrap().clone())
            .unwrap_or_default()
    }

    fn set_responses(&self, path: &str, responses: Vec<(StatusCode, serde_json::Value)>) {
        self.state.routes.lock().unwrap().insert(
            path.trim_start_matches('/').to_owned(),
            Route {
                responses: Arc::new(Mutex::new(responses)),
                calls: Arc::new(Mutex::new(0)),
                received_bodies: Arc::new(Mutex::new(Vec::new())),
            },
        );
    }
}

async fn dispatch(State(state): State<AppState>, Path(path): Path<String>, body: Bytes) -> impl IntoResponse {
    let route = state.routes.lock().unwrap().get(&path).cloned();
    let Some(route) = route else {
        return (StatusCode::NOT_FOUND, axum::Json(serde_json::json!({"error": "unconfigured route"})));
    };
    if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) {
        route.received_bodies.lock().unwrap().push(parsed);
    }
    let mut calls = route.calls.lock().unwrap();
    let responses = route.responses.lock().unwrap();
    let index = (*calls).min(responses.len() - 1);
    *calls += 1;
    let (status, body) = responses[index].clone();
    (status, axum::Json(body))
}
