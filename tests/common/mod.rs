//! Shared test support: a minimal recording HTTP server standing in for
//! the router, a source, or the UI bridge, matching the donor crate's
//! `tests/mock_servers/` pattern.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::routing::any;
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(String, String, Value)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// JSON bodies of every request received at `path`, in arrival order.
    pub async fn bodies_at(&self, path: &str) -> Vec<Value> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(_, p, _)| p == path)
            .map(|(_, _, body)| body.clone())
            .collect()
    }

    pub async fn count_at(&self, path: &str) -> usize {
        self.bodies_at(path).await.len()
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

async fn capture(State(recorder): State<Recorder>, method: Method, uri: Uri, body: Bytes) -> &'static str {
    let value = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
    recorder.calls.lock().await.push((method.to_string(), uri.path().to_string(), value));
    "{\"status\":\"ok\"}"
}

/// Builds a server that accepts any method/path and records the request,
/// always replying `200 {"status":"ok"}`.
pub fn recording_router(recorder: Recorder) -> Router {
    Router::new().fallback(any(capture)).with_state(recorder)
}

/// Spawns a [`recording_router`] on an OS-assigned port and returns its
/// base URL (`http://127.0.0.1:PORT`, no trailing slash) alongside the
/// recorder used to inspect what it received.
pub async fn spawn_recording_server() -> Option<(Recorder, String)> {
    let recorder = Recorder::new();
    let app = recording_router(recorder.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.ok()?;
    let addr = listener.local_addr().ok()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Some((recorder, format!("http://{addr}")))
}

/// Spawns a server that always replies after `delay`, ignoring the
/// request body, for exercising client-side timeouts (S6).
pub async fn spawn_slow_server(delay: std::time::Duration) -> Option<String> {
    async fn slow(
        State(delay): State<std::time::Duration>,
        _method: Method,
        _uri: Uri,
        _body: Bytes,
    ) -> &'static str {
        tokio::time::sleep(delay).await;
        "{\"status\":\"ok\"}"
    }
    let app = Router::new().fallback(any(slow)).with_state(delay);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.ok()?;
    let addr = listener.local_addr().ok()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Some(format!("http://{addr}"))
}
