//! Demo source: a minimal source with no player, exercising
//! `SourceBase` as a library surface on its own (§2: "CD, cloud music,
//! file browser, news, demo…" — the distilled spec names this kind but
//! does not include its source file; kept deliberately tiny).

use crate::model::{PlayerKind, SourceState};
use crate::source_base::{CommandBody, SourceBase};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Toggles between `playing` and `available` on `toggle`, and answers
/// `next`/`prev` with a broadcast so the UI has something to show. No
/// backend of its own — this source demonstrates the façade, not a
/// real content producer.
pub struct DemoSource {
    base: SourceBase,
    playing: AtomicBool,
    track: std::sync::atomic::AtomicU32,
}

impl DemoSource {
    pub fn new(port: u16, router_base_url: impl Into<String>, ui_base_url: impl Into<String>) -> Arc<Self> {
        let mut action_map = HashMap::new();
        action_map.insert("go".to_string(), "toggle".to_string());
        action_map.insert("right".to_string(), "next".to_string());
        action_map.insert("left".to_string(), "prev".to_string());
        Arc::new(DemoSource {
            base: SourceBase::new(
                "demo",
                "Demo",
                port,
                PlayerKind::Remote,
                action_map,
                router_base_url,
                ui_base_url,
            ),
            playing: AtomicBool::new(false),
            track: std::sync::atomic::AtomicU32::new(1),
        })
    }

    pub async fn register_initial(&self) {
        self.base
            .register(SourceState::Available, None, None, Some("demo".to_string()), false, false)
            .await;
    }

    async fn handle(&self, resolved_command: &str) -> Value {
        match resolved_command {
            "toggle" => {
                let now_playing = !self.playing.fetch_xor(true, Ordering::SeqCst);
                let state = if now_playing {
                    SourceState::Playing
                } else {
                    SourceState::Available
                };
                let command_url = Some(format!("http://localhost:{}/command", self.base.port));
                self.base
                    .register(state, command_url, Some(["stop"].into_iter().map(String::from).collect()), None, false, false)
                    .await;
                self.base
                    .broadcast("demo_update", serde_json::json!({ "playing": now_playing }))
                    .await;
                serde_json::json!({ "status": "ok", "playing": now_playing })
            }
            "next" => {
                let track = self.track.fetch_add(1, Ordering::SeqCst) + 1;
                self.base
                    .broadcast("demo_update", serde_json::json!({ "track": track }))
                    .await;
                serde_json::json!({ "status": "ok", "track": track })
            }
            "prev" => {
                let track = self.track.fetch_sub(1, Ordering::SeqCst).max(1);
                self.base
                    .broadcast("demo_update", serde_json::json!({ "track": track }))
                    .await;
                serde_json::json!({ "status": "ok", "track": track })
            }
            "stop" => {
                self.playing.store(false, Ordering::SeqCst);
                self.base
                    .register(SourceState::Available, None, None, None, false, false)
                    .await;
                serde_json::json!({ "status": "ok" })
            }
            other => serde_json::json!({ "status": "error", "message": format!("unknown command {other}") }),
        }
    }
}

pub fn build_router(source: Arc<DemoSource>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/command", post(post_command))
        .route("/resync", get(get_resync))
        .with_state(source)
}

async fn get_status(State(source): State<Arc<DemoSource>>) -> Json<Value> {
    Json(serde_json::json!({
        "id": source.base.id,
        "name": source.base.name,
        "playing": source.playing.load(Ordering::SeqCst),
    }))
}

async fn post_command(State(source): State<Arc<DemoSource>>, Json(body): Json<CommandBody>) -> Json<Value> {
    let resolved = source.base.resolve_command(body);
    Json(source.handle(&resolved.command).await)
}

async fn get_resync(State(source): State<Arc<DemoSource>>) -> StatusCode {
    let state = if source.playing.load(Ordering::SeqCst) {
        SourceState::Playing
    } else {
        SourceState::Available
    };
    let command_url = Some(format!("http://localhost:{}/command", source.base.port));
    source.base.register(state, command_url, None, None, false, false).await;
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toggle_flips_playing_state() {
        let source = DemoSource::new(9401, "http://localhost:0", "http://localhost:0");
        let result = source.handle("toggle").await;
        assert_eq!(result["playing"], true);
        let result = source.handle("toggle").await;
        assert_eq!(result["playing"], false);
    }

    #[tokio::test]
    async fn prev_does_not_go_below_track_one() {
        let source = DemoSource::new(9402, "http://localhost:0", "http://localhost:0");
        let result = source.handle("prev").await;
        assert_eq!(result["track"], 1);
    }
}
