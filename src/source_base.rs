//! Source Base (§4.3): the thin façade every source process implements
//! on top of its own HTTP server — identity, the uniform command
//! endpoints, and the outbound calls back to the router and UI bridge.

use crate::model::{PlayerKind, SourceRegistration, SourceState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const REGISTER_ATTEMPTS: u32 = 5;
const SHORT_TIMEOUT: Duration = Duration::from_secs(2);

/// A UI-initiated command, or a raw action translated via `action_map`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandBody {
    pub action: Option<String>,
    pub command: Option<String>,
    #[serde(flatten)]
    pub data: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub name: String,
    pub state: SourceState,
}

/// The outcome of translating a `POST /command` body: the resolved
/// high-level command name plus whatever extra data came with it.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub command: String,
    pub data: HashMap<String, Value>,
}

/// Shared identity and outbound-call machinery for a source process.
/// Concrete sources embed this and add their own playback logic; the
/// per-source HTTP handlers call into it for registration, broadcast,
/// and command translation.
pub struct SourceBase {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub player: PlayerKind,
    pub action_map: HashMap<String, String>,
    router_base_url: String,
    ui_base_url: String,
    http: reqwest::Client,
}

impl SourceBase {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        port: u16,
        player: PlayerKind,
        action_map: HashMap<String, String>,
        router_base_url: impl Into<String>,
        ui_base_url: impl Into<String>,
    ) -> Self {
        SourceBase {
            id: id.into(),
            name: name.into(),
            port,
            player,
            action_map,
            router_base_url: router_base_url.into(),
            ui_base_url: ui_base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Registers with the router. Only this call retries: 5 attempts
    /// with linear `2·n` second backoff, to survive a slow router
    /// startup. Every other outbound call in this façade is single-shot.
    pub async fn register(
        &self,
        state: SourceState,
        command_url: Option<String>,
        handles: Option<std::collections::HashSet<String>>,
        menu_preset: Option<String>,
        navigate: bool,
        auto_power: bool,
    ) {
        let reg = SourceRegistration {
            id: self.id.clone(),
            state,
            name: Some(self.name.clone()),
            command_url,
            menu_preset,
            handles,
            player: Some(self.player),
            navigate,
            auto_power,
        };
        let url = format!("{}/router/source", self.router_base_url);
        for attempt in 1..=REGISTER_ATTEMPTS {
            let result = self
                .http
                .post(&url)
                .json(&reg)
                .timeout(SHORT_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    tracing::warn!(
                        "router registration attempt {attempt} returned {}",
                        resp.status()
                    );
                }
                Err(e) => {
                    tracing::warn!("router registration attempt {attempt} failed: {e}");
                }
            }
            if attempt < REGISTER_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
            }
        }
        tracing::error!("giving up registering {} with router after {REGISTER_ATTEMPTS} attempts", self.id);
    }

    /// Broadcasts an event to the UI bridge. Single-shot, short timeout.
    pub async fn broadcast(&self, kind: &str, data: Value) {
        let url = format!("{}/router/event", self.ui_base_url);
        let body = serde_json::json!({ "type": "broadcast", "kind": kind, "data": data });
        if let Err(e) = self.http.post(&url).json(&body).timeout(SHORT_TIMEOUT).send().await {
            tracing::warn!("broadcast of {kind} failed: {e}");
        }
    }

    async fn player_call(&self, base: &str, path: &str, body: Option<Value>) -> Option<Value> {
        let url = format!("{base}{path}");
        let mut req = self.http.post(&url).timeout(SHORT_TIMEOUT);
        if let Some(body) = body {
            req = req.json(&body);
        }
        match req.send().await {
            Ok(resp) => resp.json::<Value>().await.ok(),
            Err(e) => {
                tracing::warn!("player call {path} failed: {e}");
                None
            }
        }
    }

    pub async fn player_play(&self, base: &str, payload: Value) -> Option<Value> {
        self.player_call(base, "/player/play", Some(payload)).await
    }
    pub async fn player_pause(&self, base: &str) -> Option<Value> {
        self.player_call(base, "/player/pause", None).await
    }
    pub async fn player_resume(&self, base: &str) -> Option<Value> {
        self.player_call(base, "/player/resume", None).await
    }
    pub async fn player_next(&self, base: &str) -> Option<Value> {
        self.player_call(base, "/player/next", None).await
    }
    pub async fn player_prev(&self, base: &str) -> Option<Value> {
        self.player_call(base, "/player/prev", None).await
    }
    pub async fn player_stop(&self, base: &str) -> Option<Value> {
        self.player_call(base, "/player/stop", None).await
    }

    pub async fn player_state(&self, base: &str) -> Option<Value> {
        let url = format!("{base}/player/state");
        self.http.get(&url).timeout(SHORT_TIMEOUT).send().await.ok()?.json().await.ok()
    }

    pub async fn player_capabilities(&self, base: &str) -> Vec<String> {
        let url = format!("{base}/player/capabilities");
        match self.http.get(&url).timeout(SHORT_TIMEOUT).send().await {
            Ok(resp) => resp.json::<Vec<String>>().await.unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Translates a `POST /command` body into a resolved command. Bodies
    /// carrying `command` verbatim are passed through; bodies carrying
    /// `action` are looked up in `action_map` (unknown actions pass
    /// through unchanged, so a source can still react to raw names it
    /// didn't bother mapping).
    pub fn resolve_command(&self, body: CommandBody) -> ResolvedCommand {
        if let Some(command) = body.command {
            return ResolvedCommand { command, data: body.data };
        }
        let action = body.action.unwrap_or_default();
        let command = self
            .action_map
            .get(&action)
            .cloned()
            .unwrap_or(action);
        ResolvedCommand { command, data: body.data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SourceBase {
        let mut action_map = HashMap::new();
        action_map.insert("go".to_string(), "toggle".to_string());
        action_map.insert("right".to_string(), "next".to_string());
        SourceBase::new(
            "cd",
            "CD Player",
            9301,
            PlayerKind::Local,
            action_map,
            "http://localhost:8765",
            "http://localhost:8765",
        )
    }

    #[test]
    fn command_field_passes_through_verbatim() {
        let resolved = base().resolve_command(CommandBody {
            action: None,
            command: Some("rip".to_string()),
            data: HashMap::new(),
        });
        assert_eq!(resolved.command, "rip");
    }

    #[test]
    fn action_translates_via_action_map() {
        let resolved = base().resolve_command(CommandBody {
            action: Some("go".to_string()),
            command: None,
            data: HashMap::new(),
        });
        assert_eq!(resolved.command, "toggle");
    }

    #[test]
    fn unmapped_action_passes_through_unchanged() {
        let resolved = base().resolve_command(CommandBody {
            action: Some("shuffle".to_string()),
            command: None,
            data: HashMap::new(),
        });
        assert_eq!(resolved.command, "shuffle");
    }
}
