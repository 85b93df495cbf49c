//! Transport (§4.6): delivers action events to the external
//! home-automation system over a webhook, an MQTT bus, or both, and
//! accepts command callbacks from the bus side.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};

const WEBHOOK_TIMEOUT: Duration = Duration::from_millis(500);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Command callback shape, shared between the webhook dispatcher and
/// inbound bus messages (§4.7).
pub type CommandHandler = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// A per-device slug derived from the display name: lowercase,
/// non-`[a-z0-9_]` replaced with `_`, repeats collapsed, leading and
/// trailing underscores trimmed. Falls back to `"default"` if empty.
pub fn device_slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;
    for ch in name.to_lowercase().chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if prev_underscore {
                continue;
            }
            prev_underscore = true;
        } else {
            prev_underscore = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Webhook,
    Bus,
    Both,
}

impl Mode {
    fn parse(s: &str) -> Mode {
        match s {
            "bus" | "mqtt" => Mode::Bus,
            "both" => Mode::Both,
            _ => Mode::Webhook,
        }
    }

    fn use_webhook(self) -> bool {
        matches!(self, Mode::Webhook | Mode::Both)
    }

    fn use_bus(self) -> bool {
        matches!(self, Mode::Bus | Mode::Both)
    }
}

struct BusHandle {
    client: AsyncClient,
    out_topic: String,
}

/// Delivers action events to the configured home-automation channel(s)
/// and dispatches inbound commands via a registered [`CommandHandler`].
pub struct Transport {
    mode: Mode,
    webhook_url: Option<String>,
    http: reqwest::Client,
    slug: String,
    topic_prefix: String,
    mqtt_host: Option<String>,
    mqtt_port: u16,
    bus: RwLock<Option<BusHandle>>,
    handler: RwLock<Option<CommandHandler>>,
    shutdown: CancellationToken,
    mqtt_client_seq: AtomicU64,
}

impl Transport {
    pub fn new(device_name: &str, config: &crate::config::TransportConfig, webhook_url: Option<String>) -> Arc<Self> {
        Arc::new(Transport {
            mode: Mode::parse(&config.mode),
            webhook_url,
            http: reqwest::Client::new(),
            slug: device_slug(device_name),
            topic_prefix: config.topic_prefix.clone(),
            mqtt_host: config.mqtt_host.clone(),
            mqtt_port: config.mqtt_port,
            bus: RwLock::new(None),
            handler: RwLock::new(None),
            shutdown: CancellationToken::new(),
            mqtt_client_seq: AtomicU64::new(0),
        })
    }

    pub fn register_handler(&self, handler: CommandHandler) {
        // `RwLock::blocking_write` would deadlock the async runtime;
        // callers invoke this once at startup before `start()`, so a
        // best-effort try_write is sufficient here.
        if let Ok(mut guard) = self.handler.try_write() {
            *guard = Some(handler);
        }
    }

    fn out_topic(&self) -> String {
        format!("{}/{}/out", self.topic_prefix, self.slug)
    }

    fn in_topic(&self) -> String {
        format!("{}/{}/in", self.topic_prefix, self.slug)
    }

    fn status_topic(&self) -> String {
        format!("{}/{}/status", self.topic_prefix, self.slug)
    }

    /// Starts the MQTT reconnect loop if the configured mode uses the
    /// bus. No-op for webhook-only mode.
    pub fn start(self: &Arc<Self>) {
        if !self.mode.use_bus() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.mqtt_loop().await });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn mqtt_loop(self: Arc<Self>) {
        let Some(host) = self.mqtt_host.clone() else {
            tracing::warn!("bus transport enabled but no mqtt_host configured");
            return;
        };
        let mut backoff = BACKOFF_START;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.mqtt_connect_and_run(&host).await {
                Ok(()) => {
                    // Clean disconnect (shutdown requested).
                    return;
                }
                Err(e) => {
                    tracing::warn!("mqtt connection lost: {e}, retrying in {:?}", backoff);
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn mqtt_connect_and_run(self: &Arc<Self>, host: &str) -> anyhow::Result<()> {
        let seq = self.mqtt_client_seq.fetch_add(1, Ordering::SeqCst);
        let client_id = format!("beocontrol-{}-{}", self.slug, seq);
        let mut options = MqttOptions::new(client_id, host, self.mqtt_port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        let status_topic = self.status_topic();
        let offline = serde_json::json!({"status": "offline"}).to_string();
        options.set_last_will(LastWill::new(&status_topic, offline, QoS::AtLeastOnce, true));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let in_topic = self.in_topic();
        client.subscribe(&in_topic, QoS::AtLeastOnce).await?;

        {
            let mut guard = self.bus.write().await;
            *guard = Some(BusHandle {
                client: client.clone(),
                out_topic: self.out_topic(),
            });
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            tracing::info!("mqtt connected to {host}");
                            let online = serde_json::json!({"status": "online"}).to_string();
                            let _ = client
                                .publish(&status_topic, QoS::AtLeastOnce, true, online.as_bytes())
                                .await;
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            if publish.topic == in_topic {
                                self.dispatch_inbound(&publish.payload).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let mut guard = self.bus.write().await;
                            *guard = None;
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_inbound(&self, payload: &[u8]) {
        let Ok(command) = serde_json::from_slice::<Value>(payload) else {
            tracing::warn!("dropping non-JSON inbound bus message");
            return;
        };
        let handler = self.handler.read().await.clone();
        if let Some(handler) = handler {
            let _ = handler(command);
        }
    }

    /// Delivers an action event over the configured channel(s). In
    /// `both` mode the two sends are launched concurrently and awaited
    /// together; a failure on either side is logged but never
    /// propagated to the caller.
    pub async fn send_event(&self, event: &Value) {
        let webhook = async {
            if self.mode.use_webhook() {
                self.send_webhook(event).await;
            }
        };
        let bus = async {
            if self.mode.use_bus() {
                self.send_bus(event).await;
            }
        };
        tokio::join!(webhook, bus);
    }

    async fn send_webhook(&self, event: &Value) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let result = self
            .http
            .post(url)
            .json(event)
            .timeout(WEBHOOK_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("webhook delivery to {url} failed: {e}");
        }
    }

    async fn send_bus(&self, event: &Value) {
        let guard = self.bus.read().await;
        let Some(handle) = guard.as_ref() else {
            return;
        };
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("could not serialize bus event: {e}");
                return;
            }
        };
        if let Err(e) = handle
            .client
            .publish(&handle.out_topic, QoS::AtMostOnce, false, payload)
            .await
        {
            tracing::warn!("bus publish failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_lowercases_and_replaces_punctuation() {
        assert_eq!(device_slug("Living Room!!"), "living_room");
    }

    #[test]
    fn slug_collapses_repeated_separators() {
        assert_eq!(device_slug("A---B   C"), "a_b_c");
    }

    #[test]
    fn slug_trims_leading_and_trailing_underscores() {
        assert_eq!(device_slug("  Office  "), "office");
    }

    #[test]
    fn empty_name_falls_back_to_default() {
        assert_eq!(device_slug("***"), "default");
    }

    #[test]
    fn mode_parses_known_strings() {
        assert!(Mode::parse("webhook").use_webhook());
        assert!(!Mode::parse("webhook").use_bus());
        assert!(Mode::parse("bus").use_bus());
        assert!(Mode::parse("both").use_webhook());
        assert!(Mode::parse("both").use_bus());
    }
}
