//! Player Base (§4.4): the uniform HTTP + WebSocket façade a concrete
//! playback device embeds. This crate's only concrete player is the CD
//! source's own `mpv`-driven playback engine (§4.8 calls it a "local"
//! player), so `PlayerBase` is a library surface the CD binary composes
//! directly rather than a standalone player process.

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ImageEncoder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const ARTWORK_CACHE_CAPACITY: usize = 100;
const ARTWORK_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const JPEG_QUALITY_PRIMARY: u8 = 85;
const JPEG_QUALITY_FALLBACK: u8 = 60;
const JPEG_SIZE_CEILING: usize = 500 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A cached artwork payload: base64-encoded JPEG bytes plus dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtworkPayload {
    pub base64: String,
    pub width: u32,
    pub height: u32,
}

/// A WebSocket frame pushed to every connected client (§6: "server-push
/// only, client messages ignored").
#[derive(Debug, Clone, Serialize)]
pub struct MediaUpdate {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub reason: String,
    pub data: serde_json::Value,
}

impl MediaUpdate {
    pub fn new(reason: impl Into<String>, data: serde_json::Value) -> Self {
        MediaUpdate {
            frame_type: "media_update",
            reason: reason.into(),
            data,
        }
    }
}

/// Simple move-to-front LRU keyed by artwork URL. Decode/compress is
/// never run while this lock is held — callers fetch and encode first,
/// then call `put`.
struct ArtworkCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, ArtworkPayload>,
}

impl ArtworkCache {
    fn new(capacity: usize) -> Self {
        ArtworkCache {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<ArtworkPayload> {
        if let Some(value) = self.entries.get(key).cloned() {
            self.touch(key);
            Some(value)
        } else {
            None
        }
    }

    fn put(&mut self, key: String, value: ArtworkPayload) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key.clone());
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
        self.touch(&key);
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/// Decodes and re-encodes artwork off the event loop (§4.4: "Image
/// decoding runs in a worker pool, not on the event loop"). Tries
/// quality 85 first; falls back to quality 60 if the result exceeds
/// the 500 KiB ceiling.
fn decode_and_compress(bytes: Vec<u8>) -> Result<ArtworkPayload, image::ImageError> {
    let img = image::load_from_memory(&bytes)?;
    let (width, height) = (img.width(), img.height());
    let rgb = img.to_rgb8();

    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY_PRIMARY).write_image(
        rgb.as_raw(),
        width,
        height,
        image::ExtendedColorType::Rgb8,
    )?;

    if buf.len() > JPEG_SIZE_CEILING {
        buf.clear();
        JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY_FALLBACK).write_image(
            rgb.as_raw(),
            width,
            height,
            image::ExtendedColorType::Rgb8,
        )?;
    }

    Ok(ArtworkPayload {
        base64: base64::engine::general_purpose::STANDARD.encode(&buf),
        width,
        height,
    })
}

/// Shared machinery every player process embeds: artwork cache, the
/// media-update WebSocket feed, volume echo suppression, and the
/// (currently stubbed, §9 open question 1) playback-override notifier.
pub struct PlayerBase {
    artwork: Mutex<ArtworkCache>,
    media_tx: broadcast::Sender<MediaUpdate>,
    last_reported_volume: AtomicU32,
    capabilities: Vec<String>,
    http: reqwest::Client,
    router_base_url: String,
}

const NO_VOLUME_REPORTED: u32 = u32::MAX;

impl PlayerBase {
    pub fn new(capabilities: Vec<String>, router_base_url: impl Into<String>) -> Arc<Self> {
        let (media_tx, _rx) = broadcast::channel(64);
        Arc::new(PlayerBase {
            artwork: Mutex::new(ArtworkCache::new(ARTWORK_CACHE_CAPACITY)),
            media_tx,
            last_reported_volume: AtomicU32::new(NO_VOLUME_REPORTED),
            capabilities,
            http: reqwest::Client::new(),
            router_base_url: router_base_url.into(),
        })
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaUpdate> {
        self.media_tx.subscribe()
    }

    /// Pushes a `media_update` frame to every connected WS client. A
    /// publish with zero subscribers is not an error.
    pub fn push_media_update(&self, reason: impl Into<String>, data: serde_json::Value) {
        let _ = self.media_tx.send(MediaUpdate::new(reason, data));
    }

    /// Returns the cached artwork for `url`, fetching and re-encoding on
    /// a cache miss. Fetch failures return `None` rather than an error:
    /// missing artwork is not fatal to playback.
    pub async fn get_or_fetch_artwork(&self, url: &str) -> Option<ArtworkPayload> {
        if let Some(cached) = self.artwork.lock().await.get(url) {
            return Some(cached);
        }
        let bytes = match self
            .http
            .get(url)
            .timeout(ARTWORK_FETCH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => match resp.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    tracing::warn!("artwork fetch from {url} failed reading body: {e}");
                    return None;
                }
            },
            Err(e) => {
                tracing::warn!("artwork fetch from {url} failed: {e}");
                return None;
            }
        };
        let payload = match tokio::task::spawn_blocking(move || decode_and_compress(bytes)).await
        {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                tracing::warn!("artwork decode for {url} failed: {e}");
                return None;
            }
            Err(e) => {
                tracing::warn!("artwork decode task panicked for {url}: {e}");
                return None;
            }
        };
        self.artwork
            .lock()
            .await
            .put(url.to_string(), payload.clone());
        Some(payload)
    }

    /// Reports an observed volume to the router, skipping the call
    /// entirely if it matches the last value this player reported
    /// (§4.4: "skips if `v == last_reported`" — the volume adapter is
    /// the source of truth, this is purely an echo-suppression guard
    /// against the router's own write bouncing back as an observation).
    pub async fn report_volume_to_router(&self, volume: u8) {
        let previous = self
            .last_reported_volume
            .swap(volume as u32, Ordering::SeqCst);
        if previous == volume as u32 {
            return;
        }
        let url = format!("{}/router/volume/report", self.router_base_url);
        let body = serde_json::json!({ "volume": volume });
        if let Err(e) = self
            .http
            .post(&url)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            tracing::warn!("volume report to router failed: {e}");
        }
    }

    /// Notifies the router that an external playback change was
    /// observed on this device. Per §9 open question 1 the router side
    /// of this is a stub that always replies `cleared:false`; this
    /// method still performs the call so the wiring exists for when
    /// that product decision is made.
    pub async fn notify_playback_override(&self) -> bool {
        let url = format!("{}/router/playback_override", self.router_base_url);
        match self
            .http
            .post(&url)
            .json(&serde_json::json!({}))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("cleared").and_then(|c| c.as_bool()))
                .unwrap_or(false),
            Err(e) => {
                tracing::warn!("playback_override notification failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut cache = ArtworkCache::new(2);
        cache.put(
            "a".into(),
            ArtworkPayload {
                base64: "A".into(),
                width: 1,
                height: 1,
            },
        );
        cache.put(
            "b".into(),
            ArtworkPayload {
                base64: "B".into(),
                width: 1,
                height: 1,
            },
        );
        // touch "a" so "b" becomes the least recently used
        assert!(cache.get("a").is_some());
        cache.put(
            "c".into(),
            ArtworkPayload {
                base64: "C".into(),
                width: 1,
                height: 1,
            },
        );
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn volume_echo_suppressed_when_unchanged() {
        let base = PlayerBase::new(vec!["url_stream".into()], "http://localhost:1");
        // First report always proceeds (previous sentinel differs); the
        // second identical report is suppressed purely by the atomic
        // swap already having updated to the same value.
        base.report_volume_to_router(40).await;
        base.report_volume_to_router(40).await;
        assert_eq!(
            base.last_reported_volume.load(Ordering::SeqCst),
            40u32
        );
    }

    #[test]
    fn capabilities_are_exposed_verbatim() {
        let base = PlayerBase::new(vec!["spotify".into(), "url_stream".into()], "http://x");
        assert_eq!(base.capabilities(), &["spotify", "url_stream"]);
    }
}
