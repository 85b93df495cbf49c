//! Volume adapters: the uniform 4-operation surface plus a shared
//! debounce/cached-power/safety-cap wrapper, and the concrete adapter
//! taxonomy (§4.5).

pub mod alsa;
pub mod cloud;
pub mod dac_mixer;
pub mod multizone;
pub mod passthrough;
pub mod upnp_speaker;

use async_trait::async_trait;
use std::sync::atomic::{AtomicI8, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

/// The device-specific operations a concrete adapter implements. The
/// `Common` wrapper below adds debouncing, cap enforcement, and power
/// caching uniformly on top of any implementation of this trait.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// Write a single (already clamped) volume value to the device.
    async fn write_volume(&self, value: u8);
    /// Read the device's current volume, bypassing any cache.
    async fn read_volume(&self) -> u8;
    /// Read the device's current power state, bypassing any cache.
    async fn read_power(&self) -> bool;
    async fn write_power(&self, on: bool);

    async fn write_balance(&self, _balance: i8) {}
    async fn read_balance(&self) -> i8 {
        0
    }
}

struct PowerCache {
    value: Option<bool>,
    observed_at: Instant,
}

/// Wraps any [`Device`] with the common behaviors every volume adapter
/// needs: debounced writes (latest value wins within the debounce
/// window), a hard cap with a logged warning above it, and a
/// time-to-live cache over the device's power state with a safety cap
/// applied to the volume restored on power-on.
pub struct Common<D: Device> {
    device: Arc<D>,
    max: u8,
    safety_cap: u8,
    power_cache: Mutex<PowerCache>,
    last_volume: AtomicU8,
    last_balance: AtomicI8,
    pending: watch::Sender<Option<u8>>,
}

const DEFAULT_POWER_TTL: Duration = Duration::from_secs(30);

impl<D: Device> Common<D> {
    /// `debounce` is the flush delay (50-100ms per §4.5); `max` is the
    /// adapter-configurable volume cap; `safety_cap` bounds the volume
    /// resumed on `power_on`.
    pub fn new(device: D, max: u8, safety_cap: u8, debounce: Duration) -> Arc<Self> {
        let (pending_tx, pending_rx) = watch::channel(None);
        let common = Arc::new(Common {
            device: Arc::new(device),
            max,
            safety_cap,
            power_cache: Mutex::new(PowerCache {
                value: None,
                observed_at: Instant::now() - DEFAULT_POWER_TTL,
            }),
            last_volume: AtomicU8::new(0),
            last_balance: AtomicI8::new(0),
            pending: pending_tx,
        });
        tokio::spawn(debounce_loop(common.device.clone(), pending_rx, debounce));
        common
    }

    /// Clamps to `[0, max]`, logging a warning above the cap, stashes
    /// the latest value, and lets the background debounce task flush it.
    pub fn set_volume(&self, volume: u8) {
        let capped = volume.min(self.max);
        if volume > self.max {
            tracing::warn!(
                requested = volume,
                cap = self.max,
                "volume above cap, clamped"
            );
        }
        self.last_volume.store(capped, Ordering::SeqCst);
        // A send error means the debounce task has exited; nothing to
        // recover since the process is shutting down in that case.
        let _ = self.pending.send(Some(capped));
    }

    pub async fn get_volume(&self) -> u8 {
        self.device.read_volume().await
    }

    /// Last value this adapter was asked to set, without touching the
    /// device. The router's routing algorithm (§4.1 steps 3-4) computes
    /// `new = clamp(current ± step, ...)` off this value so that a burst
    /// of repeat button presses advances deterministically even while a
    /// debounce flush is still pending.
    pub fn current_volume_cached(&self) -> u8 {
        self.last_volume.load(Ordering::SeqCst)
    }

    pub fn current_balance_cached(&self) -> i8 {
        self.last_balance.load(Ordering::SeqCst)
    }

    pub fn is_on_cached(&self) -> Option<bool> {
        // `try_lock` rather than an await: callers of the cached read
        // must never block on I/O or on one another.
        self.power_cache.try_lock().ok().and_then(|g| g.value)
    }

    pub async fn is_on(&self) -> bool {
        {
            let guard = self.power_cache.lock().await;
            if let Some(value) = guard.value {
                if guard.observed_at.elapsed() < DEFAULT_POWER_TTL {
                    return value;
                }
            }
        }
        let value = self.device.read_power().await;
        let mut guard = self.power_cache.lock().await;
        guard.value = Some(value);
        guard.observed_at = Instant::now();
        value
    }

    pub async fn power_on(&self) {
        self.device.write_power(true).await;
        {
            let mut guard = self.power_cache.lock().await;
            guard.value = Some(true);
            guard.observed_at = Instant::now();
        }
        let safe = self.last_volume.load(Ordering::SeqCst).min(self.safety_cap);
        if safe > 0 {
            self.set_volume(safe);
        }
    }

    pub async fn power_off(&self) {
        self.device.write_power(false).await;
        let mut guard = self.power_cache.lock().await;
        guard.value = Some(false);
        guard.observed_at = Instant::now();
    }

    pub async fn set_balance(&self, balance: i8) {
        let clamped = balance.clamp(-20, 20);
        self.last_balance.store(clamped, Ordering::SeqCst);
        self.device.write_balance(clamped).await;
    }

    pub async fn get_balance(&self) -> i8 {
        self.device.read_balance().await
    }
}

/// Background debounce task: wakes on every new pending value, resets
/// its sleep each time (classic debounce, not throttle — a burst of
/// calls yields exactly one write, of the final value, once calls stop
/// arriving for `debounce`).
async fn debounce_loop<D: Device>(
    device: Arc<D>,
    mut pending: watch::Receiver<Option<u8>>,
    debounce: Duration,
) {
    loop {
        if pending.changed().await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => break,
                changed = pending.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
        let value = *pending.borrow();
        if let Some(value) = value {
            device.write_volume(value).await;
        }
    }
}

/// Object-safe façade over [`Common<D>`] so the router can hold exactly
/// one volume output behind `Arc<dyn VolumeOutput>` regardless of which
/// taxonomy row backs it (§4.5: "Selection is driven by configuration").
#[async_trait]
pub trait VolumeOutput: Send + Sync {
    fn set_volume(&self, value: u8);
    async fn get_volume(&self) -> u8;
    fn current_volume_cached(&self) -> u8;
    fn current_balance_cached(&self) -> i8;
    fn is_on_cached(&self) -> Option<bool>;
    async fn is_on(&self) -> bool;
    async fn power_on(&self);
    async fn power_off(&self);
    async fn set_balance(&self, balance: i8);
    async fn get_balance(&self) -> i8;
}

#[async_trait]
impl<D: Device> VolumeOutput for Common<D> {
    fn set_volume(&self, value: u8) {
        Common::set_volume(self, value)
    }
    async fn get_volume(&self) -> u8 {
        Common::get_volume(self).await
    }
    fn current_volume_cached(&self) -> u8 {
        Common::current_volume_cached(self)
    }
    fn current_balance_cached(&self) -> i8 {
        Common::current_balance_cached(self)
    }
    fn is_on_cached(&self) -> Option<bool> {
        Common::is_on_cached(self)
    }
    async fn is_on(&self) -> bool {
        Common::is_on(self).await
    }
    async fn power_on(&self) {
        Common::power_on(self).await
    }
    async fn power_off(&self) {
        Common::power_off(self).await
    }
    async fn set_balance(&self, balance: i8) {
        Common::set_balance(self, balance).await
    }
    async fn get_balance(&self) -> i8 {
        Common::get_balance(self).await
    }
}

/// Builds the configured volume output. Defaults follow the player
/// kind when `volume.type` selects a player-coupled row (cloud/UPnP);
/// otherwise falls back to `beolab5` (DAC-mixer), matching the original
/// adapter factory's defaulting rule.
pub fn build(volume: &crate::config::VolumeConfig, player: &crate::config::PlayerConfig) -> Arc<dyn VolumeOutput> {
    let debounce = Duration::from_millis(75);
    match volume.r#type.as_str() {
        "c4amp" => Arc::new(Common::new(
            multizone::MultiZoneAmp::new(
                player.host.as_deref().unwrap_or("127.0.0.1"),
                "01",
                "01",
            ),
            volume.max,
            volume.safety_cap,
            debounce,
        )),
        "rca" | "hdmi" | "spdif" => Arc::new(Common::new(
            alsa::AlsaMixer::new("sndrpihifiberry", "Digital"),
            volume.max,
            volume.safety_cap,
            debounce,
        )),
        "upnp" => Arc::new(Common::new(
            upnp_speaker::UpnpSpeaker::new(player.host.clone().unwrap_or_default()),
            volume.max,
            volume.safety_cap,
            debounce,
        )),
        "sonos" | "bluesound" => Arc::new(Common::new(
            cloud::CloudSpeaker::new(format!(
                "http://{}",
                player.ip.clone().unwrap_or_default()
            )),
            volume.max,
            volume.safety_cap,
            debounce,
        )),
        "none" | "passthrough" => Arc::new(Common::new(
            passthrough::Passthrough::new(),
            volume.max,
            volume.safety_cap,
            debounce,
        )),
        _ => Arc::new(Common::new(
            dac_mixer::DacMixer::new(player.ip.as_deref().unwrap_or("127.0.0.1")),
            volume.max,
            volume.safety_cap,
            debounce,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingDevice {
        writes: Arc<Mutex<Vec<u8>>>,
        power: AtomicUsize,
    }

    #[async_trait]
    impl Device for CountingDevice {
        async fn write_volume(&self, value: u8) {
            self.writes.lock().await.push(value);
        }
        async fn read_volume(&self) -> u8 {
            self.writes.lock().await.last().copied().unwrap_or(0)
        }
        async fn read_power(&self) -> bool {
            self.power.load(Ordering::SeqCst) > 0
        }
        async fn write_power(&self, on: bool) {
            self.power.store(on as usize, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn debounced_burst_writes_only_latest_value_once() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let device = CountingDevice {
            writes: writes.clone(),
            power: AtomicUsize::new(0),
        };
        let common = Common::new(device, 100, 40, Duration::from_millis(30));

        common.set_volume(10);
        common.set_volume(20);
        common.set_volume(35);

        tokio::time::sleep(Duration::from_millis(120)).await;

        let recorded = writes.lock().await.clone();
        assert_eq!(recorded, vec![35]);
    }

    #[tokio::test]
    async fn volume_above_cap_is_clamped() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let device = CountingDevice {
            writes: writes.clone(),
            power: AtomicUsize::new(0),
        };
        let common = Common::new(device, 70, 40, Duration::from_millis(20));
        common.set_volume(95);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let recorded = writes.lock().await.clone();
        assert_eq!(recorded, vec![70]);
    }

    #[tokio::test]
    async fn power_on_applies_safety_cap_to_resumed_volume() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let device = CountingDevice {
            writes: writes.clone(),
            power: AtomicUsize::new(0),
        };
        let common = Common::new(device, 100, 40, Duration::from_millis(20));
        common.set_volume(90);
        tokio::time::sleep(Duration::from_millis(60)).await;
        common.power_on().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let recorded = writes.lock().await.clone();
        assert_eq!(recorded, vec![90, 40]);
    }

    #[tokio::test]
    async fn is_on_cached_never_blocks_on_io() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let device = CountingDevice {
            writes,
            power: AtomicUsize::new(0),
        };
        let common = Common::new(device, 100, 40, Duration::from_millis(20));
        assert_eq!(common.is_on_cached(), None);
        common.power_on().await;
        assert_eq!(common.is_on_cached(), Some(true));
    }
}
