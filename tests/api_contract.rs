//! End-to-end router contract tests for the seed scenarios in
//! spec §8 (S1, S3, S4, S6) that can be driven through the router's
//! own `route_event` entry point against a recording stand-in source.

mod common;

use beocontrol::bus::create_bus;
use beocontrol::config::TransportConfig;
use beocontrol::model::{ActionEvent, ActionOrigin, DeviceType, SourceRegistration, SourceState};
use beocontrol::registry;
use beocontrol::router::{route_event, RouterState};
use beocontrol::sources::cd::{CdSource, CdSourceConfig, FilesystemDrive, NoopAudioOutputs};
use beocontrol::transport::Transport;
use beocontrol::volume::passthrough::Passthrough;
use beocontrol::volume::Common;
use common::{spawn_recording_server, spawn_slow_server};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn test_router_state(volume_max: u8, volume_step: u8) -> Arc<RouterState> {
    let bus = create_bus();
    let volume = Common::new(Passthrough::new(), volume_max, 40, Duration::from_millis(5));
    let registry = registry::spawn(bus.clone(), Vec::new(), volume.clone());
    let transport_config = TransportConfig {
        mode: "webhook".into(),
        mqtt_host: None,
        mqtt_port: 1883,
        topic_prefix: "test".into(),
    };
    let transport = Transport::new("Test Device", &transport_config, None);
    RouterState::new(registry, volume, transport, bus, volume_step, 2, HashSet::new())
}

fn event(action: &str, device_type: DeviceType) -> ActionEvent {
    ActionEvent {
        source: ActionOrigin::Ir,
        action: action.to_string(),
        device_type,
        count: None,
        link: None,
    }
}

/// S1 — Audio forwarding: an active source handling the action gets
/// exactly the original payload, and volume is left untouched.
#[tokio::test]
async fn s1_audio_forwarding_to_active_source() {
    let Some((recorder, base_url)) = spawn_recording_server().await else {
        return;
    };
    let state = test_router_state(100, 4);
    state.volume.set_volume(55);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let volume_before = state.volume.current_volume_cached();

    state
        .registry
        .register(SourceRegistration {
            id: "cd".to_string(),
            state: SourceState::Playing,
            name: Some("CD".to_string()),
            command_url: Some(format!("{base_url}/command")),
            menu_preset: None,
            handles: Some(HashSet::from(["next".to_string()])),
            player: Some(beocontrol::model::PlayerKind::Local),
            navigate: false,
            auto_power: false,
        })
        .await;

    route_event(&state, event("next", DeviceType::Audio)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = recorder.bodies_at("/command").await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].get("action").and_then(|v| v.as_str()), Some("next"));
    assert_eq!(state.volume.current_volume_cached(), volume_before);
}

/// S3 — Volume clamp and step: stepping up from 68 with step=3, max=70
/// lands exactly on the cap, and a second identical step is a no-op.
#[tokio::test]
async fn s3_volume_clamps_at_configured_max() {
    let state = test_router_state(70, 3);
    state.volume.set_volume(68);
    tokio::time::sleep(Duration::from_millis(30)).await;

    route_event(&state, event("volup", DeviceType::Audio)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(state.volume.current_volume_cached(), 70);

    route_event(&state, event("volup", DeviceType::Audio)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(state.volume.current_volume_cached(), 70);
}

/// S4 — Routed digit to source: the router forwards a bare digit
/// verbatim to the active source (step 1 of the routing algorithm), and
/// the CD source's own `action_map` override resolves that digit into a
/// `play_track` command carrying the right track number.
#[tokio::test]
async fn s4_routed_digit_reaches_source_and_resolves_to_play_track() {
    let Some((recorder, base_url)) = spawn_recording_server().await else {
        return;
    };
    let state = test_router_state(100, 4);

    state
        .registry
        .register(SourceRegistration {
            id: "cd".to_string(),
            state: SourceState::Playing,
            name: Some("CD".to_string()),
            command_url: Some(format!("{base_url}/command")),
            menu_preset: None,
            handles: Some(HashSet::from(["5".to_string()])),
            player: Some(beocontrol::model::PlayerKind::Local),
            navigate: false,
            auto_power: false,
        })
        .await;

    route_event(&state, event("5", DeviceType::Audio)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = recorder.bodies_at("/command").await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].get("action").and_then(|v| v.as_str()), Some("5"));

    let drive = Arc::new(FilesystemDrive::new("/dev/nonexistent-cdrom", "cd-toc-probe"));
    let metadata = Arc::new(NullMetadata);
    let source = CdSource::new(
        CdSourceConfig {
            router_base_url: base_url.clone(),
            ui_base_url: base_url,
            port: 0,
            player_binary: "mpv".to_string(),
            cache_dir: std::env::temp_dir(),
            rip_root: std::env::temp_dir(),
        },
        drive,
        metadata,
        Arc::new(NoopAudioOutputs),
    );
    let resolved = source.resolve(beocontrol::source_base::CommandBody {
        action: Some("5".to_string()),
        command: None,
        data: std::collections::HashMap::new(),
    });
    let resolved = resolved.await;
    assert_eq!(resolved.command, "play_track");
    assert_eq!(resolved.data.get("track").and_then(|v| v.as_u64()), Some(5));
}

struct NullMetadata;

#[async_trait::async_trait]
impl beocontrol::sources::cd::MetadataProvider for NullMetadata {
    async fn lookup(&self, _disc_id: &str) -> Vec<beocontrol::sources::cd::ReleaseMetadata> {
        Vec::new()
    }
}

/// S6 — transport both-mode: a webhook that never responds inside its
/// 500 ms timeout must not hold up delivery as a whole; `send_event`
/// returns close to the webhook timeout rather than waiting out a
/// slower channel or hanging indefinitely.
#[tokio::test]
async fn s6_webhook_timeout_does_not_block_event_delivery() {
    let Some(slow_url) = spawn_slow_server(Duration::from_secs(5)).await else {
        return;
    };

    let transport_config = TransportConfig {
        mode: "both".into(),
        mqtt_host: None,
        mqtt_port: 1883,
        topic_prefix: "test".into(),
    };
    let transport = Transport::new("Living Room", &transport_config, Some(slow_url));

    let started = std::time::Instant::now();
    transport
        .send_event(&serde_json::json!({"action": "play", "device_type": "All"}))
        .await;
    let elapsed = started.elapsed();

    // The webhook's own 500ms timeout bounds this, not the server's
    // 5s reply delay; the absent bus connection in this unit-level
    // test is a no-op rather than a second blocking wait.
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}
