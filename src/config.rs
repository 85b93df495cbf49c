//! Configuration loading.
//!
//! Search path, in order: `<sysconfdir>/config.json`, `./config.json`,
//! `<repo>/config/default.json`. Secrets (MQTT credentials, webhook
//! tokens) stay in `BEOCONTROL_`-prefixed environment variables layered
//! on top, matching the donor crate's env-override pattern.

use serde::Deserialize;
use std::path::PathBuf;

fn sysconfdir_path() -> PathBuf {
    PathBuf::from("/etc/beocontrol/config.json")
}

fn cwd_path() -> PathBuf {
    PathBuf::from("config.json")
}

fn repo_fallback_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/default.json")
}

fn search_paths() -> Vec<PathBuf> {
    vec![sysconfdir_path(), cwd_path(), repo_fallback_path()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_name")]
    pub device: String,

    #[serde(default = "default_router_port")]
    pub router_port: u16,

    #[serde(default = "default_ui_bridge_url")]
    pub ui_bridge_url: String,

    #[serde(default)]
    pub menu: Vec<MenuConfigEntry>,

    #[serde(default)]
    pub volume: VolumeConfig,

    #[serde(default)]
    pub player: PlayerConfig,

    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// `(source_id, port)` pairs the router probes concurrently on
    /// startup via `GET /resync` (§4.2 "Startup recovery").
    #[serde(default)]
    pub sources: Vec<crate::router::SourceProbe>,

    #[serde(default)]
    pub cd: CdConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: default_device_name(),
            router_port: default_router_port(),
            ui_bridge_url: default_ui_bridge_url(),
            menu: Vec::new(),
            volume: VolumeConfig::default(),
            player: PlayerConfig::default(),
            home_assistant: HomeAssistantConfig::default(),
            transport: TransportConfig::default(),
            sources: Vec::new(),
            cd: CdConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

fn default_device_name() -> String {
    "beocontrol".into()
}

fn default_router_port() -> u16 {
    8765
}

fn default_ui_bridge_url() -> String {
    "http://localhost:8766".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdConfig {
    #[serde(default = "default_cd_port")]
    pub port: u16,
    #[serde(default = "default_cd_device_path")]
    pub device_path: String,
    #[serde(default = "default_toc_probe_binary")]
    pub toc_probe_binary: String,
    #[serde(default = "default_player_binary")]
    pub player_binary: String,
    #[serde(default = "default_metadata_base_url")]
    pub metadata_base_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_rip_root")]
    pub rip_root: String,
    #[serde(default)]
    pub airplay_sink: Option<String>,
}

impl Default for CdConfig {
    fn default() -> Self {
        CdConfig {
            port: default_cd_port(),
            device_path: default_cd_device_path(),
            toc_probe_binary: default_toc_probe_binary(),
            player_binary: default_player_binary(),
            metadata_base_url: default_metadata_base_url(),
            cache_dir: default_cache_dir(),
            rip_root: default_rip_root(),
            airplay_sink: None,
        }
    }
}

fn default_cd_port() -> u16 {
    9301
}
fn default_cd_device_path() -> String {
    "/dev/cdrom".into()
}
fn default_toc_probe_binary() -> String {
    "cd-toc-probe".into()
}
fn default_player_binary() -> String {
    "mpv".into()
}
fn default_metadata_base_url() -> String {
    "https://musicbrainz.org/ws/2/discid".into()
}
fn default_cache_dir() -> String {
    "/var/cache/beocontrol".into()
}
fn default_rip_root() -> String {
    "/mnt".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_demo_port")]
    pub port: u16,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            port: default_demo_port(),
        }
    }
}

fn default_demo_port() -> u16 {
    9401
}

/// The small closed set of fixed UI views a bare menu id may refer to,
/// as opposed to a source id (§3 "Menu"). Anything else bare resolves
/// to a source.
pub const STATIC_VIEWS: &[&str] = &["showing", "system", "scenes", "playing"];

/// A single menu config entry: either a bare id (static view or source),
/// or an object with an explicit `url` (embedded web page entry).
///
/// §6 describes menu config as an ordered mapping of display-title to
/// entry; this crate represents it as a JSON array of entries instead,
/// each carrying its own optional `title`, because the `config` crate's
/// merged value representation does not guarantee preserving
/// object-key order the way a JSON array canonically does — see
/// DESIGN.md for the resolved-open-point rationale. Order and entry
/// kind, the binding testable property, are preserved either way.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MenuConfigEntry {
    Bare(String),
    Detailed {
        id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        hidden: bool,
        #[serde(default)]
        url: Option<String>,
    },
}

impl MenuConfigEntry {
    pub fn id(&self) -> &str {
        match self {
            MenuConfigEntry::Bare(id) => id,
            MenuConfigEntry::Detailed { id, .. } => id,
        }
    }

    pub fn title(&self) -> String {
        match self {
            MenuConfigEntry::Bare(id) => id.clone(),
            MenuConfigEntry::Detailed { id, title, .. } => {
                title.clone().unwrap_or_else(|| id.clone())
            }
        }
    }

    pub fn hidden(&self) -> bool {
        match self {
            MenuConfigEntry::Bare(_) => false,
            MenuConfigEntry::Detailed { hidden, .. } => *hidden,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            MenuConfigEntry::Bare(_) => None,
            MenuConfigEntry::Detailed { url, .. } => url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    #[serde(default = "default_volume_type")]
    pub r#type: String,
    #[serde(default = "default_volume_max")]
    pub max: u8,
    #[serde(default = "default_volume_step")]
    pub step: u8,
    #[serde(default = "default_balance_step")]
    pub balance_step: i8,
    #[serde(default = "default_safety_cap")]
    pub safety_cap: u8,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            r#type: default_volume_type(),
            max: default_volume_max(),
            step: default_volume_step(),
            balance_step: default_balance_step(),
            safety_cap: default_safety_cap(),
        }
    }
}

fn default_volume_type() -> String {
    "beolab5".into()
}
fn default_volume_max() -> u8 {
    100
}
fn default_volume_step() -> u8 {
    4
}
fn default_balance_step() -> i8 {
    2
}
fn default_safety_cap() -> u8 {
    40
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerConfig {
    pub ip: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HomeAssistantConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_mode")]
    pub mode: String,
    pub mqtt_host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            mode: default_transport_mode(),
            mqtt_host: None,
            mqtt_port: default_mqtt_port(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

fn default_transport_mode() -> String {
    "webhook".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_topic_prefix() -> String {
    "beocontrol".into()
}

/// Loads configuration from the first JSON file found on the search
/// path, then layers `BEOCONTROL_`-prefixed environment variables on
/// top (e.g. `BEOCONTROL_ROUTER_PORT=9000`).
pub fn load_config() -> anyhow::Result<Config> {
    let mut builder = ::config::Config::builder();

    let mut found_any = false;
    for path in search_paths() {
        if path.exists() {
            tracing::info!("Config loaded from {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(false));
            found_any = true;
            break;
        }
    }
    if !found_any {
        tracing::warn!("No config.json found on search path — using defaults");
    }

    builder = builder.add_source(
        ::config::Environment::with_prefix("BEOCONTROL")
            .separator("_")
            .try_parsing(true),
    );

    let raw = builder.build()?;
    let config: Config = raw.try_deserialize().unwrap_or_default();
    validate(&config);
    Ok(config)
}

/// Warn about missing or suspicious config values, mirroring the
/// original deployment's config validation.
fn validate(config: &Config) {
    if config.device.is_empty() {
        tracing::warn!("config: missing 'device' name");
    }
    if config.menu.is_empty() {
        tracing::warn!("config: missing 'menu' section — UI will use fallback menu");
    }
    if config.home_assistant.webhook_url.is_none() && config.transport.mode != "bus" {
        tracing::warn!("config: missing home_assistant.webhook_url — HA webhook disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_router_port() {
        let config = Config::default();
        assert_eq!(config.router_port, 8765);
    }

    #[test]
    fn menu_entry_bare_and_detailed_both_deserialize() {
        let bare: MenuConfigEntry = serde_json::from_str("\"cd\"").unwrap_or_else(|_| {
            MenuConfigEntry::Bare("fallback".into())
        });
        assert!(matches!(bare, MenuConfigEntry::Bare(id) if id == "cd"));

        let detailed: MenuConfigEntry =
            serde_json::from_str(r#"{"id":"recipes","url":"http://x"}"#)
                .unwrap_or_else(|_| MenuConfigEntry::Bare("fallback".into()));
        assert!(matches!(detailed, MenuConfigEntry::Detailed { url: Some(_), .. }));
    }
}
