//! Shared data model: action events, sources, menu entries, volume state.
//!
//! See §3 of the design: these types are the authoritative wire shapes
//! exchanged between the router and its neighbors.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The origin of an action event: which physical input it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOrigin {
    Ir,
    Bluetooth,
    Wheel,
}

/// `device_type=Audio` routes playback; other modes forward to the
/// external automation system untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Audio,
    Video,
    Light,
    All,
}

/// A normalized action event produced by an input collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEvent {
    pub source: ActionOrigin,
    pub action: String,
    pub device_type: DeviceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Lifecycle state of a registered source. At most one source is in
/// `Playing` or `Paused` at a time (the active source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Gone,
    Available,
    Playing,
    Paused,
}

impl SourceState {
    pub fn is_active_capable(self) -> bool {
        matches!(self, SourceState::Playing | SourceState::Paused)
    }
}

/// Whether a source drives a local in-process player or delegates
/// playback to an external player process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerKind {
    Local,
    Remote,
}

/// Registration payload sent by a source to `POST /router/source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistration {
    pub id: String,
    pub state: SourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub menu_preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handles: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerKind>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub navigate: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_power: bool,
}

/// A source known to the registry: the registration fields plus the
/// bookkeeping the registry itself owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub state: SourceState,
    pub command_url: Option<String>,
    pub menu_preset: Option<String>,
    pub handles: HashSet<String>,
    pub player: PlayerKind,
    pub from_config: bool,
    pub initial_hidden: bool,
}

impl Source {
    pub fn visible(&self) -> bool {
        if self.state == SourceState::Gone {
            return false;
        }
        !(self.from_config && self.initial_hidden)
    }
}

/// A single menu entry as parsed from configuration or contributed by a
/// source registering ad-hoc.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MenuEntryKind {
    /// A fixed identifier in a small closed set (`showing`, `system`, ...).
    StaticView,
    /// An embedded web page entry.
    WebPage { url: String },
    /// A reference to a registered or configured source.
    Source,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuEntry {
    pub id: String,
    pub title: String,
    pub kind: MenuEntryKind,
    pub hidden: bool,
    pub from_config: bool,
}

/// Current router-owned volume state, as returned by `/router/status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeState {
    pub volume: u8,
    pub balance: i8,
}

impl Default for VolumeState {
    fn default() -> Self {
        VolumeState {
            volume: 0,
            balance: 0,
        }
    }
}

/// A track entry in CD metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdTrack {
    pub num: u32,
    pub title: String,
    pub duration: String,
}

/// An alternative release a user may switch metadata to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdAlternative {
    pub release_id: String,
    pub artist: String,
    pub title: String,
    pub year: String,
}

/// CD playback state exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdPlaybackState {
    Stopped,
    Playing,
    Paused,
}
