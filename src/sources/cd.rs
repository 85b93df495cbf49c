//! CD Source (§4.8): the paradigmatic complex source. Watches an
//! optical drive, fetches metadata, plays audio gaplessly with chapter
//! seeking, and supports shuffle, repeat, TTS announcement, and rip.

use crate::model::{CdPlaybackState, CdTrack, PlayerKind, SourceState};
use crate::player_base::PlayerBase;
use crate::source_base::{CommandBody, ResolvedCommand, SourceBase};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const STARTUP_GRACE: Duration = Duration::from_secs(6);
const PAUSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FRAMES_PER_SECOND: u32 = 75;
const RIP_MOUNT_CACHE_TTL: Duration = Duration::from_secs(30);
const FADE_STEPS: u8 = 10;
const FADE_DOWN_DURATION: Duration = Duration::from_millis(500);
const FADE_UP_DURATION: Duration = Duration::from_millis(800);

// ---------------------------------------------------------------------
// Drive access
// ---------------------------------------------------------------------

/// One track's absolute starting frame offset (75 frames/sec), as read
/// from the disc's table of contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    pub track: u32,
    pub frame_offset: u32,
}

/// Abstracts optical-drive access so the drive watcher and disc-id
/// computation are testable without real hardware.
#[async_trait]
pub trait DriveIo: Send + Sync {
    async fn drive_connected(&self) -> bool;
    /// `None` when no disc is present or the TOC is unreadable (audio
    /// CDs are unreadable with plain block I/O; a dedicated TOC probe
    /// is used instead, per §4.8).
    async fn read_toc(&self) -> Option<(Vec<TocEntry>, u32)>;
}

/// Filesystem-backed drive reader. Absence of the device node means
/// "not connected"; a failing TOC probe means "no disc".
pub struct FilesystemDrive {
    device_path: PathBuf,
    toc_probe_binary: String,
}

impl FilesystemDrive {
    pub fn new(device_path: impl Into<PathBuf>, toc_probe_binary: impl Into<String>) -> Self {
        FilesystemDrive {
            device_path: device_path.into(),
            toc_probe_binary: toc_probe_binary.into(),
        }
    }
}

#[async_trait]
impl DriveIo for FilesystemDrive {
    async fn drive_connected(&self) -> bool {
        tokio::fs::metadata(&self.device_path).await.is_ok()
    }

    async fn read_toc(&self) -> Option<(Vec<TocEntry>, u32)> {
        let output = Command::new(&self.toc_probe_binary)
            .arg(&self.device_path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_normalized_toc(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses the TOC probe helper's normalized output: one
/// `track <n> lba <frames>` line per track, then a trailing
/// `leadout lba <frames>` line.
fn parse_normalized_toc(text: &str) -> Option<(Vec<TocEntry>, u32)> {
    let mut entries = Vec::new();
    let mut leadout = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("track ") {
            let mut parts = rest.split_whitespace();
            let track: u32 = parts.next()?.parse().ok()?;
            if parts.next()? != "lba" {
                continue;
            }
            let frame_offset: u32 = parts.next()?.parse().ok()?;
            entries.push(TocEntry { track, frame_offset });
        } else if let Some(rest) = line.strip_prefix("leadout lba ") {
            leadout = rest.trim().parse().ok();
        }
    }
    if entries.is_empty() {
        return None;
    }
    Some((entries, leadout.unwrap_or(0)))
}

fn cddb_digit_sum(mut n: u32) -> u32 {
    let mut sum = 0;
    while n > 0 {
        sum += n % 10;
        n /= 10;
    }
    sum
}

/// The canonical (freedb-style) disc identifier computed from the TOC:
/// a checksum over each track's start-second-plus-pregap, folded with
/// the disc's total playing time and track count.
pub fn compute_disc_id(toc: &[TocEntry], leadout_frame: u32) -> String {
    if toc.is_empty() {
        return "00000000".to_string();
    }
    let checksum: u32 = toc
        .iter()
        .map(|e| cddb_digit_sum(e.frame_offset / FRAMES_PER_SECOND + 2))
        .sum();
    let first_offset_sec = toc[0].frame_offset / FRAMES_PER_SECOND;
    let total_time = (leadout_frame / FRAMES_PER_SECOND).saturating_sub(first_offset_sec);
    let n = toc.len() as u32;
    let value = ((checksum % 255) << 24) | (total_time << 8) | n;
    format!("{value:08x}")
}

fn generic_tracks_from_toc(toc: &[TocEntry], leadout: u32) -> Vec<CdTrack> {
    toc.iter()
        .enumerate()
        .map(|(i, entry)| {
            let next_offset = toc.get(i + 1).map(|e| e.frame_offset).unwrap_or(leadout);
            let duration_secs = next_offset.saturating_sub(entry.frame_offset) / FRAMES_PER_SECOND;
            CdTrack {
                num: entry.track,
                title: format!("Track {}", entry.track),
                duration: format!("{}:{:02}", duration_secs / 60, duration_secs % 60),
            }
        })
        .collect()
}

/// Writes an OGM-style chapters file with absolute disc offsets, used
/// by the playback engine to seek between tracks without restarting
/// the subprocess (§4.8 step 1).
pub fn write_chapters_file(path: &Path, tracks: &[CdTrack], toc: &[TocEntry]) -> std::io::Result<()> {
    let mut content = String::new();
    for (i, entry) in toc.iter().enumerate() {
        let offset_secs = entry.frame_offset / FRAMES_PER_SECOND;
        let h = offset_secs / 3600;
        let m = (offset_secs % 3600) / 60;
        let s = offset_secs % 60;
        let title = tracks
            .get(i)
            .map(|t| t.title.clone())
            .unwrap_or_else(|| format!("Track {}", entry.track));
        content.push_str(&format!("CHAPTER{:02}={h:02}:{m:02}:{s:02}.000\n", i + 1));
        content.push_str(&format!("CHAPTER{:02}NAME={title}\n", i + 1));
    }
    std::fs::write(path, content)
}

// ---------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReleaseMetadata {
    pub release_id: String,
    pub title: String,
    pub artist: String,
    pub year: String,
    pub tracks: Vec<CdTrack>,
    pub front_art_url: Option<String>,
    pub back_art_url: Option<String>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Releases matching `disc_id`, most likely match first. Empty on
    /// no match or lookup failure — callers fall back to generic
    /// "Track N" entries from the TOC.
    async fn lookup(&self, disc_id: &str) -> Vec<ReleaseMetadata>;
}

pub struct HttpMetadataProvider {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMetadataProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpMetadataProvider {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataProvider {
    async fn lookup(&self, disc_id: &str) -> Vec<ReleaseMetadata> {
        let url = format!("{}/discid/{disc_id}?inc=recordings+artist-credits", self.base_url);
        let body = match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.json::<Value>().await.ok(),
            Err(e) => {
                tracing::warn!("metadata lookup for {disc_id} failed: {e}");
                None
            }
        };
        body.map(|b| parse_releases(&b)).unwrap_or_default()
    }
}

fn parse_releases(body: &Value) -> Vec<ReleaseMetadata> {
    let Some(releases) = body.get("releases").and_then(|r| r.as_array()) else {
        return Vec::new();
    };
    releases
        .iter()
        .filter_map(|r| {
            let release_id = r.get("id")?.as_str()?.to_string();
            let title = r
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("Unknown Album")
                .to_string();
            let artist = r
                .get("artist-credit")
                .and_then(|a| a.as_array())
                .and_then(|a| a.first())
                .and_then(|c| c.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("Unknown Artist")
                .to_string();
            let year = r
                .get("date")
                .and_then(|d| d.as_str())
                .map(|d| d.chars().take(4).collect())
                .unwrap_or_default();
            let tracks = r
                .get("tracks")
                .and_then(|t| t.as_array())
                .map(|arr| {
                    arr.iter()
                        .enumerate()
                        .map(|(i, t)| CdTrack {
                            num: (i + 1) as u32,
                            title: t
                                .get("title")
                                .and_then(|x| x.as_str())
                                .unwrap_or("Track")
                                .to_string(),
                            duration: t
                                .get("length")
                                .and_then(|x| x.as_str())
                                .unwrap_or("0:00")
                                .to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let front_art_url = r.get("front_art_url").and_then(|u| u.as_str()).map(String::from);
            let back_art_url = r.get("back_art_url").and_then(|u| u.as_str()).map(String::from);
            Some(ReleaseMetadata {
                release_id,
                title,
                artist,
                year,
                tracks,
                front_art_url,
                back_art_url,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------
// AirPlay sink selection
// ---------------------------------------------------------------------

/// Picks and verifies the configured AirPlay sink before each play
/// (§SPEC_FULL.md 4.8 "AirPlay default-sink selection"). Internal to
/// the CD source's own player; audio rendering subprocesses themselves
/// remain out of scope.
#[async_trait]
pub trait AudioOutputs: Send + Sync {
    async fn ensure_default_sink(&self) -> bool;
}

pub struct NoopAudioOutputs;

#[async_trait]
impl AudioOutputs for NoopAudioOutputs {
    async fn ensure_default_sink(&self) -> bool {
        true
    }
}

pub struct HttpAudioOutputs {
    selector_url: String,
    sink_name: String,
    http: reqwest::Client,
}

impl HttpAudioOutputs {
    pub fn new(selector_url: impl Into<String>, sink_name: impl Into<String>) -> Self {
        HttpAudioOutputs {
            selector_url: selector_url.into(),
            sink_name: sink_name.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AudioOutputs for HttpAudioOutputs {
    async fn ensure_default_sink(&self) -> bool {
        let url = format!("{}/select", self.selector_url);
        match self
            .http
            .post(&url)
            .json(&serde_json::json!({ "sink": self.sink_name }))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!("AirPlay sink selection failed: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------
// Playback engine (gapless, chapter-seeking)
// ---------------------------------------------------------------------

/// Signals the IPC reader task forwards to the CD source's event loop.
#[derive(Debug, Clone)]
pub enum EngineSignal {
    ChapterChanged(u32),
    Eof,
}

struct EngineProcess {
    child: tokio::process::Child,
    stdin: ChildStdin,
}

/// Drives a single long-lived audio subprocess over a line-delimited
/// JSON protocol (design note §9): `{"command":[...]}` outbound,
/// `{"event":"property-change",...}` inbound, EOF on process exit.
/// Chapter seeks while the subprocess is alive never restart it,
/// achieving true gapless playback.
pub struct PlaybackEngine {
    player_binary: String,
    process: Mutex<Option<EngineProcess>>,
}

impl PlaybackEngine {
    pub fn new(player_binary: impl Into<String>) -> Self {
        PlaybackEngine {
            player_binary: player_binary.into(),
            process: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.process.lock().await.is_some()
    }

    /// Drops the handle to a subprocess that has already exited (IPC
    /// EOF) without attempting to talk to its dead stdin, so the next
    /// `play_track` call relaunches instead of treating it as a live
    /// chapter seek.
    pub async fn mark_exited(&self) {
        self.process.lock().await.take();
    }

    /// First call launches the subprocess against the whole disc with
    /// the chapters file and seeks to `track_index` (0-based); every
    /// subsequent call while still running is a pure chapter seek.
    pub async fn play_track(&self, track_index: u32, chapters_path: &Path, events_tx: mpsc::Sender<EngineSignal>) {
        {
            let guard = self.process.lock().await;
            if guard.is_some() {
                drop(guard);
                self.seek_chapter(track_index).await;
                return;
            }
        }
        let mut cmd = Command::new(&self.player_binary);
        cmd.arg("cdda://")
            .arg(format!("--chapters-file={}", chapters_path.display()))
            .arg(format!("--start=#{}", track_index + 1))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("failed to launch playback subprocess: {e}");
                return;
            }
        };
        let Some(stdin) = child.stdin.take() else {
            return;
        };
        let Some(stdout) = child.stdout.take() else {
            return;
        };
        *self.process.lock().await = Some(EngineProcess { child, stdin });
        tokio::spawn(read_events(stdout, events_tx));
    }

    pub async fn seek_chapter(&self, track_index: u32) {
        let mut guard = self.process.lock().await;
        if let Some(proc) = guard.as_mut() {
            let line = serde_json::json!({ "command": ["set_property", "chapter", track_index] }).to_string();
            if let Err(e) = proc.stdin.write_all(format!("{line}\n").as_bytes()).await {
                tracing::warn!("failed to write chapter seek: {e}");
            }
        }
    }

    pub async fn set_volume(&self, percent: u8) {
        let mut guard = self.process.lock().await;
        if let Some(proc) = guard.as_mut() {
            let line = serde_json::json!({ "command": ["set_property", "volume", percent] }).to_string();
            let _ = proc.stdin.write_all(format!("{line}\n").as_bytes()).await;
        }
    }

    /// Graceful quit over the IPC protocol, falling back to a hard kill
    /// after 2s (§5: "terminate then kill after 2s").
    pub async fn stop(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut proc) = guard.take() {
            let quit = serde_json::json!({ "command": ["quit"] }).to_string();
            let _ = proc.stdin.write_all(format!("{quit}\n").as_bytes()).await;
            if tokio::time::timeout(Duration::from_secs(2), proc.child.wait())
                .await
                .is_err()
            {
                let _ = proc.child.start_kill();
                let _ = proc.child.wait().await;
            }
        }
    }
}

async fn read_events(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<EngineSignal>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Ok(event) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if event.get("event").and_then(|e| e.as_str()) == Some("property-change")
                    && event.get("name").and_then(|n| n.as_str()) == Some("chapter")
                {
                    if let Some(n) = event.get("data").and_then(|d| d.as_u64()) {
                        if tx.send(EngineSignal::ChapterChanged(n as u32)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                let _ = tx.send(EngineSignal::Eof).await;
                return;
            }
            Err(e) => {
                tracing::warn!("playback subprocess IPC read failed: {e}");
                let _ = tx.send(EngineSignal::Eof).await;
                return;
            }
        }
    }
}

/// Rebuilds a shuffle permutation of `[0, total)` that starts at
/// `start`, used both for the initial shuffle-on and for the
/// end-of-order-with-repeat rebuild (§4.8 step 5).
fn rebuild_shuffle_order(total: u32, start: u32) -> Vec<u32> {
    let mut rest: Vec<u32> = (0..total).filter(|&t| t != start).collect();
    rest.shuffle(&mut rand::thread_rng());
    let mut order = vec![start];
    order.extend(rest);
    order
}

// ---------------------------------------------------------------------
// CD source coordinator
// ---------------------------------------------------------------------

pub struct CdSourceConfig {
    pub router_base_url: String,
    pub ui_base_url: String,
    pub port: u16,
    pub player_binary: String,
    pub cache_dir: PathBuf,
    pub rip_root: PathBuf,
}

struct CdState {
    drive_connected: bool,
    disc_inserted: bool,
    toc: Vec<TocEntry>,
    leadout: u32,
    disc_id: Option<String>,
    release: Option<ReleaseMetadata>,
    alternatives: Vec<ReleaseMetadata>,
    tracks: Vec<CdTrack>,
    total_tracks: u32,
    current_track: u32,
    pending_track: Option<u32>,
    playback_state: CdPlaybackState,
    shuffle: bool,
    repeat: bool,
    shuffle_order: Vec<u32>,
    shuffle_pos: usize,
    last_activity: Instant,
    rip_mount_cache: Option<(Instant, Option<PathBuf>)>,
}

impl CdState {
    fn new() -> Self {
        CdState {
            drive_connected: false,
            disc_inserted: false,
            toc: Vec::new(),
            leadout: 0,
            disc_id: None,
            release: None,
            alternatives: Vec::new(),
            tracks: Vec::new(),
            total_tracks: 0,
            current_track: 0,
            pending_track: None,
            playback_state: CdPlaybackState::Stopped,
            shuffle: false,
            repeat: false,
            shuffle_order: Vec::new(),
            shuffle_pos: 0,
            last_activity: Instant::now(),
            rip_mount_cache: None,
        }
    }
}

pub struct CdSource {
    base: SourceBase,
    player: Arc<PlayerBase>,
    drive: Arc<dyn DriveIo>,
    metadata: Arc<dyn MetadataProvider>,
    audio_outputs: Arc<dyn AudioOutputs>,
    engine: Arc<PlaybackEngine>,
    cache_dir: PathBuf,
    rip_root: PathBuf,
    state: Mutex<CdState>,
    started_at: Instant,
}

impl CdSource {
    pub fn new(
        config: CdSourceConfig,
        drive: Arc<dyn DriveIo>,
        metadata: Arc<dyn MetadataProvider>,
        audio_outputs: Arc<dyn AudioOutputs>,
    ) -> Arc<Self> {
        let mut action_map = HashMap::new();
        action_map.insert("go".to_string(), "toggle".to_string());
        action_map.insert("right".to_string(), "next".to_string());
        action_map.insert("left".to_string(), "prev".to_string());
        action_map.insert("stop".to_string(), "stop".to_string());
        action_map.insert("shuffle".to_string(), "toggle_shuffle".to_string());
        action_map.insert("repeat".to_string(), "toggle_repeat".to_string());

        Arc::new(CdSource {
            base: SourceBase::new(
                "cd",
                "CD",
                config.port,
                PlayerKind::Local,
                action_map,
                config.router_base_url.clone(),
                config.ui_base_url.clone(),
            ),
            player: PlayerBase::new(vec!["cdda".to_string()], config.router_base_url),
            drive,
            metadata,
            audio_outputs,
            engine: Arc::new(PlaybackEngine::new(config.player_binary)),
            cache_dir: config.cache_dir,
            rip_root: config.rip_root,
            state: Mutex::new(CdState::new()),
            started_at: Instant::now(),
        })
    }

    fn in_startup_grace(&self) -> bool {
        self.started_at.elapsed() < STARTUP_GRACE
    }

    /// `handle_raw_action` override (§4.3): intercepts the `cd`
    /// source-select button and bare digits before `action_map`
    /// translation.
    pub fn handle_raw_action(&self, action: &str) -> Option<ResolvedCommand> {
        if let Ok(digit) = action.parse::<u32>() {
            if digit <= 9 {
                let mut data = HashMap::new();
                data.insert("track".to_string(), Value::from(digit));
                return Some(ResolvedCommand {
                    command: "play_track".to_string(),
                    data,
                });
            }
        }
        if action == "cd" {
            return Some(ResolvedCommand {
                command: "play".to_string(),
                data: HashMap::new(),
            });
        }
        None
    }

    pub async fn resolve(&self, body: CommandBody) -> ResolvedCommand {
        if let Some(action) = &body.action {
            if let Some(resolved) = self.handle_raw_action(action) {
                return resolved;
            }
        }
        self.base.resolve_command(body)
    }

    // -- drive watcher -----------------------------------------------

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let watcher = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.drive_watch_loop(cancel).await })
        };
        let pause_timer = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.pause_timeout_loop(cancel).await })
        };
        let _ = tokio::join!(watcher, pause_timer);
    }

    async fn drive_watch_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            self.poll_drive().await;
        }
    }

    async fn poll_drive(self: &Arc<Self>) {
        let connected = self.drive.drive_connected().await;
        let toc = if connected { self.drive.read_toc().await } else { None };
        let inserted = toc.is_some();

        let mut state = self.state.lock().await;
        let was_inserted = state.disc_inserted;
        state.drive_connected = connected;
        if inserted == was_inserted {
            return;
        }
        state.disc_inserted = inserted;
        match toc {
            Some((toc, leadout)) => {
                state.toc = toc;
                state.leadout = leadout;
                drop(state);
                self.on_disc_inserted().await;
            }
            None => {
                drop(state);
                self.on_disc_ejected().await;
            }
        }
    }

    async fn on_disc_inserted(self: &Arc<Self>) {
        let startup_grace = self.in_startup_grace();
        let disc_id = {
            let state = self.state.lock().await;
            compute_disc_id(&state.toc, state.leadout)
        };
        {
            let mut state = self.state.lock().await;
            state.disc_id = Some(disc_id.clone());
        }

        let command_url = Some(format!("http://localhost:{}/command", self.base.port));
        self.base
            .register(
                SourceState::Available,
                command_url,
                Some(self.base.action_map.keys().cloned().collect()),
                Some("cd".to_string()),
                !startup_grace,
                false,
            )
            .await;

        let this = self.clone();
        tokio::spawn(async move {
            this.fetch_metadata_and_maybe_autoplay(startup_grace).await;
        });
    }

    async fn fetch_metadata_and_maybe_autoplay(self: Arc<Self>, skip_autoplay: bool) {
        let disc_id = {
            let state = self.state.lock().await;
            state.disc_id.clone()
        };
        let Some(disc_id) = disc_id else { return };
        let releases = self.metadata.lookup(&disc_id).await;

        let mut state = self.state.lock().await;
        if let Some((release, alternatives)) = releases.split_first() {
            state.release = Some(release.clone());
            state.tracks = release.tracks.clone();
            state.alternatives = alternatives.to_vec();
        } else {
            state.tracks = generic_tracks_from_toc(&state.toc, state.leadout);
        }
        state.total_tracks = state.tracks.len() as u32;
        let front = state.release.as_ref().and_then(|r| r.front_art_url.clone());
        let back = state.release.as_ref().and_then(|r| r.back_art_url.clone());
        drop(state);

        if let Some(url) = front {
            let _ = self.player.get_or_fetch_artwork(&url).await;
        }
        if let Some(url) = back {
            let _ = self.player.get_or_fetch_artwork(&url).await;
        }

        self.base
            .broadcast("cd_update", serde_json::json!({ "disc_id": disc_id }))
            .await;

        if !skip_autoplay {
            self.play_track(0).await;
        }
    }

    async fn on_disc_ejected(self: &Arc<Self>) {
        self.engine.stop().await;
        let mut state = self.state.lock().await;
        *state = CdState::new();
        state.drive_connected = true;
        drop(state);
        self.base
            .register(SourceState::Gone, None, None, None, false, false)
            .await;
    }

    // -- playback ------------------------------------------------------

    pub async fn play_track(self: &Arc<Self>, track_index: u32) {
        self.audio_outputs.ensure_default_sink().await;

        let chapters_path = {
            let mut state = self.state.lock().await;
            state.pending_track = Some(track_index);
            state.last_activity = Instant::now();
            let path = self.cache_dir.join("chapters.txt");
            if !self.engine.is_running().await {
                let _ = write_chapters_file(&path, &state.tracks, &state.toc);
            }
            path
        };

        let (tx, mut rx) = mpsc::channel(16);
        self.engine.play_track(track_index, &chapters_path, tx).await;

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                this.handle_engine_signal(signal).await;
            }
        });

        let mut state = self.state.lock().await;
        state.playback_state = CdPlaybackState::Playing;
        drop(state);

        let command_url = Some(format!("http://localhost:{}/command", self.base.port));
        self.base
            .register(SourceState::Playing, command_url, None, None, false, true)
            .await;
    }

    async fn handle_engine_signal(self: Arc<Self>, signal: EngineSignal) {
        match signal {
            EngineSignal::ChapterChanged(n) => self.handle_chapter_changed(n).await,
            EngineSignal::Eof => self.handle_natural_end().await,
        }
    }

    /// Pending-seek discipline (§4.8 step 4): a seek in flight sets
    /// `pending_track`; only the matching event clears it, everything
    /// else is ignored. A chapter event with no pending seek is a
    /// natural advance, subject to shuffle redirection (step 5).
    async fn handle_chapter_changed(self: Arc<Self>, n: u32) {
        let mut redirect_to: Option<u32> = None;
        {
            let mut state = self.state.lock().await;
            match state.pending_track {
                Some(expected) if expected != n => return,
                Some(_) => {
                    state.pending_track = None;
                    state.current_track = n;
                }
                None => {
                    let natural_next = state.current_track + 1;
                    if n == natural_next && state.shuffle {
                        state.shuffle_pos += 1;
                        if state.shuffle_pos >= state.shuffle_order.len() {
                            if state.repeat {
                                state.shuffle_order = rebuild_shuffle_order(state.total_tracks, n);
                                state.shuffle_pos = 0;
                            } else {
                                state.shuffle_pos = state.shuffle_order.len().saturating_sub(1);
                            }
                        }
                        let target = state.shuffle_order.get(state.shuffle_pos).copied().unwrap_or(n);
                        if target != n {
                            state.pending_track = Some(target);
                            redirect_to = Some(target);
                        } else {
                            state.current_track = target;
                        }
                    } else {
                        state.current_track = n;
                    }
                }
            }
            state.last_activity = Instant::now();
        }

        if let Some(target) = redirect_to {
            self.engine.seek_chapter(target).await;
            return;
        }

        let command_url = Some(format!("http://localhost:{}/command", self.base.port));
        self.base
            .register(SourceState::Playing, command_url, None, None, false, false)
            .await;
        let current_track = self.state.lock().await.current_track;
        self.base
            .broadcast("cd_update", serde_json::json!({ "current_track": current_track }))
            .await;
    }

    async fn handle_natural_end(self: Arc<Self>) {
        // The subprocess already exited (IPC EOF); drop the stale
        // handle so a repeat restart relaunches instead of seeking a
        // dead process.
        self.engine.mark_exited().await;
        let (repeat, shuffle, total) = {
            let state = self.state.lock().await;
            (state.repeat, state.shuffle, state.total_tracks)
        };
        if repeat && total > 0 {
            let start = if shuffle {
                let mut state = self.state.lock().await;
                state.shuffle_order = rebuild_shuffle_order(total, 0);
                state.shuffle_pos = 0;
                state.shuffle_order[0]
            } else {
                0
            };
            self.play_track(start).await;
            return;
        }
        self.engine.stop().await;
        let mut state = self.state.lock().await;
        state.playback_state = CdPlaybackState::Stopped;
        drop(state);
        self.base
            .register(SourceState::Available, None, None, None, false, false)
            .await;
        self.base
            .broadcast("cd_update", serde_json::json!({ "disc_end": true }))
            .await;
    }

    // -- pause timeout ---------------------------------------------------

    async fn pause_timeout_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let should_timeout = {
                let state = self.state.lock().await;
                state.playback_state == CdPlaybackState::Paused
                    && state.last_activity.elapsed() >= PAUSE_TIMEOUT
            };
            if should_timeout {
                self.engine.stop().await;
                let mut state = self.state.lock().await;
                state.playback_state = CdPlaybackState::Stopped;
                drop(state);
                self.base
                    .register(SourceState::Available, None, None, None, false, false)
                    .await;
                self.base
                    .broadcast("cd_update", serde_json::json!({ "pause_timeout": true }))
                    .await;
            }
        }
    }

    // -- shuffle / repeat -------------------------------------------------

    pub async fn toggle_shuffle(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        state.shuffle = !state.shuffle;
        if state.shuffle {
            let current = state.current_track;
            let total = state.total_tracks;
            state.shuffle_order = rebuild_shuffle_order(total, current);
            state.shuffle_pos = 0;
        }
        state.shuffle
    }

    pub async fn toggle_repeat(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        state.repeat = !state.repeat;
        state.repeat
    }

    /// Swaps the active release metadata for one of the alternatives
    /// surfaced alongside the best match (§4.8 "alternatives"). Leaves
    /// the chosen release in the alternatives list otherwise untouched,
    /// so the swap is reversible.
    pub async fn select_alternative(self: &Arc<Self>, release_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(pos) = state.alternatives.iter().position(|r| r.release_id == release_id) else {
            return false;
        };
        let chosen = state.alternatives.remove(pos);
        state.tracks = chosen.tracks.clone();
        if let Some(previous) = state.release.replace(chosen) {
            state.alternatives.push(previous);
        }
        true
    }

    fn alternatives_summary(state: &CdState) -> Vec<crate::model::CdAlternative> {
        state
            .alternatives
            .iter()
            .map(|r| crate::model::CdAlternative {
                release_id: r.release_id.clone(),
                artist: r.artist.clone(),
                title: r.title.clone(),
                year: r.year.clone(),
            })
            .collect()
    }

    // -- TTS announcement --------------------------------------------------

    /// Fades playback down over 500ms, plays the synthesized clip, then
    /// fades back up over 800ms (§4.8 "TTS announcement").
    pub async fn announce(self: &Arc<Self>, text: &str, tts_engine: &dyn TtsEngine) {
        let base_volume = 100u16;
        for step in (0..FADE_STEPS).rev() {
            let v = (base_volume * step as u16 / FADE_STEPS as u16) as u8;
            self.engine.set_volume(v).await;
            tokio::time::sleep(FADE_DOWN_DURATION / FADE_STEPS as u32).await;
        }

        if let Some(clip_path) = tts_engine.synthesize(text).await {
            let status = Command::new("aplay").arg(&clip_path).status().await;
            if let Err(e) = status {
                tracing::warn!("announcement playback failed: {e}");
            }
        }

        for step in 1..=FADE_STEPS {
            let v = (base_volume * step as u16 / FADE_STEPS as u16) as u8;
            self.engine.set_volume(v).await;
            tokio::time::sleep(FADE_UP_DURATION / FADE_STEPS as u32).await;
        }
    }

    // -- rip -----------------------------------------------------------

    /// Scans block devices for a USB-transport mountpoint, cached 30s
    /// (§4.8 "Rip").
    pub async fn detect_external_drive(self: &Arc<Self>) -> Option<PathBuf> {
        {
            let state = self.state.lock().await;
            if let Some((observed_at, mount)) = &state.rip_mount_cache {
                if observed_at.elapsed() < RIP_MOUNT_CACHE_TTL {
                    return mount.clone();
                }
            }
        }
        let mount = scan_usb_mountpoint().await;
        let mut state = self.state.lock().await;
        state.rip_mount_cache = Some((Instant::now(), mount.clone()));
        mount
    }

    pub async fn rip(self: &Arc<Self>) -> Result<(), String> {
        let Some(mount) = self.detect_external_drive().await else {
            return Err("no external USB drive detected".to_string());
        };
        let (artist, title) = {
            let state = self.state.lock().await;
            match &state.release {
                Some(r) => (r.artist.clone(), r.title.clone()),
                None => ("Unknown Artist".to_string(), "Unknown Album".to_string()),
            }
        };
        let dest = mount.join("Music").join(&artist).join(&title);
        if let Err(e) = tokio::fs::create_dir_all(&dest).await {
            return Err(format!("could not create rip destination: {e}"));
        }
        let dest_str = dest.display().to_string();
        tokio::spawn(async move {
            let result = Command::new("cdparanoia")
                .arg("-B")
                .arg(format!("--output-dir={dest_str}"))
                .status()
                .await;
            if let Err(e) = result {
                tracing::warn!("rip subprocess failed to start: {e}");
            }
        });
        Ok(())
    }
}

async fn scan_usb_mountpoint() -> Option<PathBuf> {
    let output = Command::new("lsblk")
        .args(["-J", "-o", "NAME,TRAN,MOUNTPOINT"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let parsed: Value = serde_json::from_slice(&output.stdout).ok()?;
    let blockdevices = parsed.get("blockdevices")?.as_array()?;
    find_usb_mountpoint(blockdevices)
}

/// `lsblk -J -o NAME,TRAN,MOUNTPOINT` reports `TRAN` on the whole-disk
/// device (which itself has no mountpoint) and the mountpoint on a
/// child partition (whose own `tran` is null, inherited from its
/// parent). So a usb transport must be tracked down through
/// descendants rather than required on the same node as the
/// mountpoint.
fn find_usb_mountpoint(devices: &[Value]) -> Option<PathBuf> {
    find_mountpoint_under(devices, false)
}

fn find_mountpoint_under(devices: &[Value], under_usb: bool) -> Option<PathBuf> {
    for device in devices {
        let is_usb = under_usb || device.get("tran").and_then(|t| t.as_str()) == Some("usb");
        if is_usb {
            if let Some(mp) = device.get("mountpoint").and_then(|m| m.as_str()) {
                return Some(PathBuf::from(mp));
            }
        }
        if let Some(children) = device.get("children").and_then(|c| c.as_array()) {
            if let Some(found) = find_mountpoint_under(children, is_usb) {
                return Some(found);
            }
        }
    }
    None
}

#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(&self, text: &str) -> Option<PathBuf>;
}

// ---------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------

pub fn build_router(source: Arc<CdSource>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/command", post(post_command))
        .route("/resync", get(get_resync))
        .route("/player/state", get(get_player_state))
        .route("/player/capabilities", get(get_player_capabilities))
        .route("/ws", get(get_ws))
        .with_state(source)
}

async fn get_status(State(source): State<Arc<CdSource>>) -> Json<Value> {
    let has_external_drive = source.detect_external_drive().await.is_some();
    let state = source.state.lock().await;
    Json(serde_json::json!({
        "id": source.base.id,
        "name": source.base.name,
        "drive_connected": state.drive_connected,
        "disc_inserted": state.disc_inserted,
        "disc_id": state.disc_id,
        "release": state.release.as_ref().map(|r| serde_json::json!({
            "release_id": r.release_id,
            "title": r.title,
            "artist": r.artist,
            "year": r.year,
        })),
        "tracks": state.tracks,
        "alternatives": CdSource::alternatives_summary(&state),
        "current_track": state.current_track,
        "playback_state": state.playback_state,
        "shuffle": state.shuffle,
        "repeat": state.repeat,
        "has_external_drive": has_external_drive,
    }))
}

async fn post_command(State(source): State<Arc<CdSource>>, Json(body): Json<CommandBody>) -> Json<Value> {
    let resolved = source.resolve(body).await;
    let response = match resolved.command.as_str() {
        "play" => {
            let track = source.state.lock().await.current_track;
            source.play_track(track).await;
            serde_json::json!({ "status": "ok" })
        }
        "play_track" => {
            let track = resolved
                .data
                .get("track")
                .and_then(|v| v.as_u64())
                .map(|n| n.saturating_sub(1) as u32)
                .unwrap_or(0);
            source.play_track(track).await;
            serde_json::json!({ "status": "ok" })
        }
        "next" => {
            let track = source.state.lock().await.current_track + 1;
            source.play_track(track).await;
            serde_json::json!({ "status": "ok" })
        }
        "prev" => {
            let track = source.state.lock().await.current_track.saturating_sub(1);
            source.play_track(track).await;
            serde_json::json!({ "status": "ok" })
        }
        "stop" => {
            source.engine.stop().await;
            let mut state = source.state.lock().await;
            state.playback_state = CdPlaybackState::Stopped;
            serde_json::json!({ "status": "ok" })
        }
        "toggle_shuffle" => {
            let shuffle = source.toggle_shuffle().await;
            serde_json::json!({ "status": "ok", "shuffle": shuffle })
        }
        "toggle_repeat" => {
            let repeat = source.toggle_repeat().await;
            serde_json::json!({ "status": "ok", "repeat": repeat })
        }
        "rip" => match source.rip().await {
            Ok(()) => serde_json::json!({ "status": "ok" }),
            Err(e) => serde_json::json!({ "status": "error", "message": e }),
        },
        "select_alternative" => {
            let release_id = resolved.data.get("release_id").and_then(|v| v.as_str()).unwrap_or_default();
            let switched = source.select_alternative(release_id).await;
            serde_json::json!({ "status": if switched { "ok" } else { "error" } })
        }
        other => serde_json::json!({ "status": "error", "message": format!("unknown command {other}") }),
    };
    Json(response)
}

async fn get_resync(State(source): State<Arc<CdSource>>) -> StatusCode {
    let command_url = Some(format!("http://localhost:{}/command", source.base.port));
    let state = {
        let state = source.state.lock().await;
        if !state.disc_inserted {
            SourceState::Gone
        } else if state.playback_state == CdPlaybackState::Playing {
            SourceState::Playing
        } else if state.playback_state == CdPlaybackState::Paused {
            SourceState::Paused
        } else {
            SourceState::Available
        }
    };
    source
        .base
        .register(state, command_url, None, Some("cd".to_string()), false, false)
        .await;
    StatusCode::OK
}

async fn get_player_state(State(source): State<Arc<CdSource>>) -> Json<Value> {
    let state = source.state.lock().await;
    Json(serde_json::json!({
        "current_track": state.current_track,
        "playback_state": state.playback_state,
    }))
}

async fn get_player_capabilities(State(source): State<Arc<CdSource>>) -> Json<Vec<String>> {
    Json(source.player.capabilities().to_vec())
}

async fn get_ws(State(source): State<Arc<CdSource>>, ws: WebSocketUpgrade) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_ws(socket, source))
}

/// Server-push only (§6): client messages are read and discarded so the
/// connection's read half does not pile up, but no command is ever
/// accepted over this channel.
async fn handle_ws(mut socket: WebSocket, source: Arc<CdSource>) {
    let mut updates = source.player.subscribe();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Ok(update) = update else { return };
                let Ok(text) = serde_json::to_string(&update) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toc_parses_normalized_probe_output() {
        let text = "track 1 lba 0\ntrack 2 lba 13500\nleadout lba 180000\n";
        let parsed = parse_normalized_toc(text);
        assert!(parsed.is_some());
        let (entries, leadout) = parsed.unwrap_or_default();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].frame_offset, 13500);
        assert_eq!(leadout, 180000);
    }

    #[test]
    fn missing_track_lines_yield_none() {
        assert!(parse_normalized_toc("nothing useful").is_none());
    }

    #[test]
    fn disc_id_is_deterministic() {
        let toc = vec![
            TocEntry { track: 1, frame_offset: 0 },
            TocEntry { track: 2, frame_offset: 13500 },
        ];
        let a = compute_disc_id(&toc, 180000);
        let b = compute_disc_id(&toc, 180000);
        assert_eq!(a, b);
    }

    #[test]
    fn disc_id_differs_for_different_toc() {
        let toc_a = vec![TocEntry { track: 1, frame_offset: 0 }];
        let toc_b = vec![TocEntry { track: 1, frame_offset: 7500 }];
        assert_ne!(compute_disc_id(&toc_a, 90000), compute_disc_id(&toc_b, 90000));
    }

    #[test]
    fn generic_tracks_fall_back_when_no_metadata_match() {
        let toc = vec![
            TocEntry { track: 1, frame_offset: 0 },
            TocEntry { track: 2, frame_offset: 75 * 120 },
        ];
        let tracks = generic_tracks_from_toc(&toc, 75 * 240);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].title, "Track 1");
        assert_eq!(tracks[0].duration, "2:00");
    }

    #[test]
    fn chapters_file_contains_absolute_offsets() {
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let path = dir.path().join("chapters.txt");
        let toc = vec![
            TocEntry { track: 1, frame_offset: 0 },
            TocEntry { track: 2, frame_offset: 75 * 65 },
        ];
        let tracks = vec![
            CdTrack { num: 1, title: "First".into(), duration: "1:05".into() },
            CdTrack { num: 2, title: "Second".into(), duration: "2:00".into() },
        ];
        assert!(write_chapters_file(&path, &tracks, &toc).is_ok());
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        assert!(content.contains("CHAPTER01=00:00:00.000"));
        assert!(content.contains("CHAPTER01NAME=First"));
        assert!(content.contains("CHAPTER02=00:01:05.000"));
    }

    #[test]
    fn rebuild_shuffle_order_always_starts_at_requested_track() {
        let order = rebuild_shuffle_order(5, 2);
        assert_eq!(order[0], 2);
        assert_eq!(order.len(), 5);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }

    struct MockDrive {
        toc: std::sync::Mutex<Option<(Vec<TocEntry>, u32)>>,
    }

    #[async_trait]
    impl DriveIo for MockDrive {
        async fn drive_connected(&self) -> bool {
            true
        }

        async fn read_toc(&self) -> Option<(Vec<TocEntry>, u32)> {
            self.toc.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    struct NullMetadata;

    #[async_trait]
    impl MetadataProvider for NullMetadata {
        async fn lookup(&self, _disc_id: &str) -> Vec<ReleaseMetadata> {
            Vec::new()
        }
    }

    /// S5 — disc insertion then ejection: `available` then `gone`, in
    /// that order, and playback is not running once `gone`.
    #[tokio::test]
    async fn disc_insert_then_eject_clears_metadata_and_stops_playback() {
        let drive = Arc::new(MockDrive {
            toc: std::sync::Mutex::new(Some((
                vec![
                    TocEntry { track: 1, frame_offset: 0 },
                    TocEntry { track: 2, frame_offset: 75 * 120 },
                ],
                75 * 240,
            ))),
        });
        let source = CdSource::new(
            CdSourceConfig {
                router_base_url: "http://127.0.0.1:1".to_string(),
                ui_base_url: "http://127.0.0.1:1".to_string(),
                port: 0,
                player_binary: "mpv".to_string(),
                cache_dir: std::env::temp_dir(),
                rip_root: std::env::temp_dir(),
            },
            drive.clone(),
            Arc::new(NullMetadata),
            Arc::new(NoopAudioOutputs),
        );

        // Insertion: poll_drive sees a disc for the first time. Within
        // the 6s startup grace autoplay is skipped, so no subprocess
        // is ever spawned for this test.
        source.poll_drive().await;
        {
            let state = source.state.lock().await;
            assert!(state.disc_inserted);
        }
        // fetch_metadata_and_maybe_autoplay runs as a spawned task;
        // give it a tick to populate the generic fallback tracks.
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let state = source.state.lock().await;
            assert_eq!(state.total_tracks, 2);
        }

        // Ejection: the drive stops returning a TOC.
        *drive.toc.lock().unwrap_or_else(|e| e.into_inner()) = None;
        source.poll_drive().await;

        let state = source.state.lock().await;
        assert!(!state.disc_inserted);
        assert!(state.tracks.is_empty());
        assert!(state.disc_id.is_none());
        drop(state);
        assert!(!source.engine.is_running().await);
    }

    #[test]
    fn find_usb_mountpoint_recurses_into_children() {
        // Real `lsblk -J -o NAME,TRAN,MOUNTPOINT` output: TRAN is
        // reported on the whole-disk device, not the mounted partition.
        let devices = serde_json::json!([
            {
                "name": "sda",
                "tran": "usb",
                "mountpoint": null,
                "children": [
                    { "name": "sda1", "tran": null, "mountpoint": "/media/usb0" }
                ]
            }
        ]);
        let empty = Vec::new();
        let found = find_usb_mountpoint(devices.as_array().unwrap_or(&empty));
        assert_eq!(found, Some(PathBuf::from("/media/usb0")));
    }

    #[test]
    fn find_usb_mountpoint_ignores_non_usb_internal_drive() {
        let devices = serde_json::json!([
            {
                "name": "sda",
                "tran": null,
                "mountpoint": null,
                "children": [
                    { "name": "sda1", "tran": null, "mountpoint": "/" }
                ]
            }
        ]);
        let empty = Vec::new();
        let found = find_usb_mountpoint(devices.as_array().unwrap_or(&empty));
        assert_eq!(found, None);
    }
}
