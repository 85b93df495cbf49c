//! Source registry: lifecycle state machine and active-source exclusivity.
//!
//! Implemented as a single actor task owning the registry state
//! exclusively (§9: "the router process holds one registry... as fields
//! of a single struct owned by the process entry point"). Registrations
//! are processed one at a time through a channel, which is what gives us
//! the ordering guarantee in §5 ("the registry explicitly serializes
//! active-slot transitions: a new `playing` registration first awaits
//! the previous source's stop request before emitting `source_change`")
//! without ever holding a lock across an `.await`.

use crate::bus::{BusEvent, MenuItemAction, SharedBus};
use crate::model::{
    MenuEntry, MenuEntryKind, PlayerKind, Source, SourceRegistration, SourceState,
};
use crate::volume::VolumeOutput;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// A source declared up front in the menu configuration, before it has
/// ever registered with the router.
#[derive(Debug, Clone)]
pub struct ConfigSourceSeed {
    pub id: String,
    pub name: String,
    pub menu_preset: Option<String>,
    pub initial_hidden: bool,
}

/// One parsed menu config entry, handed to `spawn` in config order (§3
/// "Menu"). A `Source` seed joins the registry's lifecycle tracking;
/// a `Fixed` entry (static view or web page) has no lifecycle and is
/// always present in the menu snapshot.
#[derive(Debug, Clone)]
pub enum MenuSeed {
    Source(ConfigSourceSeed),
    Fixed(MenuEntry),
}

/// One slot in the registry's full menu ordering, preserving the
/// relative order of config-declared sources, static views, web pages,
/// and ad-hoc (not-from-config) sources appended as they register.
#[derive(Debug, Clone)]
enum FullSlot {
    SourceId(String),
    Fixed(MenuEntry),
}

/// Outcome of a single registration, returned to the HTTP handler.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub source: Source,
    pub active_source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub menu: Vec<MenuEntry>,
    pub active_source: Option<String>,
}

enum Command {
    Register {
        reg: SourceRegistration,
        resp: oneshot::Sender<RegisterOutcome>,
    },
    Snapshot {
        resp: oneshot::Sender<RegistrySnapshot>,
    },
    ActiveSource {
        resp: oneshot::Sender<Option<Source>>,
    },
    Get {
        id: String,
        resp: oneshot::Sender<Option<Source>>,
    },
}

/// Cheaply-cloneable handle to the registry actor. All mutation goes
/// through this handle; there is no way to reach the registry state
/// except by sending it a command.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub async fn register(&self, reg: SourceRegistration) -> RegisterOutcome {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Register { reg, resp: resp_tx })
            .await
            .is_err()
        {
            return RegisterOutcome {
                source: Source {
                    id: String::new(),
                    name: String::new(),
                    state: SourceState::Gone,
                    command_url: None,
                    menu_preset: None,
                    handles: Default::default(),
                    player: PlayerKind::Remote,
                    from_config: false,
                    initial_hidden: false,
                },
                active_source: None,
            };
        }
        resp_rx.await.unwrap_or(RegisterOutcome {
            source: Source {
                id: String::new(),
                name: String::new(),
                state: SourceState::Gone,
                command_url: None,
                menu_preset: None,
                handles: Default::default(),
                player: PlayerKind::Remote,
                from_config: false,
                initial_hidden: false,
            },
            active_source: None,
        })
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { resp: resp_tx }).await.is_err() {
            return RegistrySnapshot {
                menu: Vec::new(),
                active_source: None,
            };
        }
        resp_rx.await.unwrap_or(RegistrySnapshot {
            menu: Vec::new(),
            active_source: None,
        })
    }

    pub async fn active_source(&self) -> Option<Source> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx.send(Command::ActiveSource { resp: resp_tx }).await.ok()?;
        resp_rx.await.ok().flatten()
    }

    pub async fn get(&self, id: &str) -> Option<Source> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Command::Get {
                id: id.to_string(),
                resp: resp_tx,
            })
            .await
            .ok()?;
        resp_rx.await.ok().flatten()
    }
}

/// Spawns the registry actor task and returns a handle to it. `seeds`
/// are the sources declared up front in menu config: they exist (in
/// state `Gone`) before any process registers them. `volume` is used
/// only for the §4.2 "enter playing with `auto_power=true`" side effect;
/// the registry never reads volume state otherwise.
pub fn spawn(
    bus: SharedBus,
    seeds: Vec<MenuSeed>,
    volume: Arc<dyn VolumeOutput>,
) -> RegistryHandle {
    let (tx, rx) = mpsc::channel(64);
    let state = RegistryState::new(seeds);
    tokio::spawn(run(state, rx, bus, volume));
    RegistryHandle { tx }
}

async fn run(
    mut state: RegistryState,
    mut rx: mpsc::Receiver<Command>,
    bus: SharedBus,
    volume: Arc<dyn VolumeOutput>,
) {
    let client = reqwest::Client::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Register { reg, resp } => {
                let outcome = state.apply_registration(reg, &client, &bus, &volume).await;
                let _ = resp.send(outcome);
            }
            Command::Snapshot { resp } => {
                let _ = resp.send(state.snapshot());
            }
            Command::ActiveSource { resp } => {
                let _ = resp.send(state.active_source().cloned());
            }
            Command::Get { id, resp } => {
                let _ = resp.send(state.sources.get(&id).cloned());
            }
        }
    }
}

struct RegistryState {
    sources: HashMap<String, Source>,
    active_id: Option<String>,
    menu_order: Vec<String>,
    full_order: Vec<FullSlot>,
}

impl RegistryState {
    fn new(seeds: Vec<MenuSeed>) -> Self {
        let mut sources = HashMap::new();
        let mut menu_order = Vec::new();
        let mut full_order = Vec::new();
        for seed in seeds {
            match seed {
                MenuSeed::Source(seed) => {
                    menu_order.push(seed.id.clone());
                    full_order.push(FullSlot::SourceId(seed.id.clone()));
                    sources.insert(
                        seed.id.clone(),
                        Source {
                            id: seed.id,
                            name: seed.name,
                            state: SourceState::Gone,
                            command_url: None,
                            menu_preset: seed.menu_preset,
                            handles: Default::default(),
                            player: PlayerKind::Remote,
                            from_config: true,
                            initial_hidden: seed.initial_hidden,
                        },
                    );
                }
                MenuSeed::Fixed(entry) => {
                    full_order.push(FullSlot::Fixed(entry));
                }
            }
        }
        RegistryState {
            sources,
            active_id: None,
            menu_order,
            full_order,
        }
    }

    fn active_source(&self) -> Option<&Source> {
        self.active_id.as_ref().and_then(|id| self.sources.get(id))
    }

    /// The core state machine transition (§4.2). Mutates `self` and
    /// performs the single cross-process await (the stop POST to a
    /// previous active source) in the one place the ordering guarantee
    /// requires it.
    async fn apply_registration(
        &mut self,
        reg: SourceRegistration,
        client: &reqwest::Client,
        bus: &SharedBus,
        volume: &Arc<dyn VolumeOutput>,
    ) -> RegisterOutcome {
        let id = reg.id.clone();
        let was_known = self.sources.contains_key(&id);
        let auto_power = reg.auto_power;
        let old_state = self
            .sources
            .get(&id)
            .map(|s| s.state)
            .unwrap_or(SourceState::Gone);

        if !was_known {
            self.menu_order.push(id.clone());
            self.full_order.push(FullSlot::SourceId(id.clone()));
        }

        let entry = self.sources.entry(id.clone()).or_insert_with(|| Source {
            id: id.clone(),
            name: reg.name.clone().unwrap_or_else(|| id.clone()),
            state: SourceState::Gone,
            command_url: None,
            menu_preset: reg.menu_preset.clone(),
            handles: Default::default(),
            player: PlayerKind::Remote,
            from_config: false,
            initial_hidden: false,
        });

        if let Some(name) = &reg.name {
            entry.name = name.clone();
        }
        if let Some(url) = &reg.command_url {
            entry.command_url = Some(url.clone());
        }
        if let Some(preset) = &reg.menu_preset {
            entry.menu_preset = Some(preset.clone());
        }
        if let Some(handles) = &reg.handles {
            entry.handles = handles.clone();
        }
        if let Some(player) = reg.player {
            entry.player = player;
        }
        entry.state = reg.state;

        // First appearance: gone -> available.
        if old_state == SourceState::Gone && reg.state == SourceState::Available {
            let from_config = entry.from_config;
            let initial_hidden = entry.initial_hidden;
            if from_config && initial_hidden {
                bus.publish(BusEvent::MenuItem {
                    action: MenuItemAction::Show,
                    id: id.clone(),
                    after: None,
                });
            } else if !from_config {
                let after = self.preceding_configured_entry(&id);
                bus.publish(BusEvent::MenuItem {
                    action: MenuItemAction::Add,
                    id: id.clone(),
                    after,
                });
            }
        }

        // Entering playing/paused: becomes the new active source.
        let becomes_active = reg.state.is_active_capable();
        let mut stopped_previous: Option<String> = None;
        if becomes_active {
            let previous = self.active_id.clone();
            if let Some(prev_id) = previous {
                if prev_id != id {
                    if let Some(prev) = self.sources.get(&prev_id) {
                        if let Some(url) = prev.command_url.clone() {
                            stopped_previous = Some(prev_id.clone());
                            let _ = client
                                .post(&url)
                                .timeout(STOP_TIMEOUT)
                                .json(&serde_json::json!({ "action": "stop" }))
                                .send()
                                .await;
                        }
                    }
                }
            }
            let newly_active = self.active_id.as_deref() != Some(id.as_str());
            self.active_id = Some(id.clone());

            if newly_active {
                let source_name = self.sources.get(&id).map(|s| s.name.clone());
                let player = self.sources.get(&id).map(|s| match s.player {
                    PlayerKind::Local => "local".to_string(),
                    PlayerKind::Remote => "remote".to_string(),
                });
                bus.publish(BusEvent::SourceChange {
                    active_source: Some(id.clone()),
                    source_name,
                    player,
                });
                // §4.2: "if the incoming payload requested auto_power=true
                // and the volume adapter is off, power it on" — fired
                // after the source_change broadcast, fire-and-forget so
                // it never delays the registration response.
                if auto_power && volume.is_on_cached() == Some(false) {
                    let volume = volume.clone();
                    tokio::spawn(async move {
                        volume.power_on().await;
                    });
                }
            }
        } else if reg.state == SourceState::Available {
            // Leaving active back to available.
            if self.active_id.as_deref() == Some(id.as_str()) {
                self.active_id = None;
                bus.publish(BusEvent::SourceChange {
                    active_source: None,
                    source_name: None,
                    player: None,
                });
            }
        } else if reg.state == SourceState::Gone {
            let from_config = self.sources.get(&id).map(|s| s.from_config).unwrap_or(false);
            let initial_hidden = self
                .sources
                .get(&id)
                .map(|s| s.initial_hidden)
                .unwrap_or(false);
            if from_config && initial_hidden {
                bus.publish(BusEvent::MenuItem {
                    action: MenuItemAction::Hide,
                    id: id.clone(),
                    after: None,
                });
            } else if !from_config {
                bus.publish(BusEvent::MenuItem {
                    action: MenuItemAction::Remove,
                    id: id.clone(),
                    after: None,
                });
            }
            if self.active_id.as_deref() == Some(id.as_str()) {
                self.active_id = None;
            }
        }

        if reg.navigate
            && matches!(reg.state, SourceState::Available | SourceState::Playing)
        {
            bus.publish(BusEvent::Navigate {
                page: format!("menu/{}", id),
            });
        }

        let _ = stopped_previous;

        RegisterOutcome {
            source: self.sources.get(&id).cloned().unwrap_or_else(|| Source {
                id: id.clone(),
                name: id.clone(),
                state: reg.state,
                command_url: None,
                menu_preset: None,
                handles: Default::default(),
                player: PlayerKind::Remote,
                from_config: false,
                initial_hidden: false,
            }),
            active_source: self.active_id.clone(),
        }
    }

    fn preceding_configured_entry(&self, id: &str) -> Option<String> {
        let pos = self.menu_order.iter().position(|x| x == id)?;
        self.menu_order[..pos]
            .iter()
            .rev()
            .find(|other_id| {
                self.sources
                    .get(*other_id)
                    .map(|s| s.from_config)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let menu = self
            .full_order
            .iter()
            .filter_map(|slot| match slot {
                FullSlot::Fixed(entry) => Some(entry.clone()),
                FullSlot::SourceId(id) => {
                    let s = self.sources.get(id)?;
                    if !s.visible() {
                        return None;
                    }
                    Some(MenuEntry {
                        id: s.id.clone(),
                        title: s.name.clone(),
                        kind: MenuEntryKind::Source,
                        hidden: false,
                        from_config: s.from_config,
                    })
                }
            })
            .collect();
        RegistrySnapshot {
            menu,
            active_source: self.active_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use crate::volume::passthrough::Passthrough;
    use crate::volume::Common;

    fn test_volume() -> Arc<dyn VolumeOutput> {
        Common::new(Passthrough::new(), 100, 40, Duration::from_millis(5))
    }

    fn registration(id: &str, state: SourceState) -> SourceRegistration {
        SourceRegistration {
            id: id.to_string(),
            state,
            name: Some(id.to_string()),
            command_url: Some(format!("http://localhost:0/{}", id)),
            menu_preset: None,
            handles: None,
            player: Some(PlayerKind::Remote),
            navigate: false,
            auto_power: false,
        }
    }

    #[tokio::test]
    async fn at_most_one_active_source() {
        let bus = create_bus();
        let handle = spawn(bus, Vec::new(), test_volume());

        handle
            .register(registration("cd", SourceState::Playing))
            .await;
        let outcome = handle
            .register(registration("spotify", SourceState::Playing))
            .await;

        assert_eq!(outcome.active_source.as_deref(), Some("spotify"));
        let cd = handle.get("cd").await;
        assert!(cd.is_some());
    }

    #[tokio::test]
    async fn gone_clears_active_slot() {
        let bus = create_bus();
        let handle = spawn(bus, Vec::new(), test_volume());
        handle
            .register(registration("cd", SourceState::Playing))
            .await;
        let outcome = handle.register(registration("cd", SourceState::Gone)).await;
        assert_eq!(outcome.active_source, None);
    }

    #[tokio::test]
    async fn idempotent_available_registration_does_not_duplicate() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let handle = spawn(bus.clone(), Vec::new(), test_volume());

        handle
            .register(registration("usb", SourceState::Available))
            .await;
        handle
            .register(registration("usb", SourceState::Available))
            .await;

        let mut add_count = 0;
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::MenuItem {
                action: MenuItemAction::Add,
                ..
            } = event
            {
                add_count += 1;
            }
        }
        assert_eq!(add_count, 1);
    }

    #[tokio::test]
    async fn static_views_and_web_pages_never_go_missing() {
        let bus = create_bus();
        let seeds = vec![
            MenuSeed::Fixed(MenuEntry {
                id: "showing".into(),
                title: "showing".into(),
                kind: MenuEntryKind::StaticView,
                hidden: false,
                from_config: true,
            }),
            MenuSeed::Source(ConfigSourceSeed {
                id: "cd".into(),
                name: "cd".into(),
                menu_preset: None,
                initial_hidden: false,
            }),
            MenuSeed::Fixed(MenuEntry {
                id: "recipes".into(),
                title: "Recipes".into(),
                kind: MenuEntryKind::WebPage {
                    url: "http://example/recipes".into(),
                },
                hidden: false,
                from_config: true,
            }),
        ];
        let handle = spawn(bus, seeds, test_volume());

        // "cd" hasn't registered yet (state Gone), so only the two
        // fixed entries should be visible, in their configured order.
        let snapshot = handle.snapshot().await;
        let ids: Vec<&str> = snapshot.menu.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["showing", "recipes"]);

        handle
            .register(registration("cd", SourceState::Available))
            .await;
        let snapshot = handle.snapshot().await;
        let ids: Vec<&str> = snapshot.menu.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["showing", "cd", "recipes"]);
    }
}
