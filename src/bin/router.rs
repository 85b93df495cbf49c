//! `router` binary: the event router process (§2, §4.1). Owns the
//! source registry, the volume adapter, the transport, and the menu
//! model; the only process exposing the `/router/*` HTTP surface.

use beocontrol::bus::create_bus;
use beocontrol::config::{self, MenuConfigEntry, STATIC_VIEWS};
use beocontrol::model::{MenuEntry, MenuEntryKind};
use beocontrol::registry::{self, ConfigSourceSeed, MenuSeed};
use beocontrol::router::{build_router, probe_known_sources, RouterState};
use beocontrol::transport::Transport;
use beocontrol::volume;
use beocontrol::watchdog::{default_interval, watchdog_loop};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Turns configured menu entries (§3 "Menu") into registry seeds: a
/// source id joins the registry's lifecycle tracking, while a static
/// view or a `url`-bearing entry is fixed menu content with no
/// lifecycle of its own.
fn seeds_from_menu(menu: &[MenuConfigEntry]) -> Vec<MenuSeed> {
    menu.iter()
        .map(|entry| {
            let id = entry.id().to_string();
            let title = entry.title();
            let hidden = entry.hidden();
            if let Some(url) = entry.url() {
                MenuSeed::Fixed(MenuEntry {
                    id,
                    title,
                    kind: MenuEntryKind::WebPage { url: url.to_string() },
                    hidden,
                    from_config: true,
                })
            } else if STATIC_VIEWS.contains(&id.as_str()) {
                MenuSeed::Fixed(MenuEntry {
                    id,
                    title,
                    kind: MenuEntryKind::StaticView,
                    hidden,
                    from_config: true,
                })
            } else {
                MenuSeed::Source(ConfigSourceSeed {
                    id,
                    name: title,
                    menu_preset: None,
                    initial_hidden: hidden,
                })
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        "starting beocontrol router v{} ({})",
        env!("BEOCONTROL_VERSION"),
        env!("BEOCONTROL_GIT_SHA")
    );

    let config = config::load_config()?;
    tracing::info!(device = %config.device, port = config.router_port, "starting router");

    let bus = create_bus();
    let seeds = seeds_from_menu(&config.menu);
    let volume = volume::build(&config.volume, &config.player);
    let registry = registry::spawn(bus.clone(), seeds, volume.clone());

    let transport = Transport::new(&config.device, &config.transport, config.home_assistant.webhook_url.clone());
    transport.start();

    let eating_views: HashSet<String> = ["system".to_string(), "showing".to_string()].into_iter().collect();
    let state = RouterState::new(
        registry,
        volume,
        transport.clone(),
        bus,
        config.volume.step,
        config.volume.balance_step,
        eating_views,
    );

    let probe_http = reqwest::Client::new();
    let probes = config.sources.clone();
    tokio::spawn(async move {
        // Startup recovery: give already-running source processes a
        // moment to have their own listeners bound before probing.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        probe_known_sources(&probe_http, &probes).await;
    });

    let shutdown = CancellationToken::new();
    let watchdog_token = shutdown.clone();
    tokio::spawn(watchdog_loop(watchdog_token, default_interval()));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.router_port)).await?;
    tracing::info!("router listening on :{}", config.router_port);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("router received shutdown signal");
    });

    if let Err(e) = serve.await {
        tracing::error!("router server error: {e}");
    }

    shutdown.cancel();
    transport.stop();
    Ok(())
}
