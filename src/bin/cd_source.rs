//! `cd-source` binary: the CD source process (§4.8). Composes
//! `SourceBase` and `PlayerBase` directly — CD is its own local player.

use beocontrol::config;
use beocontrol::sources::cd::{
    build_router, AudioOutputs, CdSource, CdSourceConfig, FilesystemDrive, HttpAudioOutputs,
    HttpMetadataProvider, NoopAudioOutputs,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        "starting beocontrol cd-source v{} ({})",
        env!("BEOCONTROL_VERSION"),
        env!("BEOCONTROL_GIT_SHA")
    );

    let config = config::load_config()?;
    let router_base_url = format!("http://localhost:{}", config.router_port);
    let ui_base_url = config.ui_bridge_url.clone();

    let drive = Arc::new(FilesystemDrive::new(
        config.cd.device_path.clone(),
        config.cd.toc_probe_binary.clone(),
    ));
    if let Err(e) = tokio::fs::create_dir_all(&config.cd.cache_dir).await {
        tracing::warn!("could not create cache dir {}: {e}", config.cd.cache_dir);
    }
    let metadata = Arc::new(HttpMetadataProvider::new(config.cd.metadata_base_url.clone()));
    let audio_outputs: Arc<dyn AudioOutputs> = match &config.cd.airplay_sink {
        Some(sink) => Arc::new(HttpAudioOutputs::new(router_base_url.clone(), sink.clone())),
        None => Arc::new(NoopAudioOutputs),
    };

    let source = CdSource::new(
        CdSourceConfig {
            router_base_url,
            ui_base_url,
            port: config.cd.port,
            player_binary: config.cd.player_binary.clone(),
            cache_dir: config.cd.cache_dir.clone().into(),
            rip_root: config.cd.rip_root.clone().into(),
        },
        drive,
        metadata,
        audio_outputs,
    );

    let shutdown = CancellationToken::new();
    let watcher = tokio::spawn(source.clone().run(shutdown.clone()));
    tokio::spawn(beocontrol::watchdog::watchdog_loop(
        shutdown.clone(),
        beocontrol::watchdog::default_interval(),
    ));

    let app = build_router(source);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.cd.port)).await?;
    tracing::info!("cd-source listening on :{}", config.cd.port);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("cd-source received shutdown signal");
    });

    if let Err(e) = serve.await {
        tracing::error!("cd-source server error: {e}");
    }

    shutdown.cancel();
    let _ = watcher.await;
    Ok(())
}
