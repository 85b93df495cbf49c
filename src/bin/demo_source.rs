//! `demo-source` binary: a minimal source with no player, proving
//! `SourceBase` is a reusable library surface outside of CD.

use beocontrol::config;
use beocontrol::sources::demo::{build_router, DemoSource};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        "starting beocontrol demo-source v{} ({})",
        env!("BEOCONTROL_VERSION"),
        env!("BEOCONTROL_GIT_SHA")
    );

    let config = config::load_config()?;
    let router_base_url = format!("http://localhost:{}", config.router_port);
    let ui_base_url = config.ui_bridge_url.clone();

    let source = DemoSource::new(config.demo.port, router_base_url, ui_base_url);
    source.register_initial().await;

    let shutdown = CancellationToken::new();
    tokio::spawn(beocontrol::watchdog::watchdog_loop(
        shutdown.clone(),
        beocontrol::watchdog::default_interval(),
    ));

    let app = build_router(source);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.demo.port)).await?;
    tracing::info!("demo-source listening on :{}", config.demo.port);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("demo-source received shutdown signal");
    });

    if let Err(e) = serve.await {
        tracing::error!("demo-source server error: {e}");
    }

    shutdown.cancel();
    Ok(())
}
