//! Service entry point: configuration, tracing, bootstrap, graceful
//! shutdown.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use civitas::api;
use civitas::{App, ServiceConfig};

fn load_config() -> anyhow::Result<ServiceConfig> {
    let config = match std::env::var("CIVITAS_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            ServiceConfig::from_toml(&raw).with_context(|| format!("parsing config file {path}"))?
        }
        Err(_) => ServiceConfig::default(),
    };
    Ok(config.apply_env())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("civitas=info")),
        )
        .json()
        .init();

    let config = load_config()?;
    let bind_addr = config.http.bind_addr.clone();

    let mut app = App::connect(config).await.context("connecting backends")?;
    app.start_background();

    let router = api::router(app.context.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(version = civitas::VERSION, addr = %bind_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    // In-flight requests finished; drain workers and close up.
    app.shutdown().await;
    info!("bye");
    Ok(())
}
