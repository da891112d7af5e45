//! Gavel server binary

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gavel::{GavelApp, GavelSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match std::env::var("GAVEL_CONFIG") {
        Ok(path) => GavelSettings::from_toml(&std::fs::read_to_string(path)?)?,
        Err(_) => GavelSettings::default(),
    }
    .apply_env();

    let app = GavelApp::build(settings).await?;
    let listener = app.bind().await?;
    info!(version = gavel::VERSION, addr = %listener.local_addr()?, "gavel starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    app.serve(listener, shutdown_rx).await;
    Ok(())
}
