//! Signaling-Relay als eigenständiger Prozess

use anyhow::Context;
use pulse_calls::config::RelayConfig;
use pulse_calls::signaling::RelayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pulse_calls::init_tracing();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    tracing::info!("Starting signaling relay with {:?}", config);

    let server = RelayServer::new(config);
    let listener = server.bind().await.context("failed to bind relay address")?;

    tokio::select! {
        result = server.serve(listener) => result.context("relay stopped")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down signaling relay"),
    }
    Ok(())
}
