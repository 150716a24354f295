use std::sync::Arc;

use anyhow::Context;
use edp_solar_bridge::{
    Broker, BrokerEvents, CognitoProvider, DirectoryClient, MqttBroker, SessionCoordinator,
    Settings, TelemetryAggregator,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    info!("Starting EDP solar bridge");
    let settings = Settings::from_env()?;

    let provider = Arc::new(CognitoProvider::new(settings.provider_settings()));
    let directory = DirectoryClient::new(settings.directory_url.clone());
    let (host, region) = (settings.iot_host.clone(), settings.region.clone());

    let coordinator = SessionCoordinator::start(
        &settings,
        provider,
        directory,
        move |events: Arc<dyn BrokerEvents>| {
            Arc::new(MqttBroker::new(host, region, events)) as Arc<dyn Broker>
        },
    )
    .await
    .context("Failed to establish the telemetry session")?;

    let observer = tokio::spawn(report_snapshots(
        coordinator.subscribe(),
        coordinator.aggregator(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    observer.abort();
    coordinator.shutdown().await;
    Ok(())
}

/// Logs a snapshot line for every aggregator notification
async fn report_snapshots(
    mut notifications: broadcast::Receiver<()>,
    aggregator: Arc<TelemetryAggregator>,
) {
    loop {
        match notifications.recv().await {
            Ok(()) => match serde_json::to_string(&aggregator.get_values()) {
                Ok(snapshot) => info!(%snapshot, "telemetry updated"),
                Err(e) => warn!(error = %e, "could not render snapshot"),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "observer fell behind, reading latest values");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
