//! Parking relay - bridges parking-lot field devices and the facility-management backend
//!
//! Module structure:
//! - `domain/` - Facility table, inbound message classification, backend payloads
//! - `io/` - Device registry, dispatcher, UI notifier, backend client, HTTP endpoint
//! - `infra/` - Config, Metrics

use clap::Parser;
use parking_relay::infra::{Config, Metrics};
use parking_relay::io::{
    create_notify_channel, BackendClient, ConnectionRegistry, DisabledNotifier, InboundDispatcher,
    MqttNotifier, RegistryConfig, UiNotifier,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parking relay - device gateway for parking facilities
#[derive(Parser, Debug)]
#[command(name = "parking-relay", version, about)]
struct Args {
    /// Path to TOML configuration file (overrides CONFIG_FILE)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("parking-relay starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        backend = %config.backend_base_url(),
        devices = %config.device_count(),
        framing = ?config.devices().framing,
        reconnect_delay_ms = %config.devices().reconnect_delay_ms,
        notifier_enabled = %config.notifier().enabled,
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let facilities = Arc::new(config.facility_table());

    // UI notifications
    let notifier: Arc<dyn UiNotifier> = if config.notifier().enabled {
        let (sender, notify_rx) = create_notify_channel(config.notifier().queue);
        let publisher = MqttNotifier::new(config.notifier(), notify_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        Arc::new(sender)
    } else {
        Arc::new(DisabledNotifier)
    };

    // Facility lookups from the dispatcher go through the registry
    let dispatch_metrics = metrics.clone();
    let registry = ConnectionRegistry::with_handler(
        RegistryConfig::from_config(&config),
        facilities.clone(),
        metrics.clone(),
        move |resolver| Arc::new(InboundDispatcher::new(resolver, notifier, dispatch_metrics)),
    );

    // Failing to build the device I/O pool is fatal
    registry.configure(config.device_count())?;

    for facility in facilities.facilities() {
        match registry.connect(&facility.ip, facility.port).await {
            Ok(state) => info!(
                host = %facility.ip,
                port = %facility.port,
                facility = %facility.facilities_id,
                state = ?state,
                "device_connect_initiated"
            ),
            Err(e) => {
                error!(host = %facility.ip, port = %facility.port, error = %e, "device_connect_failed");
                return Err(e.into());
            }
        }
    }

    let backend = BackendClient::new(config.backend(), metrics.clone(), Handle::current())?;
    match backend.request_display_init_message().await {
        Ok(envelope) => info!(code = envelope.code, data = %envelope.data, "display_init_message"),
        Err(e) => warn!(error = format!("{e:#}"), "display_init_message_unavailable"),
    }

    // Operator HTTP endpoint (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let http_metrics = metrics.clone();
        let http_registry = registry.clone();
        let http_shutdown = shutdown_rx.clone();
        let site_id = config.site_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = parking_relay::io::prometheus::start_metrics_server(
                http_port,
                http_metrics,
                site_id,
                http_registry,
                http_shutdown,
            )
            .await
            {
                error!(error = %e, "metrics_server_error");
            }
        });
    }

    // Periodic metrics log line
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);
    registry.shutdown();

    info!("parking-relay shutdown complete");
    Ok(())
}
