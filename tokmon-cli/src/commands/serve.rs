use anyhow::Result;
use colored::Colorize;
use std::sync::Arc;
use tokmon_core::http::{self, GatewayState};
use tokmon_core::relay::{HubConfig, RelayHub};
use tokmon_core::repo::MemoryStore;
use tokmon_core::services::AggregationService;
use tokmon_core::{init_database, BeamConfig, Database};
use tracing::{info, warn};

/// Config files and environment first, then command-line overrides, then
/// validation. A missing port fails here, before anything binds.
pub fn load_serve_config(port: Option<u16>, host: Option<String>) -> Result<BeamConfig> {
    let mut config = BeamConfig::load_unvalidated()?;

    if let Some(port) = port {
        config.relay.port = Some(port);
    }
    if let Some(host) = host {
        config.relay.host = host;
    }

    config.validate()?;
    Ok(config)
}

pub async fn cmd_serve(config: BeamConfig) -> Result<()> {
    let addr = config.relay.bind_addr()?;

    let (service, database) = build_service(&config).await?;
    let service = service.with_store_timeout(config.aggregation.store_timeout());

    let hub = RelayHub::new(HubConfig::from(&config.relay));
    let state = GatewayState::new(Arc::new(service), hub);
    let listener = http::bind(&addr).await?;

    println!("{}", "tokmon-beam".cyan().bold());
    println!("{}", "═".repeat(40).dimmed());
    println!("  {:<12} ws://{}/", "Relay:".bold(), addr);
    println!("  {:<12} http://{}/api", "Gateway:".bold(), addr);
    println!(
        "  {:<12} {}",
        "Store:".bold(),
        if database.is_some() {
            "postgres".green()
        } else {
            "memory".yellow()
        }
    );
    println!();
    println!("  Press {} to stop.", "Ctrl+C".cyan());

    http::serve(listener, state, shutdown_signal()).await?;

    if let Some(db) = database {
        db.close().await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn build_service(config: &BeamConfig) -> Result<(AggregationService, Option<Database>)> {
    if config.uses_database() {
        let db = init_database(&config.database).await?;
        let service = AggregationService::with_store(Arc::new(db.store()));
        Ok((service, Some(db)))
    } else {
        warn!("No database.url configured, summaries are kept in memory only");
        let service = AggregationService::with_store(Arc::new(MemoryStore::new()));
        Ok((service, None))
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
