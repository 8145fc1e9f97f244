use quota_rs::api::ApiServer;
use quota_rs::config::Config;
use quota_rs::services::QuotaServices;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "quota.toml".to_string());
    let config = Config::load(Some(&config_path))?;

    quota_rs::logging::init(&config.logging);

    info!("Starting quota-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  Database: {}", config.database.url);
    info!("  Default allocation: {} bytes", config.quota.default_allocated_bytes);
    info!("  API listening on: {}", config.api.listen_addr);

    let services = QuotaServices::connect(&config).await?;

    // Projections may trail the ledger after an interrupted request
    let report = services.projections.catch_up_all().await?;
    info!(
        "Projection catch-up: {} streams, {} events applied",
        report.streams, report.events_applied
    );
    for (user, error) in &report.failures {
        warn!("Projections for {} still behind: {}", user, error);
    }

    let server = ApiServer::new(services.projections.clone(), config.api.listen_addr.clone());
    server.run().await?;

    Ok(())
}
