use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use waaah_core::api::ApiServer;
use waaah_core::config::Config;
use waaah_core::context::Context;
use waaah_core::monitoring::{MonitoringConfig, SystemMonitor};
use waaah_core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting waaah-core");

    let config = Config::load()?;
    let context = Context::build(config).await?;

    let scheduler = context.scheduler();
    tokio::spawn(scheduler.run());

    let monitor = Arc::new(SystemMonitor::new(
        MonitoringConfig::default(),
        context.db.clone(),
        context.registry.clone(),
        context.tick_latency.clone(),
    ));
    monitor.start_monitoring().await?;

    let server = ApiServer::new(context, monitor.clone());
    if let Err(e) = server.run().await {
        error!(error = %e, "API server failed");
        return Err(e);
    }

    monitor.shutdown().await;
    Ok(())
}
