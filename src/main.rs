use tidemq::config::Config;
use tidemq::logging::init_logging;
use tidemq::TideEngine;
use tracing::{error, info};

// ========================================
// MAIN ENTRY POINT
// ========================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::global();
    init_logging(&config.broker.log_level);

    std::fs::create_dir_all(&config.broker.data_dir)?;
    let engine = TideEngine::new(config);

    info!(
        "tidemq v{} started (data dir: {}, auto-create: {})",
        env!("CARGO_PKG_VERSION"),
        config.broker.data_dir,
        config.broker.auto_create_queues
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {}", e);
    }

    info!("Shutting down after {:?}", engine.start_time.elapsed());
    engine.shutdown().await;
    Ok(())
}
