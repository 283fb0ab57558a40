use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use wattbench::bench::TestBench;
use wattbench::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    wattbench::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Wattbench lab bench service starting up");

    let web_host = config.web.host.clone();
    let web_port = config.web.port;

    let bench = Arc::new(
        TestBench::start(config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start test bench: {}", e))?,
    );

    // Spawn web server
    let web_bench = Arc::clone(&bench);
    let web_task = tokio::spawn(async move {
        if let Err(e) = wattbench::web::serve(web_bench, &web_host, web_port).await {
            error!("Web server error: {}", e);
        }
    });

    // Run until interrupted, then release the instruments in order
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    web_task.abort();
    bench.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
