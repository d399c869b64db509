//! Courier server - Main entry point.

use anyhow::Result;
use courier_common::config::Config;
use courier_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Courier v{}", env!("CARGO_PKG_VERSION"));

    courier_server::start_server(&config).await
}
