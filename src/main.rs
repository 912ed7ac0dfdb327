use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use price_tracker::infrastructure::{AppConfig, init_logging, log_system_info};

#[tokio::main]
async fn main() -> Result<()> {
    // optional first argument: configuration file
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let _log_guard = init_logging(&config.logging)?;
    log_system_info();

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let report = price_tracker::run(&config, &cancel)
        .await
        .with_context(|| format!("Price run failed for catalog {}", config.catalog.path.display()))?;

    for failure in &report.failures {
        warn!(
            "{}: {}{}",
            failure.key,
            failure.error,
            failure
                .artifact
                .as_ref()
                .map(|p| format!(" (snapshot: {})", p.display()))
                .unwrap_or_default()
        );
    }
    info!("{}", report);
    Ok(())
}
