//! Price Tracker - Retail price history acquisition
//!
//! Visits every store listing of a persisted catalog with a headless
//! browser, extracts the displayed price, normalizes it and appends it to
//! the listing's append-only price history.

// Module declarations
pub mod crawling;
pub mod domain;
pub mod infrastructure;

use tokio_util::sync::CancellationToken;

use crate::crawling::{CatalogPipeline, PipelineError, RunReport};
use crate::infrastructure::{AppConfig, BrowserHost, CatalogStore};

/// Run the pipeline once against a real browser using the given configuration
pub async fn run(config: &AppConfig, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
    let store = CatalogStore::new(&config.catalog.path);
    let mut host = BrowserHost::new(config.browser.clone());
    let pipeline = CatalogPipeline::from_app_config(config);

    pipeline.run(&store, &mut host, cancel).await
}
