//! # Catalog Pipeline Orchestrator
//!
//! Loads the catalog, walks brands → models → stores in persisted order,
//! acquires one price per listing through a [`PageSource`], appends the
//! observations and writes the catalog back.
//!
//! Listings are processed strictly one at a time. A failed listing never
//! aborts the run; only catalog load/save, browser start-up and
//! cancellation are fatal.

use chrono::{DateTime, SubsecRound, Utc};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::crawling::acquisition::{
    AcquisitionError, AcquisitionPolicy, AcquisitionSession, BrowserHostError, PageSource,
};
use crate::crawling::diagnostics::DiagnosticsCapture;
use crate::crawling::state::{InvalidTransition, ListingError, ListingFailure, ListingState, RunReport};
use crate::domain::catalog::iso_millis;
use crate::domain::{Catalog, HistoryError, ListingKey, Observation, PriceFormat, PriceParseError, StoreListing};
use crate::infrastructure::catalog_store::{CatalogStore, CatalogStoreError};
use crate::infrastructure::config::{AcquisitionConfig, AppConfig, defaults};

/// Fatal run errors. Per-listing failures are reported in [`RunReport`] instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to load catalog: {0}")]
    CatalogLoad(#[source] CatalogStoreError),

    #[error("failed to save catalog: {0}")]
    CatalogSave(#[source] CatalogStoreError),

    #[error("failed to start browser: {0}")]
    BrowserStart(#[from] BrowserHostError),

    #[error("run cancelled; catalog left untouched")]
    Cancelled,

    #[error("listing state machine violated: {0}")]
    State(#[from] InvalidTransition),
}

/// Pipeline policy: acquisition timeouts, retries and pacing
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub policy: AcquisitionPolicy,

    /// Extra attempts for retryable failures
    pub retry_attempts: u32,

    pub retry_delay: Duration,

    /// Pause between consecutive listings
    pub listing_delay: Duration,

    /// Upper bound of the random pause added to `listing_delay`
    pub listing_jitter: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy: AcquisitionPolicy::default(),
            retry_attempts: defaults::RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(defaults::RETRY_DELAY_MS),
            listing_delay: Duration::from_millis(defaults::LISTING_DELAY_MS),
            listing_jitter: Duration::from_millis(defaults::LISTING_JITTER_MS),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub const fn from_acquisition(config: &AcquisitionConfig) -> Self {
        Self {
            policy: config.policy(),
            retry_attempts: config.retry_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            listing_delay: Duration::from_millis(config.listing_delay_ms),
            listing_jitter: Duration::from_millis(config.listing_jitter_ms),
        }
    }
}

enum ListingOutcome {
    Succeeded { price: u64, attempts: u32 },
    Failed(ListingFailure),
}

/// Batch timestamp shared by every observation of one run
#[must_use]
pub fn batch_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub struct CatalogPipeline {
    config: PipelineConfig,
    diagnostics: DiagnosticsCapture,
    price_format: PriceFormat,
}

impl CatalogPipeline {
    #[must_use]
    pub fn new(config: PipelineConfig, diagnostics: DiagnosticsCapture) -> Self {
        Self {
            config,
            diagnostics,
            price_format: PriceFormat::default(),
        }
    }

    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(
            PipelineConfig::from_acquisition(&config.acquisition),
            DiagnosticsCapture::from_config(&config.diagnostics),
        )
    }

    #[must_use]
    pub fn with_price_format(mut self, price_format: PriceFormat) -> Self {
        self.price_format = price_format;
        self
    }

    /// Full run: load, start the source, process every listing, stop the source, save.
    ///
    /// The source is stopped on every path once it has been started. The
    /// catalog is only written when every listing has been visited.
    pub async fn run<S>(
        &self,
        store: &CatalogStore,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError>
    where
        S: PageSource + ?Sized,
    {
        let run_id = Uuid::new_v4();
        let batch = batch_timestamp();
        let span = info_span!("run", %run_id, batch = %iso_millis::format(&batch));

        async move {
            let mut catalog = store.load().await.map_err(PipelineError::CatalogLoad)?;

            if cancel.is_cancelled() {
                warn!("🛑 Cancelled before the browser was started");
                return Err(PipelineError::Cancelled);
            }
            if let Err(e) = source.start().await {
                source.stop().await;
                return Err(e.into());
            }

            let outcome = self.process_catalog(&mut catalog, source, run_id, batch, cancel).await;
            source.stop().await;
            let report = outcome?;

            store.save(&catalog).await.map_err(PipelineError::CatalogSave)?;
            info!("🏁 {}", report);
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Visit every listing once and append successful observations in place
    pub async fn process_catalog<S>(
        &self,
        catalog: &mut Catalog,
        source: &mut S,
        run_id: Uuid,
        batch: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError>
    where
        S: PageSource + ?Sized,
    {
        let mut report = RunReport::new(run_id, batch);
        report.total = catalog.listing_count();
        info!("🚀 Processing {} listings", report.total);

        let mut visited = 0usize;
        for group in &mut catalog.brands {
            for model in &mut group.models {
                let brand = model.brand_or(&group.brand).to_string();
                for listing in &mut model.stores {
                    if cancel.is_cancelled() {
                        warn!("🛑 Run cancelled after {} of {} listings", visited, report.total);
                        return Err(PipelineError::Cancelled);
                    }
                    if visited > 0 {
                        self.pace(cancel).await?;
                    }
                    visited += 1;

                    let key = ListingKey::new(brand.as_str(), model.model.as_str(), listing.store.as_str());
                    let span = info_span!("listing", brand = %key.brand, model = %key.model, store = %key.store);

                    let outcome = tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            warn!(parent: &span, "🛑 Run cancelled during acquisition");
                            return Err(PipelineError::Cancelled);
                        }
                        outcome = self.process_listing(source, &key, listing, batch).instrument(span.clone()) => outcome?,
                    };

                    match outcome {
                        ListingOutcome::Succeeded { price, attempts } => {
                            match listing.history.append(Observation::new(batch, price)) {
                                Ok(()) => {
                                    report.succeeded += 1;
                                    info!(parent: &span, price, attempts, "✅ Price recorded");
                                }
                                Err(e) => {
                                    warn!(parent: &span, "⚠️ {}", e);
                                    report.failures.push(ListingFailure {
                                        key,
                                        error: ListingError::History(e),
                                        artifact: None,
                                        attempts,
                                    });
                                }
                            }
                        }
                        ListingOutcome::Failed(failure) => {
                            warn!(
                                parent: &span,
                                kind = failure.error.kind(),
                                attempts = failure.attempts,
                                artifact = ?failure.artifact,
                                "❌ Listing failed: {}",
                                failure.error
                            );
                            report.failures.push(failure);
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn process_listing<S>(
        &self,
        source: &mut S,
        key: &ListingKey,
        listing: &StoreListing,
        batch: DateTime<Utc>,
    ) -> Result<ListingOutcome, InvalidTransition>
    where
        S: PageSource + ?Sized,
    {
        let mut state = ListingState::Pending;

        if let Some(newest) = listing.history.newest_timestamp().filter(|newest| *newest > batch) {
            state = state.begin_attempt()?.fail()?;
            debug!("Listing {} without acquisition: newest observation {} is after batch", state.name(), newest);
            return Ok(ListingOutcome::Failed(ListingFailure {
                key: key.clone(),
                error: ListingError::History(HistoryError::OutOfOrder {
                    attempted: batch,
                    newest,
                }),
                artifact: None,
                attempts: 0,
            }));
        }

        loop {
            state = state.begin_attempt()?;
            let attempt = state.attempt().unwrap_or(1);
            debug!(attempt, url = %listing.url, "Acquiring price");

            let mut session = match source.open_session().await {
                Ok(session) => session,
                Err(error) => {
                    if self.should_retry(&error, attempt) {
                        warn!(attempt, "🔄 Could not open session, retrying: {}", error);
                        tokio::time::sleep(self.config.retry_delay).await;
                        continue;
                    }
                    state = state.fail()?;
                    debug!("Listing {}", state.name());
                    return Ok(ListingOutcome::Failed(ListingFailure {
                        key: key.clone(),
                        error: error.into(),
                        artifact: None,
                        attempts: attempt,
                    }));
                }
            };

            let result = match session
                .acquire(&listing.url, &listing.price_selector, &self.config.policy)
                .await
            {
                Ok(raw) => self.normalize(&raw, &listing.price_selector),
                Err(error) => Err(error),
            };

            match result {
                Ok(price) => {
                    session.close().await;
                    state = state.succeed(price)?;
                    debug!("Listing {}", state.name());
                    return Ok(ListingOutcome::Succeeded { price, attempts: attempt });
                }
                Err(error) if self.should_retry(&error, attempt) => {
                    warn!(attempt, "🔄 Retryable failure, retrying in a fresh context: {}", error);
                    session.close().await;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(error) => {
                    let artifact = self.capture_diagnostics(session.as_mut(), key).await;
                    session.close().await;
                    state = state.fail()?;
                    debug!("Listing {}", state.name());
                    return Ok(ListingOutcome::Failed(ListingFailure {
                        key: key.clone(),
                        error: error.into(),
                        artifact,
                        attempts: attempt,
                    }));
                }
            }
        }
    }

    fn normalize(&self, raw: &str, selector: &str) -> Result<u64, AcquisitionError> {
        self.price_format.normalize(Some(raw)).map_err(|e| match e {
            PriceParseError::Empty => AcquisitionError::EmptyContent {
                selector: selector.to_string(),
            },
            other => AcquisitionError::NormalizationFailure {
                raw: raw.trim().to_string(),
                reason: other.to_string(),
            },
        })
    }

    const fn should_retry(&self, error: &AcquisitionError, attempt: u32) -> bool {
        error.is_retryable() && attempt <= self.config.retry_attempts
    }

    async fn capture_diagnostics(&self, session: &mut dyn AcquisitionSession, key: &ListingKey) -> Option<PathBuf> {
        match self.diagnostics.capture(session, key, Utc::now()).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("⚠️ Diagnostics capture failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn pace(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let jitter_ms = u64::try_from(self.config.listing_jitter.as_millis()).unwrap_or(u64::MAX);
        let delay = self.config.listing_delay + Duration::from_millis(fastrand::u64(0..=jitter_ms));
        if delay.is_zero() {
            return Ok(());
        }

        debug!("Waiting {:?} before next listing", delay);
        tokio::select! {
            () = cancel.cancelled() => Err(PipelineError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(retry_attempts: u32) -> CatalogPipeline {
        let config = PipelineConfig {
            retry_attempts,
            ..PipelineConfig::default()
        };
        CatalogPipeline::new(config, DiagnosticsCapture::disabled())
    }

    #[test]
    fn empty_text_maps_to_empty_content() {
        let result = pipeline(0).normalize("   ", ".price");
        assert_eq!(
            result,
            Err(AcquisitionError::EmptyContent {
                selector: ".price".to_string()
            })
        );
    }

    #[test]
    fn unreadable_text_maps_to_normalization_failure() {
        let result = pipeline(0).normalize(" Agotado ", ".price");
        assert!(matches!(
            result,
            Err(AcquisitionError::NormalizationFailure { ref raw, .. }) if raw == "Agotado"
        ));
        assert_eq!(pipeline(0).normalize("$45.990", ".price"), Ok(45_990));
    }

    #[test]
    fn retries_are_bounded_by_configuration() {
        let timeout = AcquisitionError::NavigationTimeout {
            url: "https://a.example".to_string(),
            timeout: Duration::from_secs(1),
        };
        let selector = AcquisitionError::SelectorTimeout {
            selector: ".p".to_string(),
            timeout: Duration::from_secs(1),
        };

        assert!(!pipeline(0).should_retry(&timeout, 1));
        assert!(pipeline(2).should_retry(&timeout, 1));
        assert!(pipeline(2).should_retry(&timeout, 2));
        assert!(!pipeline(2).should_retry(&timeout, 3));
        assert!(!pipeline(2).should_retry(&selector, 1));
    }

    #[test]
    fn batch_timestamp_has_millisecond_precision() {
        let batch = batch_timestamp();
        assert_eq!(batch.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
