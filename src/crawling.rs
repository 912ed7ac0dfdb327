//! # Crawling Module
//!
//! Price acquisition for every listing of the catalog:
//! - `acquisition`: session/source contract and the per-listing error taxonomy
//! - `diagnostics`: failure snapshots
//! - `state`: per-listing state machine and run report
//! - `orchestrator`: the sequential catalog pipeline

pub mod acquisition;
pub mod diagnostics;
pub mod orchestrator;
pub mod state;

// Clean re-exports
pub use acquisition::{
    AcquisitionError, AcquisitionPolicy, AcquisitionSession, BrowserHostError, LoadCondition, PageSource,
};
pub use diagnostics::{DiagnosticsCapture, DiagnosticsError};
pub use orchestrator::{CatalogPipeline, PipelineConfig, PipelineError, batch_timestamp};
pub use state::{ListingError, ListingFailure, ListingState, RunReport};
