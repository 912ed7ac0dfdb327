//! Infrastructure layer for configuration, logging, persistence and the browser
//!
//! This module provides the concrete implementations the pipeline runs on:
//! the layered configuration, the tracing setup, the JSON catalog store and
//! the chromiumoxide-backed browser host with its page sessions.

pub mod browser_host;
pub mod catalog_store;
pub mod config;
pub mod identity;
pub mod logging;
pub mod page_session;

// Re-export commonly used items
pub use browser_host::BrowserHost;
pub use catalog_store::{CatalogStore, CatalogStoreError};
pub use config::{AppConfig, BrowserSettings, ConfigError};
pub use identity::{IdentityKind, IdentityStrategy, identity_for};
pub use logging::{init_logging, log_system_info};
pub use page_session::{BlockedResource, PageSession};
