//! Acquisition contract
//!
//! A [`PageSource`] hands out one isolated [`AcquisitionSession`] per
//! listing. A session navigates to the listing URL, waits for the price
//! element and returns its raw text. Every operation is async and receives
//! its timeouts through [`AcquisitionPolicy`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::infrastructure::config::defaults;

/// When a navigation is considered complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadCondition {
    /// The `load` event has fired
    #[default]
    Load,
    /// `document.readyState` has left `loading`
    DomContentLoaded,
    /// Load event plus no new network resources for a quiet period
    NetworkIdle,
}

impl fmt::Display for LoadCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::DomContentLoaded => "dom_content_loaded",
            Self::NetworkIdle => "network_idle",
        };
        f.write_str(name)
    }
}

/// Timeouts and load condition for one acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionPolicy {
    pub load_condition: LoadCondition,
    pub navigation_timeout: Duration,
    pub selector_timeout: Duration,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            load_condition: LoadCondition::default(),
            navigation_timeout: Duration::from_secs(defaults::NAVIGATION_TIMEOUT_SECS),
            selector_timeout: Duration::from_secs(defaults::SELECTOR_TIMEOUT_SECS),
        }
    }
}

/// Per-listing acquisition failures. None of these abort a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("invalid listing URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("navigation to {url} did not finish within {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },

    #[error("price element '{selector}' did not appear within {timeout:?}")]
    SelectorTimeout { selector: String, timeout: Duration },

    #[error("price element '{selector}' has no text content")]
    EmptyContent { selector: String },

    #[error("price text '{raw}' is not a valid price: {reason}")]
    NormalizationFailure { raw: String, reason: String },

    #[error("browser error: {message}")]
    Browser { message: String },
}

impl AcquisitionError {
    pub fn browser(message: impl fmt::Display) -> Self {
        Self::Browser {
            message: message.to_string(),
        }
    }

    /// Whether another attempt in a fresh context may succeed.
    ///
    /// Selector timeouts, empty content and unreadable prices point at a
    /// block page or a markup change and are not retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NavigationTimeout { .. } | Self::Browser { .. })
    }

    /// Short stable label for logs and reports
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "invalid_url",
            Self::NavigationTimeout { .. } => "navigation_timeout",
            Self::SelectorTimeout { .. } => "selector_timeout",
            Self::EmptyContent { .. } => "empty_content",
            Self::NormalizationFailure { .. } => "normalization_failure",
            Self::Browser { .. } => "browser",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserHostError {
    #[error("failed to configure browser: {reason}")]
    Config { reason: String },

    #[error("failed to launch browser: {reason}")]
    Launch { reason: String },

    #[error("browser did not start within {timeout:?}")]
    LaunchTimeout { timeout: Duration },
}

/// One isolated browsing context, used for a single listing attempt
#[async_trait]
pub trait AcquisitionSession: Send {
    /// Navigate to `url`, wait for `selector` and return the element's raw text
    async fn acquire(&mut self, url: &str, selector: &str, policy: &AcquisitionPolicy) -> Result<String, AcquisitionError>;

    /// Full-page PNG of the context's current state
    async fn snapshot(&mut self) -> Result<Vec<u8>, AcquisitionError>;

    /// Release the context. Safe to call more than once.
    async fn close(&mut self);
}

/// Owner of the browser process that sessions are opened against
#[async_trait]
pub trait PageSource: Send {
    async fn start(&mut self) -> Result<(), BrowserHostError>;

    async fn open_session(&mut self) -> Result<Box<dyn AcquisitionSession>, AcquisitionError>;

    /// Stop the browser process. Must be safe to call when `start` failed.
    async fn stop(&mut self);
}
