//! Configuration infrastructure
//!
//! Contains configuration loading and validation for the price tracker.
//!
//! Configuration is layered, later layers overriding earlier ones:
//! 1. Built-in defaults (the `defaults` constants below)
//! 2. `config.toml` in the user configuration directory, if present
//! 3. An explicitly given configuration file (TOML, JSON or YAML)
//! 4. `PRICE_TRACKER__<SECTION>__<KEY>` environment variables

#![allow(clippy::uninlined_format_args)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::crawling::acquisition::{AcquisitionPolicy, LoadCondition};
use crate::infrastructure::identity::IdentityKind;
use crate::infrastructure::page_session::BlockedResource;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "PRICE_TRACKER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {source}")]
    FileLoad {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the tracked catalog is persisted
    pub catalog: CatalogConfig,

    /// Browser process and page identity
    pub browser: BrowserSettings,

    /// Per-listing acquisition policy
    pub acquisition: AcquisitionConfig,

    /// Failure snapshots
    pub diagnostics: DiagnosticsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Path of the catalog JSON document, read at start and rewritten at end
    pub path: PathBuf,
}

/// Browser host settings, fixed for the lifetime of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Chrome/Chromium binary; auto-detected when unset
    pub executable: Option<PathBuf>,

    /// Run without a visible window
    pub headless: bool,

    /// Flags for constrained or containerized environments
    pub hardened_args: Vec<String>,

    /// Additional command-line flags appended after the hardened ones
    pub extra_args: Vec<String>,

    /// Identity strategy presented to retailer sites
    pub identity: IdentityKind,

    /// Overrides the identity strategy's user agent
    pub user_agent: Option<String>,

    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Subresource types aborted before they are fetched (empty = no filtering)
    pub block_resources: Vec<BlockedResource>,

    /// Upper bound for the browser process to come up
    pub launch_timeout_secs: u64,

    /// Upper bound for any single CDP command
    pub request_timeout_secs: u64,
}

/// Acquisition policy applied to every listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// When a page counts as loaded
    pub load_condition: LoadCondition,

    /// Hard timeout for navigation
    pub navigation_timeout_secs: u64,

    /// Timeout for the price element to appear
    pub selector_timeout_secs: u64,

    /// Extra attempts for retryable failures (0 = single attempt)
    pub retry_attempts: u32,

    /// Pause before a retry in milliseconds
    pub retry_delay_ms: u64,

    /// Pause between consecutive listings in milliseconds
    pub listing_delay_ms: u64,

    /// Random extra pause, up to this many milliseconds
    pub listing_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Capture a full-page snapshot when a listing fails
    pub enabled: bool,

    /// Directory snapshots are written to
    pub directory: PathBuf,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Directory for the log file
    pub directory: PathBuf,

    /// Log file name inside `directory`
    pub file_name: String,

    /// Fixed offset from UTC used for log timestamps, in hours
    pub utc_offset_hours: i32,

    /// Module-specific log level filters (e.g., "chromiumoxide": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::CATALOG_PATH),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            hardened_args: defaults::HARDENED_ARGS.iter().map(ToString::to_string).collect(),
            extra_args: Vec::new(),
            identity: IdentityKind::default(),
            user_agent: None,
            viewport_width: defaults::VIEWPORT_WIDTH,
            viewport_height: defaults::VIEWPORT_HEIGHT,
            block_resources: Vec::new(),
            launch_timeout_secs: defaults::LAUNCH_TIMEOUT_SECS,
            request_timeout_secs: defaults::CDP_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            load_condition: LoadCondition::default(),
            navigation_timeout_secs: defaults::NAVIGATION_TIMEOUT_SECS,
            selector_timeout_secs: defaults::SELECTOR_TIMEOUT_SECS,
            retry_attempts: defaults::RETRY_ATTEMPTS,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            listing_delay_ms: defaults::LISTING_DELAY_MS,
            listing_jitter_ms: defaults::LISTING_JITTER_MS,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(defaults::DIAGNOSTICS_DIR),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            directory: PathBuf::from(defaults::LOG_DIR),
            file_name: defaults::LOG_FILE_NAME.to_string(),
            utc_offset_hours: 0,
            module_filters: defaults::NOISY_MODULES
                .iter()
                .map(|module| ((*module).to_string(), "warn".to_string()))
                .collect(),
        }
    }
}

impl AcquisitionConfig {
    /// Timeouts and load condition threaded into every acquisition call
    #[must_use]
    pub const fn policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy {
            load_condition: self.load_condition,
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            selector_timeout: Duration::from_secs(self.selector_timeout_secs),
        }
    }
}

impl AppConfig {
    /// Location of the per-user configuration file
    #[must_use]
    pub fn user_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("price-tracker").join("config.toml"))
    }

    /// Load layered configuration and validate it
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(user_file) = Self::user_config_file() {
            builder = builder.add_source(config::File::from(user_file).required(false));
        }
        if let Some(path) = explicit {
            info!("📄 Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let acquisition = &self.acquisition;
        if acquisition.navigation_timeout_secs == 0 || acquisition.selector_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                message: "acquisition timeouts must be greater than zero".to_string(),
            });
        }
        if acquisition.selector_timeout_secs > acquisition.navigation_timeout_secs {
            return Err(ConfigError::Validation {
                message: format!(
                    "selector timeout ({}s) cannot exceed navigation timeout ({}s)",
                    acquisition.selector_timeout_secs, acquisition.navigation_timeout_secs
                ),
            });
        }

        let browser = &self.browser;
        if browser.viewport_width == 0 || browser.viewport_height == 0 {
            return Err(ConfigError::Validation {
                message: format!(
                    "viewport must be positive, got {}x{}",
                    browser.viewport_width, browser.viewport_height
                ),
            });
        }
        if browser.launch_timeout_secs == 0 || browser.request_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                message: "browser timeouts must be greater than zero".to_string(),
            });
        }
        if browser.user_agent.as_deref().is_some_and(|ua| ua.trim().is_empty()) {
            return Err(ConfigError::Validation {
                message: "browser.user_agent is set but empty".to_string(),
            });
        }

        if self.catalog.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: "catalog.path must not be empty".to_string(),
            });
        }

        let logging = &self.logging;
        if !logging.console_output && !logging.file_output {
            return Err(ConfigError::Validation {
                message: "logging needs at least one of console_output or file_output".to_string(),
            });
        }

        Ok(())
    }
}

/// Default values
pub mod defaults {
    /// Default catalog location, relative to the working directory
    pub const CATALOG_PATH: &str = "data/catalog.json";

    /// Default diagnostics directory
    pub const DIAGNOSTICS_DIR: &str = "diagnostics";

    /// Hard navigation timeout; retail pages are slow behind anti-bot layers
    pub const NAVIGATION_TIMEOUT_SECS: u64 = 90;

    /// Price element wait
    pub const SELECTOR_TIMEOUT_SECS: u64 = 15;

    pub const RETRY_ATTEMPTS: u32 = 0;
    pub const RETRY_DELAY_MS: u64 = 2000;
    pub const LISTING_DELAY_MS: u64 = 0;
    pub const LISTING_JITTER_MS: u64 = 0;

    pub const VIEWPORT_WIDTH: u32 = 1366;
    pub const VIEWPORT_HEIGHT: u32 = 768;

    pub const LAUNCH_TIMEOUT_SECS: u64 = 30;
    pub const CDP_REQUEST_TIMEOUT_SECS: u64 = 60;

    /// Flags for running Chrome inside containers and sandboxed CI
    pub const HARDENED_ARGS: &[&str] = &[
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage",
        "--single-process",
    ];

    /// Declared desktop browser identity
    pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.0.0 Safari/537.36";

    /// Declared crawler identity
    pub const CRAWLER_USER_AGENT: &str = concat!(
        "price-tracker/",
        env!("CARGO_PKG_VERSION"),
        " (+price history crawler)"
    );

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_DIR: &str = "logs";
    pub const LOG_FILE_NAME: &str = "price-tracker.log";

    /// Dependencies whose debug output drowns the pipeline's own
    pub const NOISY_MODULES: &[&str] = &["chromiumoxide", "tungstenite", "tokio_tungstenite", "hyper"];
}
