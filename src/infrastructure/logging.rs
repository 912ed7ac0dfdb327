//! Logging system configuration and initialization
//!
//! This module provides the logging setup for a pipeline run:
//! - Console output for operators
//! - Optional non-blocking file output, plain or structured JSON
//! - Configuration based log level control, overridable through `RUST_LOG`
//! - Timestamps in a configurable fixed UTC offset

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, anyhow};
use chrono::{FixedOffset, Offset, Utc};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

// Re-export LoggingConfig from config module
pub use crate::infrastructure::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Timestamps rendered in a fixed offset from UTC
#[derive(Debug, Clone, Copy)]
pub struct OffsetTimeFormatter {
    offset: FixedOffset,
}

impl OffsetTimeFormatter {
    /// Offset in whole hours; out-of-range values fall back to UTC
    #[must_use]
    pub fn from_hours(hours: i32) -> Self {
        let offset = hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    fn render(&self, now: chrono::DateTime<Utc>) -> String {
        now.with_timezone(&self.offset)
            .format("%Y-%m-%d %H:%M:%S%.3f %:z")
            .to_string()
    }
}

impl FormatTime for OffsetTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.render(Utc::now()))
    }
}

/// Filter honouring `RUST_LOG`, otherwise the configured level with noisy modules capped
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log level '{}'", config.level))?;

    if !config.level.to_lowercase().contains("trace") {
        for (module, level) in &config.module_filters {
            let directive = format!("{}={}", module, level)
                .parse()
                .with_context(|| format!("Invalid module filter {}={}", module, level))?;
            filter = filter.add_directive(directive);
        }
    }
    Ok(filter)
}

/// Initialize logging with the given configuration.
///
/// The returned guard flushes the file writer when dropped and must be held
/// for the life of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = build_env_filter(config)?;
    let timer = OffsetTimeFormatter::from_hours(config.utc_offset_hours);

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.file_output {
        std::fs::create_dir_all(&config.directory)
            .with_context(|| format!("Failed to create log directory {:?}", config.directory))?;

        let file_appender = rolling::never(&config.directory, &config.file_name);
        let (file_writer, file_guard) = non_blocking(file_appender);
        guard = Some(file_guard);

        let file_layer = if config.json_format {
            fmt::Layer::new()
                .json()
                .with_writer(file_writer)
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::Layer::new()
                .with_writer(file_writer)
                .with_timer(timer)
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if config.console_output {
        let console_layer = fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_timer(timer)
            .with_target(false)
            .boxed();
        layers.push(console_layer);
    }

    if layers.is_empty() {
        return Err(anyhow!("No logging output configured"));
    }

    Registry::default()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install global tracing subscriber")?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    info!("Console output: {}", config.console_output);
    if config.file_output {
        info!(
            "File output: {:?} (json={})",
            config.directory.join(&config.file_name),
            config.json_format
        );
    }

    Ok(guard)
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== Price Tracker System Information ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);

    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
    info!("========================================");
}
