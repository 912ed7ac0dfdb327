//! Diagnostics capture
//!
//! On a failed acquisition the orchestrator asks for a full-page snapshot of
//! the session before it is released. The artifact name encodes the listing
//! identity and the capture time so that an operator can tell a markup
//! change from a challenge page without re-running the pipeline.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::crawling::acquisition::{AcquisitionError, AcquisitionSession};
use crate::domain::ListingKey;
use crate::infrastructure::config::DiagnosticsConfig;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("snapshot capture failed: {0}")]
    Snapshot(#[from] AcquisitionError),

    #[error("failed to create diagnostics directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct DiagnosticsCapture {
    directory: PathBuf,
    enabled: bool,
}

impl DiagnosticsCapture {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            enabled: true,
        }
    }

    #[must_use]
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            enabled: config.enabled,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            directory: PathBuf::new(),
            enabled: false,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `error-<store>-<brand>-<model>-<yyyymmddThhmmssmmmZ>.png`
    #[must_use]
    pub fn artifact_name(key: &ListingKey, captured_at: DateTime<Utc>) -> String {
        format!(
            "error-{}-{}-{}-{}.png",
            slug(&key.store),
            slug(&key.brand),
            slug(&key.model),
            captured_at.format("%Y%m%dT%H%M%S%3fZ")
        )
    }

    /// Snapshot the session and persist it; `Ok(None)` when capture is disabled
    pub async fn capture(
        &self,
        session: &mut dyn AcquisitionSession,
        key: &ListingKey,
        captured_at: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, DiagnosticsError> {
        if !self.enabled {
            return Ok(None);
        }

        let png = session.snapshot().await?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| DiagnosticsError::CreateDir {
                path: self.directory.clone(),
                source,
            })?;

        let path = self.directory.join(Self::artifact_name(key, captured_at));
        tokio::fs::write(&path, &png)
            .await
            .map_err(|source| DiagnosticsError::Write {
                path: path.clone(),
                source,
            })?;

        debug!("Saved diagnostics snapshot ({} bytes) to {}", png.len(), path.display());
        Ok(Some(path))
    }
}

/// File-name-safe form of an identity component
fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
