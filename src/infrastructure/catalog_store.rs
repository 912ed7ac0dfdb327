//! Catalog persistence
//!
//! The catalog is read in full at the start of a run and written in full at
//! the end. Writes go to a sibling temporary file that is then renamed over
//! the target, so an interrupted write leaves the previous document intact.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::domain::{Catalog, CatalogFormatError};

#[derive(Error, Debug)]
pub enum CatalogStoreError {
    #[error("failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("catalog {path} has an unsupported structure: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: CatalogFormatError,
    },

    #[error("failed to serialize catalog: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write catalog {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Catalog, CatalogStoreError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CatalogStoreError::Read {
                path: self.path.clone(),
                source,
            })?;

        let document: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|source| CatalogStoreError::Parse {
                path: self.path.clone(),
                source,
            })?;

        let catalog = Catalog::from_value(document).map_err(|source| CatalogStoreError::Format {
            path: self.path.clone(),
            source,
        })?;

        info!(
            "📂 Loaded catalog {} ({:?} layout, {:?} keys, {} brands, {} listings)",
            self.path.display(),
            catalog.layout,
            catalog.naming,
            catalog.brands.len(),
            catalog.listing_count()
        );
        Ok(catalog)
    }

    /// Render the document exactly as it will be persisted
    pub fn render(catalog: &Catalog) -> Result<String, CatalogStoreError> {
        Ok(serde_json::to_string_pretty(&catalog.to_value())?)
    }

    pub async fn save(&self, catalog: &Catalog) -> Result<(), CatalogStoreError> {
        let rendered = Self::render(catalog)?;
        let temp_path = self.temp_path();
        let write_error = |source| CatalogStoreError::Write {
            path: self.path.clone(),
            source,
        };

        let mut file = tokio::fs::File::create(&temp_path).await.map_err(write_error)?;
        file.write_all(rendered.as_bytes()).await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        if let Err(source) = tokio::fs::rename(&temp_path, &self.path).await {
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                debug!("Could not remove temporary catalog {}: {}", temp_path.display(), e);
            }
            return Err(write_error(source));
        }

        info!("💾 Saved catalog {} ({} bytes)", self.path.display(), rendered.len());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog.json".to_string());
        self.path.with_file_name(format!(".{file_name}.tmp"))
    }
}
