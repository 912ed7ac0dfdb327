//! Per-listing state machine and run report

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::crawling::acquisition::AcquisitionError;
use crate::domain::{HistoryError, ListingKey};

/// Lifecycle of one listing within a run: `Pending → Acquiring → {Succeeded, Failed}`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ListingState {
    #[default]
    Pending,
    Acquiring { attempt: u32 },
    Succeeded { price: u64 },
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid listing transition from {from} via {event}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: &'static str,
}

impl ListingState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acquiring { .. } => "acquiring",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed)
    }

    /// Enter `Acquiring`; from `Acquiring` this is a retry
    pub fn begin_attempt(&self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Pending => Ok(Self::Acquiring { attempt: 1 }),
            Self::Acquiring { attempt } => Ok(Self::Acquiring { attempt: attempt + 1 }),
            _ => Err(self.invalid("begin_attempt")),
        }
    }

    pub fn succeed(&self, price: u64) -> Result<Self, InvalidTransition> {
        match self {
            Self::Acquiring { .. } => Ok(Self::Succeeded { price }),
            _ => Err(self.invalid("succeed")),
        }
    }

    pub fn fail(&self) -> Result<Self, InvalidTransition> {
        match self {
            Self::Acquiring { .. } => Ok(Self::Failed),
            _ => Err(self.invalid("fail")),
        }
    }

    /// Attempt number while acquiring
    #[must_use]
    pub const fn attempt(&self) -> Option<u32> {
        match self {
            Self::Acquiring { attempt } => Some(*attempt),
            _ => None,
        }
    }

    const fn invalid(&self, event: &'static str) -> InvalidTransition {
        InvalidTransition {
            from: self.name(),
            event,
        }
    }
}

/// Why a listing ended in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListingError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("observation rejected: {0}")]
    History(#[from] HistoryError),
}

impl ListingError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Acquisition(e) => e.kind(),
            Self::History(_) => "out_of_order",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListingFailure {
    pub key: ListingKey,
    pub error: ListingError,
    /// Diagnostics snapshot, when one could be captured
    pub artifact: Option<PathBuf>,
    pub attempts: u32,
}

/// Outcome of one pipeline run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub batch_timestamp: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<ListingFailure>,
}

impl RunReport {
    #[must_use]
    pub fn new(run_id: Uuid, batch_timestamp: DateTime<Utc>) -> Self {
        Self {
            run_id,
            batch_timestamp,
            total: 0,
            succeeded: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn failure_for(&self, key: &ListingKey) -> Option<&ListingFailure> {
        self.failures.iter().find(|f| &f.key == key)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} at {}: {}/{} listings updated, {} failed",
            self.run_id,
            self.batch_timestamp.to_rfc3339(),
            self.succeeded,
            self.total,
            self.failed()
        )
    }
}
