//! Failure list for batches that produced no merged output.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::AggregateError;
use crate::batch::{Batch, RecordId};
use crate::engine::BatchError;

/// Ids of every failed batch, in the order the batches were recorded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FailureLog {
    ids: Vec<RecordId>,
    batches: usize,
}

impl FailureLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records all ids of a failed batch.
    pub fn record(&mut self, batch: &Batch, error: &BatchError) {
        warn!(
            batch = batch.index,
            ids = batch.len(),
            error = %error,
            "batch ids added to failure list"
        );
        self.ids.extend(batch.ids.iter().cloned());
        self.batches += 1;
    }

    /// Number of failed ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true when nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of failed batches.
    #[must_use]
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// The failed ids.
    #[must_use]
    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    /// Consumes the log, returning the failed ids.
    #[must_use]
    pub fn into_ids(self) -> Vec<RecordId> {
        self.ids
    }

    /// Writes one id per line to `path`, but only if something failed.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Io`] if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<Option<PathBuf>, AggregateError> {
        if self.is_empty() {
            return Ok(None);
        }

        let mut contents = String::with_capacity(self.ids.len() * 8);
        for id in &self.ids {
            // Writing to a String cannot fail.
            let _ = writeln!(contents, "{id}");
        }
        std::fs::write(path, contents).map_err(|e| AggregateError::io(path, e))?;

        info!(
            path = %path.display(),
            ids = self.ids.len(),
            batches = self.batches,
            "wrote failure list"
        );
        Ok(Some(path.to_path_buf()))
    }
}
