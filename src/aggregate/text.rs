//! Concatenates plain-text CIF records into one `.cif` file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{AggregateError, MergeError, Merger, cif_path, ensure_folder};
use crate::batch::Batch;
use crate::client::response::CIF_RECORD_MARKER;

/// Writes every record of every merged batch to `<prefix>_results.cif`.
#[derive(Debug)]
pub struct TextRecordMerger {
    path: PathBuf,
    writer: BufWriter<File>,
    records: usize,
}

impl TextRecordMerger {
    /// Creates `<folder>/<prefix>_results.cif`, creating `folder` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Io`] if the folder or file cannot be created.
    pub fn create(folder: &Path, prefix: &str) -> Result<Self, AggregateError> {
        ensure_folder(folder)?;
        let path = cif_path(folder, prefix);
        let file = File::create(&path).map_err(|e| AggregateError::io(&path, e))?;
        debug!(path = %path.display(), "created results cif");

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.records
    }
}

impl Merger<Vec<String>> for TextRecordMerger {
    fn merge(&mut self, batch: &Batch, payload: Vec<String>) -> Result<(), MergeError> {
        if payload.len() != batch.len() {
            return Err(MergeError::malformed(format!(
                "{} cif records for {} requested ids",
                payload.len(),
                batch.len()
            )));
        }
        if let Some(position) = payload
            .iter()
            .position(|record| !record.starts_with(CIF_RECORD_MARKER))
        {
            return Err(MergeError::malformed(format!(
                "record {} does not start with {CIF_RECORD_MARKER}",
                position + 1
            )));
        }

        for record in &payload {
            self.writer
                .write_all(record.as_bytes())
                .map_err(|e| AggregateError::io(&self.path, e))?;
            if !record.ends_with('\n') {
                self.writer
                    .write_all(b"\n")
                    .map_err(|e| AggregateError::io(&self.path, e))?;
            }
        }
        self.records += payload.len();

        debug!(batch = batch.index, records = payload.len(), "merged cif records");
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf, AggregateError> {
        self.writer
            .flush()
            .map_err(|e| AggregateError::io(&self.path, e))?;
        info!(path = %self.path.display(), records = self.records, "results cif written");
        Ok(self.path)
    }
}
