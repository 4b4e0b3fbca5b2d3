//! Result aggregation.
//!
//! Batch outcomes arrive in completion order. [`aggregate`] puts them back in
//! batch-index order with a small reorder buffer, hands every success to a
//! [`Merger`] and records every failure in a [`FailureLog`]. Because mergers see
//! batches in index order, the merged artifact is byte-identical whatever order
//! the workers finished in.
//!
//! Merging one batch is all-or-nothing: a merger validates the whole payload
//! before writing any of it, and a payload it rejects turns the batch into a
//! failure.

mod archive;
mod failures;
mod tabular;
mod text;

pub use archive::{ArchiveMerger, canonical_member_name};
pub use failures::FailureLog;
pub use tabular::{COLLECTION_CODE_COLUMN, TabularMerger, pad_collection_code};
pub use text::TextRecordMerger;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::batch::{Batch, RecordId};
use crate::engine::{BatchError, BatchOutcome};

/// Width record ids are zero-padded to in merged artifacts.
pub const ID_PAD_WIDTH: usize = 6;

/// `<folder>/<prefix>_results.zip`
#[must_use]
pub fn archive_path(folder: &Path, prefix: &str) -> PathBuf {
    folder.join(format!("{prefix}_results.zip"))
}

/// `<folder>/<prefix>.csv`
#[must_use]
pub fn table_path(folder: &Path, prefix: &str) -> PathBuf {
    folder.join(format!("{prefix}.csv"))
}

/// `<folder>/<prefix>_results.cif`
#[must_use]
pub fn cif_path(folder: &Path, prefix: &str) -> PathBuf {
    folder.join(format!("{prefix}_results.cif"))
}

/// `<folder>/<prefix>_failed_to_download_ids.txt`
#[must_use]
pub fn failure_path(folder: &Path, prefix: &str) -> PathBuf {
    folder.join(format!("{prefix}_failed_to_download_ids.txt"))
}

/// Local write failures. These abort the job.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// Filesystem error on an output artifact.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The merged archive could not be written.
    #[error("failed to write archive {path}: {source}")]
    Archive {
        /// The archive being written.
        path: PathBuf,
        /// The underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// The merged table could not be written.
    #[error("failed to write table {path}: {source}")]
    Csv {
        /// The table being written.
        path: PathBuf,
        /// The underlying csv error.
        #[source]
        source: csv::Error,
    },
}

impl AggregateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a merger refused one batch.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The payload is unusable; the batch becomes a failure and the job goes on.
    #[error("{0}")]
    Malformed(String),

    /// Writing failed; the job stops.
    #[error(transparent)]
    Write(#[from] AggregateError),
}

impl MergeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Writes successful batch payloads into one artifact.
///
/// `merge` is called in ascending batch-index order. An implementation must
/// leave its output untouched when it returns [`MergeError::Malformed`].
pub trait Merger<T> {
    /// Merges one successful batch.
    ///
    /// # Errors
    ///
    /// [`MergeError::Malformed`] rejects this batch only; [`MergeError::Write`]
    /// is fatal.
    fn merge(&mut self, batch: &Batch, payload: T) -> Result<(), MergeError>;

    /// Flushes and closes the artifact, returning its path.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if the final write fails.
    fn finish(self) -> Result<PathBuf, AggregateError>;
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    /// The merged artifact.
    pub output: PathBuf,
    /// Ids whose batch merged, in batch order.
    pub merged: Vec<RecordId>,
    /// Ids whose batch failed, in batch order.
    pub failed: Vec<RecordId>,
    /// The failure list, when any batch failed.
    pub failure_file: Option<PathBuf>,
}

impl AggregateReport {
    /// Returns true when every batch merged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Restores batch-index order over a completion-ordered outcome stream.
///
/// Batches are expected to be numbered from 1 without gaps, as the splitter
/// numbers them. Anything still buffered when the stream ends is released in
/// index order.
#[derive(Debug)]
struct ReorderBuffer<T> {
    next: usize,
    held: BTreeMap<usize, BatchOutcome<T>>,
}

impl<T> ReorderBuffer<T> {
    fn new() -> Self {
        Self {
            next: 1,
            held: BTreeMap::new(),
        }
    }

    /// Accepts one outcome and returns every outcome now ready, in order.
    fn push(&mut self, outcome: BatchOutcome<T>) -> Vec<BatchOutcome<T>> {
        self.held.insert(outcome.batch().index, outcome);
        let mut ready = Vec::new();
        while let Some(outcome) = self.held.remove(&self.next) {
            ready.push(outcome);
            self.next += 1;
        }
        ready
    }

    fn drain(self) -> impl Iterator<Item = BatchOutcome<T>> {
        self.held.into_values()
    }
}

/// Drains `outcomes` into `merger` and writes the failure list.
///
/// Never stops on a failed batch. Returns early only on a local write error.
///
/// # Errors
///
/// Returns [`AggregateError`] if an artifact cannot be written.
#[instrument(skip(outcomes, merger), fields(folder = %folder.display()))]
pub async fn aggregate<T, S, M>(
    outcomes: S,
    mut merger: M,
    folder: &Path,
    prefix: &str,
) -> Result<AggregateReport, AggregateError>
where
    S: Stream<Item = BatchOutcome<T>>,
    M: Merger<T>,
{
    let mut outcomes = std::pin::pin!(outcomes);
    let mut order = ReorderBuffer::new();
    let mut merged = Vec::new();
    let mut failures = FailureLog::new();

    while let Some(outcome) = outcomes.next().await {
        debug!(batch = outcome.batch().index, success = outcome.is_success(), "outcome received");
        for ready in order.push(outcome) {
            apply(ready, &mut merger, &mut merged, &mut failures)?;
        }
    }
    for ready in order.drain() {
        apply(ready, &mut merger, &mut merged, &mut failures)?;
    }

    let output = merger.finish()?;
    let failure_file = failures.write(&failure_path(folder, prefix))?;

    info!(
        output = %output.display(),
        merged = merged.len(),
        failed = failures.len(),
        "aggregation finished"
    );

    Ok(AggregateReport {
        output,
        merged,
        failed: failures.into_ids(),
        failure_file,
    })
}

fn apply<T, M: Merger<T>>(
    outcome: BatchOutcome<T>,
    merger: &mut M,
    merged: &mut Vec<RecordId>,
    failures: &mut FailureLog,
) -> Result<(), AggregateError> {
    match outcome {
        BatchOutcome::Success { batch, payload } => match merger.merge(&batch, payload) {
            Ok(()) => {
                merged.extend(batch.ids);
                Ok(())
            }
            Err(MergeError::Malformed(reason)) => {
                warn!(batch = batch.index, %reason, "rejecting malformed batch payload");
                failures.record(&batch, &BatchError::malformed(reason));
                Ok(())
            }
            Err(MergeError::Write(error)) => Err(error),
        },
        BatchOutcome::Failure { batch, error } => {
            failures.record(&batch, &error);
            Ok(())
        }
    }
}

/// Creates the output folder if it does not exist yet.
pub(crate) fn ensure_folder(folder: &Path) -> Result<(), AggregateError> {
    std::fs::create_dir_all(folder).map_err(|e| AggregateError::io(folder, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::split_batches;
    use crate::client::ClientError;
    use futures_util::stream;

    /// Records the order batches were merged in; rejects batches listed in `reject`.
    struct RecordingMerger {
        seen: Vec<usize>,
        reject: Vec<usize>,
        path: PathBuf,
    }

    impl Merger<()> for RecordingMerger {
        fn merge(&mut self, batch: &Batch, _payload: ()) -> Result<(), MergeError> {
            if self.reject.contains(&batch.index) {
                return Err(MergeError::malformed("bad payload"));
            }
            self.seen.push(batch.index);
            Ok(())
        }

        fn finish(self) -> Result<PathBuf, AggregateError> {
            assert!(self.seen.windows(2).all(|w| w[0] < w[1]));
            Ok(self.path)
        }
    }

    fn outcomes(order: &[usize], failing: &[usize]) -> Vec<BatchOutcome<()>> {
        let ids: Vec<RecordId> = (1..=50u64).map(RecordId::from).collect();
        let batches = split_batches(&ids, 10).unwrap();
        order
            .iter()
            .map(|&i| {
                let batch = batches[i - 1].clone();
                if failing.contains(&i) {
                    BatchOutcome::Failure {
                        batch,
                        error: BatchError::Remote(ClientError::timeout("fake/csv")),
                    }
                } else {
                    BatchOutcome::Success { batch, payload: () }
                }
            })
            .collect()
    }

    #[test]
    fn test_artifact_names() {
        let folder = Path::new("out");
        assert_eq!(archive_path(folder, "icsd"), Path::new("out/icsd_results.zip"));
        assert_eq!(table_path(folder, "icsd_data"), Path::new("out/icsd_data.csv"));
        assert_eq!(cif_path(folder, "icsd"), Path::new("out/icsd_results.cif"));
        assert_eq!(
            failure_path(folder, "icsd"),
            Path::new("out/icsd_failed_to_download_ids.txt")
        );
    }

    #[test]
    fn test_reorder_buffer_releases_in_index_order() {
        let mut buffer = ReorderBuffer::new();
        let mut released = Vec::new();
        for outcome in outcomes(&[3, 1, 5, 2, 4], &[]) {
            released.extend(buffer.push(outcome).iter().map(|o| o.batch().index));
        }
        assert_eq!(released, vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.drain().count(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_conserves_every_id() {
        let dir = tempfile::tempdir().unwrap();
        let merger = RecordingMerger {
            seen: Vec::new(),
            reject: Vec::new(),
            path: dir.path().join("out"),
        };
        let report = aggregate(
            stream::iter(outcomes(&[4, 2, 5, 1, 3], &[2])),
            merger,
            dir.path(),
            "icsd",
        )
        .await
        .unwrap();

        assert_eq!(report.merged.len(), 40);
        assert_eq!(report.failed.len(), 10);
        assert_eq!(report.failed.first().unwrap().as_str(), "11");
        let mut all: Vec<RecordId> = report.merged.iter().chain(&report.failed).cloned().collect();
        all.sort_by_key(|id| id.as_str().parse::<u64>().unwrap());
        assert_eq!(all, (1..=50u64).map(RecordId::from).collect::<Vec<_>>());

        let failure_file = report.failure_file.unwrap();
        let contents = std::fs::read_to_string(failure_file).unwrap();
        assert_eq!(contents.lines().count(), 10);
    }

    #[tokio::test]
    async fn test_malformed_payload_becomes_failure() {
        let dir = tempfile::tempdir().unwrap();
        let merger = RecordingMerger {
            seen: Vec::new(),
            reject: vec![3],
            path: dir.path().join("out"),
        };
        let report = aggregate(
            stream::iter(outcomes(&[1, 2, 3, 4, 5], &[])),
            merger,
            dir.path(),
            "icsd",
        )
        .await
        .unwrap();

        assert_eq!(report.merged.len(), 40);
        assert_eq!(
            report.failed,
            (21..=30u64).map(RecordId::from).collect::<Vec<_>>()
        );
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_no_failure_file_when_all_batches_merge() {
        let dir = tempfile::tempdir().unwrap();
        let merger = RecordingMerger {
            seen: Vec::new(),
            reject: Vec::new(),
            path: dir.path().join("out"),
        };
        let report = aggregate(
            stream::iter(outcomes(&[2, 1, 3, 5, 4], &[])),
            merger,
            dir.path(),
            "icsd",
        )
        .await
        .unwrap();

        assert!(report.is_complete());
        assert!(report.failure_file.is_none());
        assert!(!failure_path(dir.path(), "icsd").exists());
    }
}
