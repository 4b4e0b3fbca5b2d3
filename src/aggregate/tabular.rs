//! Merges tabular record fragments into one CSV file.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{AggregateError, ID_PAD_WIDTH, MergeError, Merger, ensure_folder, table_path};
use crate::batch::Batch;
use crate::client::TabularFragment;

/// Column holding the record id in every tabular export.
pub const COLLECTION_CODE_COLUMN: &str = "CollectionCode";

/// Left-pads a collection code with zeros to six characters.
///
/// Longer values are returned unchanged.
#[must_use]
pub fn pad_collection_code(value: &str) -> String {
    format!("{:0>width$}", value.trim(), width = ID_PAD_WIDTH)
}

/// Writes merged rows to `<prefix>.csv`.
///
/// The first fragment merged fixes the header. Rows of every fragment are
/// mapped onto it by column name; columns a fragment lacks are left empty.
pub struct TabularMerger {
    path: PathBuf,
    writer: csv::Writer<File>,
    header: Option<Vec<String>>,
    rows: usize,
}

impl std::fmt::Debug for TabularMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabularMerger")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl TabularMerger {
    /// Creates `<folder>/<prefix>.csv`, creating `folder` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if the folder or file cannot be created.
    pub fn create(folder: &Path, prefix: &str) -> Result<Self, AggregateError> {
        ensure_folder(folder)?;
        let path = table_path(folder, prefix);
        let writer = csv::Writer::from_path(&path).map_err(|source| AggregateError::Csv {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "created results table");

        Ok(Self {
            path,
            writer,
            header: None,
            rows: 0,
        })
    }

    /// The header fixed by the first merged fragment, if any.
    #[must_use]
    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    /// Number of data rows written so far.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn csv_error(&self, source: csv::Error) -> AggregateError {
        AggregateError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

/// Maps every row of `fragment` onto `header`, padding the collection code.
fn align_rows(
    header: &[String],
    fragment: &TabularFragment,
) -> Result<Vec<Vec<String>>, MergeError> {
    let positions: HashMap<&str, usize> = fragment
        .header
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    if !positions.contains_key(COLLECTION_CODE_COLUMN) {
        return Err(MergeError::malformed(format!(
            "fragment header has no {COLLECTION_CODE_COLUMN} column"
        )));
    }
    if let Some(extra) = fragment
        .header
        .iter()
        .find(|name| !header.contains(*name))
    {
        return Err(MergeError::malformed(format!(
            "fragment column {extra:?} is not in the merged header"
        )));
    }

    fragment
        .rows
        .iter()
        .enumerate()
        .map(|(row_number, row)| {
            if row.len() != fragment.header.len() {
                return Err(MergeError::malformed(format!(
                    "row {} has {} values for {} columns",
                    row_number + 1,
                    row.len(),
                    fragment.header.len()
                )));
            }
            Ok(header
                .iter()
                .map(|column| {
                    let value = positions
                        .get(column.as_str())
                        .map_or("", |&i| row[i].as_str());
                    if column == COLLECTION_CODE_COLUMN {
                        pad_collection_code(value)
                    } else {
                        value.to_string()
                    }
                })
                .collect())
        })
        .collect()
}

impl Merger<TabularFragment> for TabularMerger {
    fn merge(&mut self, batch: &Batch, payload: TabularFragment) -> Result<(), MergeError> {
        if payload.rows.len() != batch.len() {
            return Err(MergeError::malformed(format!(
                "{} rows for {} requested ids",
                payload.rows.len(),
                batch.len()
            )));
        }
        let header = self
            .header
            .clone()
            .unwrap_or_else(|| payload.header.clone());
        let rows = align_rows(&header, &payload)?;

        if self.header.is_none() {
            self.writer
                .write_record(&header)
                .map_err(|e| self.csv_error(e))?;
            debug!(columns = header.len(), "header fixed by batch {}", batch.index);
            self.header = Some(header);
        }

        for row in &rows {
            self.writer.write_record(row).map_err(|e| self.csv_error(e))?;
        }
        self.rows += rows.len();

        debug!(batch = batch.index, rows = rows.len(), "merged tabular fragment");
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf, AggregateError> {
        self.writer
            .flush()
            .map_err(|e| AggregateError::io(&self.path, e))?;
        info!(path = %self.path.display(), rows = self.rows, "results table written");
        Ok(self.path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::batch::RecordId;
    use crate::engine::BatchOutcome;
    use futures_util::stream;

    fn batch(index: usize, ids: &[&str]) -> Batch {
        Batch {
            index,
            ids: ids.iter().map(|id| RecordId::from(*id)).collect(),
        }
    }

    fn fragment(header: &[&str], rows: &[&[&str]]) -> TabularFragment {
        TabularFragment {
            header: header.iter().map(|h| (*h).to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| (*v).to_string()).collect())
                .collect(),
        }
    }

    const HEADER: &[&str] = &["CollectionCode", "SumFormula", "StructuredFormula"];

    #[test]
    fn test_pad_collection_code() {
        assert_eq!(pad_collection_code("4"), "000004");
        assert_eq!(pad_collection_code("12345"), "012345");
        assert_eq!(pad_collection_code("123456"), "123456");
        assert_eq!(pad_collection_code("1234567"), "1234567");
    }

    #[test]
    fn test_merge_pads_collection_code_on_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = TabularMerger::create(dir.path(), "icsd_data").unwrap();

        merger
            .merge(
                &batch(1, &["4", "12345"]),
                fragment(
                    HEADER,
                    &[&["4", "Na1 Cl1", "Na Cl"], &["12345", "K1 Br1", "K Br"]],
                ),
            )
            .unwrap();
        let path = merger.finish().unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "CollectionCode,SumFormula,StructuredFormula",
                "000004,Na1 Cl1,Na Cl",
                "012345,K1 Br1,K Br",
            ]
        );
    }

    #[test]
    fn test_rows_are_mapped_by_column_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = TabularMerger::create(dir.path(), "icsd_data").unwrap();

        merger
            .merge(&batch(1, &["1"]), fragment(HEADER, &[&["1", "A", "a"]]))
            .unwrap();
        merger
            .merge(
                &batch(2, &["2"]),
                fragment(
                    &["SumFormula", "CollectionCode", "StructuredFormula"],
                    &[&["B", "2", "b"]],
                ),
            )
            .unwrap();
        let path = merger.finish().unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().nth(2).unwrap(), "000002,B,b");
    }

    #[test]
    fn test_missing_collection_code_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = TabularMerger::create(dir.path(), "icsd_data").unwrap();
        let result = merger.merge(
            &batch(1, &["1"]),
            fragment(&["SumFormula"], &[&["Na1 Cl1"]]),
        );
        assert!(matches!(result, Err(MergeError::Malformed(_))));
        assert!(merger.header().is_none());
    }

    #[test]
    fn test_ragged_row_rejects_whole_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = TabularMerger::create(dir.path(), "icsd_data").unwrap();
        let result = merger.merge(
            &batch(1, &["1", "2"]),
            fragment(HEADER, &[&["1", "A", "a"], &["2", "B"]]),
        );
        assert!(matches!(result, Err(MergeError::Malformed(_))));
        assert_eq!(merger.rows(), 0);
        assert!(merger.header().is_none());
    }

    #[test]
    fn test_unknown_column_after_header_is_fixed_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = TabularMerger::create(dir.path(), "icsd_data").unwrap();
        merger
            .merge(&batch(1, &["1"]), fragment(HEADER, &[&["1", "A", "a"]]))
            .unwrap();
        let result = merger.merge(
            &batch(2, &["2"]),
            fragment(&["CollectionCode", "Extra"], &[&["2", "x"]]),
        );
        assert!(matches!(result, Err(MergeError::Malformed(_))));
        assert_eq!(merger.rows(), 1);
    }

    #[tokio::test]
    async fn test_short_fragment_fails_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = vec![
            BatchOutcome::Success {
                batch: batch(1, &["4", "17"]),
                payload: fragment(&["CollectionCode", "SumFormula"], &[&["4", "NaCl"]]),
            },
            BatchOutcome::Success {
                batch: batch(2, &["9"]),
                payload: fragment(&["CollectionCode", "SumFormula"], &[&["9", "KBr"]]),
            },
        ];

        let merger = TabularMerger::create(dir.path(), "icsd_data").unwrap();
        let report = aggregate(stream::iter(outcomes), merger, dir.path(), "icsd_data")
            .await
            .unwrap();

        assert_eq!(report.merged, vec![RecordId::from("9")]);
        assert_eq!(report.failed, vec![RecordId::from("4"), RecordId::from("17")]);
        let failed = std::fs::read_to_string(report.failure_file.unwrap()).unwrap();
        assert_eq!(failed.lines().collect::<Vec<_>>(), vec!["4", "17"]);

        let contents = std::fs::read_to_string(report.output).unwrap();
        assert_eq!(
            contents.lines().collect::<Vec<_>>(),
            vec!["CollectionCode,SumFormula", "000009,KBr"]
        );
    }

    async fn merge_in_order(order: &[usize]) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let fragments = [
            (batch(1, &["4"]), fragment(HEADER, &[&["4", "Na1 Cl1", "Na Cl"]])),
            (batch(2, &["12345"]), fragment(HEADER, &[&["12345", "K1 Br1", "K Br"]])),
            (batch(3, &["7"]), fragment(HEADER, &[&["7", "Li1 F1", "Li F"]])),
        ];
        let outcomes: Vec<BatchOutcome<TabularFragment>> = order
            .iter()
            .map(|&i| {
                let (batch, payload) = fragments[i - 1].clone();
                BatchOutcome::Success { batch, payload }
            })
            .collect();

        let merger = TabularMerger::create(dir.path(), "icsd_data").unwrap();
        let report = aggregate(stream::iter(outcomes), merger, dir.path(), "icsd_data")
            .await
            .unwrap();
        std::fs::read(report.output).unwrap()
    }

    #[tokio::test]
    async fn test_completion_order_does_not_change_output() {
        let in_order = merge_in_order(&[1, 2, 3]).await;
        let shuffled = merge_in_order(&[3, 1, 2]).await;
        let reversed = merge_in_order(&[3, 2, 1]).await;
        assert_eq!(in_order, shuffled);
        assert_eq!(in_order, reversed);
    }
}
