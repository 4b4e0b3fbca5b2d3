//! Record identifiers and the batching splitter.
//!
//! The service caps every data call at [`MAX_BATCH_SIZE`] identifiers, so id
//! lists returned by a search are cut into contiguous [`Batch`]es before any
//! records or structure files are requested.

use std::fmt;

/// Per-request identifier cap imposed by the ICSD service.
pub const MAX_BATCH_SIZE: usize = 500;

/// Remote record identifier (ICSD `idnum`).
///
/// Search results and every fetch call use this one type, so there is never a
/// question of whether a list holds bare ids or id/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps a raw identifier.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the identifier as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Contiguous slice of an id list sent in one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 1-based position of this batch in the split. Diagnostics and merge ordering only.
    pub index: usize,
    /// Identifiers in this batch, in input order.
    pub ids: Vec<RecordId>,
}

impl Batch {
    /// Number of identifiers in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the batch holds no identifiers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Error returned for an unusable batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BatchSizeError {
    /// A batch size of zero can never cover a non-empty list.
    #[error("batch size must be at least 1")]
    Zero,
}

/// Splits `ids` into ordered, contiguous batches of at most `max_batch_size`.
///
/// Produces `ceil(N / max_batch_size)` batches whose concatenation is exactly
/// `ids`. An empty list yields no batches.
///
/// # Errors
///
/// Returns [`BatchSizeError::Zero`] when `max_batch_size` is 0.
pub fn split_batches(
    ids: &[RecordId],
    max_batch_size: usize,
) -> Result<Vec<Batch>, BatchSizeError> {
    if max_batch_size == 0 {
        return Err(BatchSizeError::Zero);
    }

    Ok(ids
        .chunks(max_batch_size)
        .enumerate()
        .map(|(i, chunk)| Batch {
            index: i + 1,
            ids: chunk.to_vec(),
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ids(n: u64) -> Vec<RecordId> {
        (1..=n).map(RecordId::from).collect()
    }

    #[test]
    fn test_split_empty_input_yields_no_batches() {
        let batches = split_batches(&[], 500).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_split_zero_batch_size_fails_fast() {
        assert_eq!(split_batches(&ids(3), 0), Err(BatchSizeError::Zero));
    }

    #[test]
    fn test_split_1200_by_500_gives_three_batches() {
        let input = ids(1200);
        let batches = split_batches(&input, 500).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        let indices: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_split_count_bound_and_order_for_many_shapes() {
        for n in [0u64, 1, 2, 7, 499, 500, 501, 1000, 1001] {
            for cap in [1usize, 2, 3, 500] {
                let input = ids(n);
                let batches = split_batches(&input, cap).unwrap();

                let expected = (n as usize).div_ceil(cap);
                assert_eq!(batches.len(), expected, "n={n} cap={cap}");
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= cap));

                let rejoined: Vec<RecordId> =
                    batches.into_iter().flat_map(|b| b.ids).collect();
                assert_eq!(rejoined, input, "n={n} cap={cap}");
            }
        }
    }

    #[test]
    fn test_record_id_conversions() {
        assert_eq!(RecordId::from(42u64).as_str(), "42");
        assert_eq!(RecordId::from("7").to_string(), "7");
        assert_eq!(RecordId::from(String::from("9")), RecordId::new("9"));
    }
}
