//! Parsers for the three response bodies the service returns.
//!
//! Each parser checks the body against the shape the service documents and
//! fails with [`ClientError::MalformedResponse`] instead of guessing.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use super::TabularFragment;
use super::error::ClientError;
use crate::batch::RecordId;

/// Literal that opens every CIF record in a plain-text multi-record export.
pub const CIF_RECORD_MARKER: &str = "#(C)";

/// Matches the `idnums` element of a search response, self-closing or not.
#[allow(clippy::expect_used)]
static IDNUMS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<idnums(?:\s[^>]*)?(?:/>|>(.*?)</idnums>)")
        .expect("idnums regex is valid") // Static pattern, safe to panic
});

/// Extracts record ids from a search response.
///
/// # Errors
///
/// Returns [`ClientError::MalformedResponse`] when the body has no `idnums` element.
pub fn parse_id_list(url: &str, body: &str) -> Result<Vec<RecordId>, ClientError> {
    let captures = IDNUMS_PATTERN
        .captures(body)
        .ok_or_else(|| ClientError::malformed(url, "missing <idnums> element"))?;

    let ids: Vec<RecordId> = captures
        .get(1)
        .map(|m| m.as_str().split_whitespace().map(RecordId::from).collect())
        .unwrap_or_default();

    trace!(count = ids.len(), "parsed search id list");
    Ok(ids)
}

/// Parses a tabular export: one whitespace-separated header line followed by
/// tab-separated rows. A trailing empty line is not a row.
///
/// # Errors
///
/// Returns [`ClientError::MalformedResponse`] when the body or header is empty.
pub fn parse_tabular(url: &str, body: &str) -> Result<TabularFragment, ClientError> {
    let mut lines = body.split('\n').map(|line| line.trim_end_matches('\r'));

    let header: Vec<String> = lines
        .next()
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    if header.is_empty() {
        return Err(ClientError::malformed(url, "missing header line"));
    }

    let mut rows: Vec<Vec<String>> = lines
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect();
    if rows.last().is_some_and(|row| row.len() == 1 && row[0].is_empty()) {
        rows.pop();
    }

    trace!(columns = header.len(), rows = rows.len(), "parsed tabular body");
    Ok(TabularFragment { header, rows })
}

/// Splits a concatenated plain-text CIF export into one string per record.
///
/// Text before the first marker is discarded; each returned record starts with
/// [`CIF_RECORD_MARKER`].
///
/// # Errors
///
/// Returns [`ClientError::MalformedResponse`] when the marker never occurs.
pub fn split_cif_records(url: &str, body: &str) -> Result<Vec<String>, ClientError> {
    if !body.contains(CIF_RECORD_MARKER) {
        return Err(ClientError::malformed(
            url,
            format!("no {CIF_RECORD_MARKER} record marker in CIF export"),
        ));
    }

    Ok(body
        .split(CIF_RECORD_MARKER)
        .skip(1)
        .map(|record| format!("{CIF_RECORD_MARKER}{record}"))
        .collect())
}
