//! Expert-search query builder.
//!
//! Joins `key : value` pairs with `and` / `or`. Keys are checked against the
//! flat table of expert-search fields; values are passed through untouched,
//! the service is the judge of their syntax.
//!
//! ```
//! use icsd_core::query::{Conjunction, build_query};
//!
//! let query = build_query(
//!     [("composition", Some("Na:1 Cl:1")), ("spacegroupnumber", Some("225"))],
//!     Conjunction::And,
//! )
//! .unwrap();
//! assert_eq!(query, "composition : Na:1 Cl:1 and spacegroupnumber : 225");
//! ```

use std::fmt;

use thiserror::Error;

/// Every field the expert search accepts, lower-case.
pub const SEARCH_FIELDS: [&str; 44] = [
    // bibliography
    "authors",
    "article",
    "publicationyear",
    "pagefirst",
    "journal",
    "volume",
    "abstract",
    "keywords",
    // cell
    "cellvolume",
    "calcdensity",
    "cellparameters",
    "search",
    // chemistry
    "structuredformula",
    "chemicalname",
    "mineralname",
    "mineralgroup",
    "zvaluechemistry",
    "anxformula",
    "abformula",
    "formulaweight",
    "numberofelements",
    "composition",
    // database info
    "collectioncode",
    "pdfnumber",
    "release",
    "recordingdate",
    "modificationdate",
    // experimental
    "comment",
    "rvalue",
    "temperature",
    "pressure",
    "sampletype",
    "radiationtype",
    // structure type
    "structuretype",
    // symmetry
    "spacegroupsymbol",
    "spacegroupnumber",
    "bravaislattice",
    "crystalsystem",
    "crystalclass",
    "laueclass",
    "wyckoffsequence",
    "pearsonsymbol",
    "inversioncenter",
    "polaraxis",
];

/// Query construction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The key is not an expert-search field.
    #[error("invalid search term {0:?}; see SEARCH_FIELDS for the accepted keys")]
    UnknownField(String),

    /// No term had a value.
    #[error("search query has no terms")]
    Empty,
}

/// How terms are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conjunction {
    /// Every term must match.
    And,
    /// Any term may match.
    #[default]
    Or,
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::And => "and",
            Self::Or => "or",
        })
    }
}

/// Returns true if `key` names an expert-search field (case-insensitive).
#[must_use]
pub fn is_search_field(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SEARCH_FIELDS.contains(&key.as_str())
}

/// Builds an expert-search query from `(key, value)` terms.
///
/// Terms whose value is `None` are skipped. Keys are lower-cased.
///
/// # Errors
///
/// Returns [`QueryError::UnknownField`] for a key outside [`SEARCH_FIELDS`]
/// and [`QueryError::Empty`] if no term has a value.
pub fn build_query<'a, I>(terms: I, conjunction: Conjunction) -> Result<String, QueryError>
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut parts = Vec::new();
    for (key, value) in terms {
        if !is_search_field(key) {
            return Err(QueryError::UnknownField(key.to_string()));
        }
        if let Some(value) = value {
            parts.push(format!("{} : {value}", key.to_ascii_lowercase()));
        }
    }

    if parts.is_empty() {
        return Err(QueryError::Empty);
    }
    Ok(parts.join(&format!(" {conjunction} ")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_field_table_has_no_duplicates() {
        let mut fields = SEARCH_FIELDS.to_vec();
        fields.sort_unstable();
        fields.dedup();
        assert_eq!(fields.len(), SEARCH_FIELDS.len());
    }

    #[test]
    fn test_default_conjunction_is_or() {
        let query = build_query(
            [("mineralname", Some("halite")), ("chemicalname", Some("sodium"))],
            Conjunction::default(),
        )
        .unwrap();
        assert_eq!(query, "mineralname : halite or chemicalname : sodium");
    }

    #[test]
    fn test_none_values_are_skipped() {
        let query = build_query(
            [
                ("composition", Some("Na:1 Cl:1")),
                ("temperature", None),
                ("numberofelements", Some("2")),
            ],
            Conjunction::And,
        )
        .unwrap();
        assert_eq!(query, "composition : Na:1 Cl:1 and numberofelements : 2");
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let query = build_query([("SpaceGroupNumber", Some("225"))], Conjunction::And).unwrap();
        assert_eq!(query, "spacegroupnumber : 225");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result = build_query([("colour", Some("blue"))], Conjunction::Or);
        assert_eq!(result, Err(QueryError::UnknownField("colour".to_string())));
    }

    #[test]
    fn test_all_none_is_empty() {
        let result = build_query([("authors", None), ("journal", None)], Conjunction::Or);
        assert_eq!(result, Err(QueryError::Empty));
    }
}
