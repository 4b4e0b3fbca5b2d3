//! Client for the ICSD web service.
//!
//! The rest of the crate talks to the service only through the [`IcsdService`]
//! trait, so the session gateway and the retrieval jobs can be exercised
//! against fakes as well as the real [`IcsdClient`].
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | login | `POST auth/login` (form `loginid`, `password`) |
//! | logout | `GET auth/logout` |
//! | search | `GET search/simple` or `GET search/expert` |
//! | records | `GET csv` with repeated `idnum` and `listSelection` |
//! | structures | `GET cif/multiple` with repeated `idnum` |
//! | single structure | `GET {idnum}` |

mod constants;
mod error;
mod http;
pub mod response;

pub use constants::{
    AUTH_TOKEN_HEADER, BASE_RECORD_FIELDS, CONNECT_TIMEOUT_SECS, DEFAULT_BASE_URL,
    READ_TIMEOUT_SECS, SEARCH_TIMEOUT_SECS,
};
pub use error::ClientError;
pub use http::{ClientOptions, IcsdClient};

use async_trait::async_trait;

use crate::auth::{AuthToken, Credential};
use crate::batch::RecordId;

/// Which search endpoint to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchKind {
    /// Free-text search (`search/simple`).
    Simple,
    /// Field-qualified expert search (`search/expert`).
    #[default]
    Expert,
}

impl SearchKind {
    /// Endpoint path relative to the service root.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Simple => "search/simple",
            Self::Expert => "search/expert",
        }
    }
}

/// Database partition a search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    /// Experimentally determined inorganic structures.
    #[default]
    ExperimentalInorganic,
    /// Experimentally determined metal-organic structures.
    ExperimentalMetalorganic,
    /// Computed structures with no experimental counterpart.
    TheoreticalStructures,
}

impl ContentType {
    /// Wire value of the `content type` parameter.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExperimentalInorganic => "EXPERIMENTAL_INORGANIC",
            Self::ExperimentalMetalorganic => "EXPERIMENTAL_METALORGANIC",
            Self::TheoreticalStructures => "THEORETICAL_STRUCTURES",
        }
    }
}

/// How `cif/multiple` should package the requested structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureMode {
    /// One zip archive; members are named `<filename>_CollCode<id>.cif`.
    Archive {
        /// Working filename prefix the service uses for archive members.
        filename: String,
    },
    /// Concatenated plain-text CIF records.
    Text,
}

/// Body returned by `cif/multiple`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructurePayload {
    /// Raw zip archive bytes.
    Archive(Vec<u8>),
    /// One CIF record per entry, each starting with the record marker.
    Records(Vec<String>),
}

/// Header and rows returned by one tabular export call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TabularFragment {
    /// Column names in the order the service returned them.
    pub header: Vec<String>,
    /// One row per record; values line up with `header` by position.
    pub rows: Vec<Vec<String>>,
}

/// Remote operations the retrieval engine depends on.
///
/// # Object Safety
///
/// Uses `async_trait` so jobs can hold an `Arc<dyn IcsdService>`.
#[async_trait]
pub trait IcsdService: Send + Sync {
    /// Exchanges a credential for a fresh auth token (single attempt).
    async fn login(&self, credential: &Credential) -> Result<AuthToken, ClientError>;

    /// Ends the session behind `token`.
    async fn logout(&self, token: &AuthToken) -> Result<(), ClientError>;

    /// Runs a search and returns matching record ids.
    async fn search(
        &self,
        token: &AuthToken,
        query: &str,
        kind: SearchKind,
        content_type: ContentType,
    ) -> Result<Vec<RecordId>, ClientError>;

    /// Fetches tabular record data for at most one batch of ids.
    async fn fetch_records(
        &self,
        token: &AuthToken,
        ids: &[RecordId],
        extra_fields: &[String],
    ) -> Result<TabularFragment, ClientError>;

    /// Fetches CIF files for at most one batch of ids.
    async fn fetch_structure_files(
        &self,
        token: &AuthToken,
        ids: &[RecordId],
        mode: &StructureMode,
    ) -> Result<StructurePayload, ClientError>;

    /// Fetches the CIF text of a single record.
    async fn fetch_structure(&self, token: &AuthToken, id: &RecordId)
    -> Result<String, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_kind_paths() {
        assert_eq!(SearchKind::Simple.path(), "search/simple");
        assert_eq!(SearchKind::Expert.path(), "search/expert");
        assert_eq!(SearchKind::default(), SearchKind::Expert);
    }

    #[test]
    fn test_content_type_wire_values() {
        assert_eq!(ContentType::default().as_str(), "EXPERIMENTAL_INORGANIC");
        assert_eq!(
            ContentType::ExperimentalMetalorganic.as_str(),
            "EXPERIMENTAL_METALORGANIC"
        );
        assert_eq!(
            ContentType::TheoreticalStructures.as_str(),
            "THEORETICAL_STRUCTURES"
        );
    }
}
