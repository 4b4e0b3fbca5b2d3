//! Constants for the ICSD service client (endpoint, headers, timeouts).

/// Public ICSD web service root.
pub const DEFAULT_BASE_URL: &str = "https://icsd.fiz-karlsruhe.de/ws/";

/// Header carrying the auth token on login responses and every later request.
pub const AUTH_TOKEN_HEADER: &str = "ICSD-Auth-Token";

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default HTTP read timeout (5 minutes; 500-record CIF archives are large).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default per-request timeout for search calls (15 seconds).
pub const SEARCH_TIMEOUT_SECS: u64 = 15;

/// Columns every tabular export starts with.
pub const BASE_RECORD_FIELDS: [&str; 3] = ["CollectionCode", "SumFormula", "StructuredFormula"];
