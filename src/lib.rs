//! ICSD Retrieval Core Library
//!
//! This library pulls large result sets (tabular structure records and CIF
//! files) out of the ICSD web service. The service caps every request at 500
//! ids, issues short-lived single-session tokens and has no bulk export, so
//! the library splits id lists into batches, fetches them concurrently with
//! one token per worker, and merges the results into one artifact plus one
//! list of ids that could not be fetched.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`client`] - HTTP client for the service behind the `IcsdService` trait
//! - [`session`] - Token acquisition with retry, scoped release, single re-auth
//! - [`batch`] - Record ids and the batching splitter
//! - [`engine`] - Bounded concurrent batch executor
//! - [`aggregate`] - Deterministic merge of batch outcomes into artifacts
//! - [`retrieval`] - Search and retrieval jobs tying the above together
//! - [`query`] - Expert-search query builder
//! - [`config`] - Settings file and credential loading

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod engine;
pub mod query;
pub mod retrieval;
pub mod session;

// Re-export commonly used types
pub use aggregate::{AggregateError, AggregateReport};
pub use auth::{AuthToken, Credential};
pub use batch::{Batch, MAX_BATCH_SIZE, RecordId, split_batches};
pub use client::{ClientError, ClientOptions, ContentType, IcsdClient, IcsdService, SearchKind};
pub use config::{ConfigError, Settings};
pub use engine::{BatchError, BatchExecutor, BatchOutcome, DEFAULT_CONCURRENCY, EngineError};
pub use query::{Conjunction, QueryError, build_query};
pub use retrieval::{RetrievalError, Retriever};
pub use session::{AuthError, Session, SessionError, SessionGateway};
