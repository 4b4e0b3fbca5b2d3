//! Retrieval jobs: search, then fetch and merge in batches.
//!
//! [`Retriever`] is the entry point most callers need. It owns the service
//! client, the session gateway and the batch executor, and exposes one method
//! per job:
//!
//! | Method | Produces |
//! |--------|----------|
//! | [`Retriever::search`] | record ids |
//! | [`Retriever::records_to_csv`] | `<prefix>.csv` |
//! | [`Retriever::structures_to_zip`] | `<prefix>_results.zip` |
//! | [`Retriever::structures_to_cif`] | `<prefix>_results.cif` |
//! | [`Retriever::fetch_structure`] | one CIF as text |
//!
//! Searches and single fetches go through the long-lived [`Session`]; batch
//! workers each take their own scoped token.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use icsd_core::auth::Credential;
//! use icsd_core::client::{ClientOptions, IcsdClient};
//! use icsd_core::retrieval::Retriever;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IcsdClient::new(ClientOptions::default())?;
//! let retriever = Retriever::new(Arc::new(client), Credential::new("id", "secret"))
//!     .with_batch_size(500)?
//!     .with_output_dir("./output");
//!
//! retriever.connect().await?;
//! let ids = retriever.search("composition : Na:1 Cl:1").await?;
//! retriever.close().await;
//!
//! let report = retriever.structures_to_zip(&ids, "nacl").await?;
//! println!("merged {} ids, {} failed", report.merged.len(), report.failed.len());
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::aggregate::{
    AggregateError, AggregateReport, ArchiveMerger, TabularMerger, TextRecordMerger, aggregate,
};
use crate::auth::{AuthToken, Credential};
use crate::batch::{Batch, BatchSizeError, MAX_BATCH_SIZE, RecordId, split_batches};
use crate::client::{
    ClientError, ContentType, IcsdClient, IcsdService, SearchKind, StructureMode, StructurePayload,
    TabularFragment,
};
use crate::config::{DEFAULT_OUTPUT_DIR, Settings};
use crate::engine::{BatchError, BatchExecutor, BatchStream, EngineError};
use crate::session::{AuthError, RetryPolicy, Session, SessionError, SessionGateway};

/// Errors that abort a whole job.
///
/// Failures of individual batches are not among them; those end up in the
/// job's failure list.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// No token could be obtained for a search or single fetch.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The replacement token was rejected too.
    #[error("[AUTH] token rejected again after re-authentication: {source}")]
    TokenRejectedTwice {
        /// The second rejection.
        #[source]
        source: ClientError,
    },

    /// A search or single fetch failed remotely, or the client could not be built.
    #[error(transparent)]
    Remote(#[from] ClientError),

    /// The batch size is zero.
    #[error(transparent)]
    BatchSize(#[from] BatchSizeError),

    /// The batch size exceeds what the service accepts.
    #[error("batch size {value} exceeds the service cap of {MAX_BATCH_SIZE}")]
    BatchSizeAboveCap {
        /// The requested size.
        value: usize,
    },

    /// The worker pool could not be configured.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A merged artifact could not be written.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl From<SessionError> for RetrievalError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Auth(e) => Self::Auth(e),
            SessionError::TokenRejectedTwice { source } => Self::TokenRejectedTwice { source },
            SessionError::Remote(e) => Self::Remote(e),
        }
    }
}

/// Runs searches and batched retrieval jobs against one account.
#[derive(Debug)]
pub struct Retriever {
    gateway: SessionGateway,
    session: Session,
    executor: BatchExecutor,
    batch_size: usize,
    output_dir: PathBuf,
    cancel: CancellationToken,
}

impl Retriever {
    /// Creates a retriever with default pool size (8), batch size (500) and output folder.
    #[must_use]
    pub fn new(service: Arc<dyn IcsdService>, credential: Credential) -> Self {
        let gateway = SessionGateway::new(service, credential);
        Self {
            session: Session::new(gateway.clone()),
            gateway,
            executor: BatchExecutor::default(),
            batch_size: MAX_BATCH_SIZE,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            cancel: CancellationToken::new(),
        }
    }

    /// Builds an HTTP-backed retriever from loaded settings.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError`] if the client cannot be built or a value is
    /// out of range.
    pub fn from_settings(
        settings: &Settings,
        credential: Credential,
    ) -> Result<Self, RetrievalError> {
        let client = IcsdClient::new(settings.client_options())?;
        Ok(Self::new(Arc::new(client), credential)
            .with_retry_policy(settings.retry_policy())
            .with_concurrency(settings.concurrency)?
            .with_batch_size(settings.batch_size)?
            .with_output_dir(&settings.output_dir))
    }

    /// Replaces the login retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.gateway = SessionGateway::with_retry_policy(
            Arc::clone(self.gateway.service()),
            self.gateway.credential().clone(),
            retry_policy,
        );
        self.session = Session::new(self.gateway.clone());
        self
    }

    /// Sets the worker pool size.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Engine`] outside 1..=100.
    pub fn with_concurrency(mut self, concurrency: usize) -> Result<Self, RetrievalError> {
        self.executor = BatchExecutor::new(concurrency)?;
        Ok(self)
    }

    /// Sets the number of ids per remote call.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::BatchSize`] for 0 and
    /// [`RetrievalError::BatchSizeAboveCap`] above 500.
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, RetrievalError> {
        if batch_size == 0 {
            return Err(BatchSizeError::Zero.into());
        }
        if batch_size > MAX_BATCH_SIZE {
            return Err(RetrievalError::BatchSizeAboveCap { value: batch_size });
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Sets the folder merged artifacts are written to.
    #[must_use]
    pub fn with_output_dir(mut self, output_dir: impl AsRef<Path>) -> Self {
        self.output_dir = output_dir.as_ref().to_path_buf();
        self
    }

    /// Uses `cancel` as the parent of every job's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels every running and future job of this retriever.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Configured ids per remote call.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Folder merged artifacts are written to.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Opens the long-lived session used by searches.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Auth`] if login fails.
    pub async fn connect(&self) -> Result<(), RetrievalError> {
        Ok(self.session.connect().await?)
    }

    /// Closes the long-lived session.
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Expert search over experimental inorganic structures.
    ///
    /// # Errors
    ///
    /// See [`Retriever::search_with`].
    pub async fn search(&self, query: &str) -> Result<Vec<RecordId>, RetrievalError> {
        self.search_with(SearchKind::Expert, ContentType::default(), query)
            .await
    }

    /// Runs a search and returns the matching ids.
    ///
    /// Uses the long-lived session when connected, a temporary token otherwise.
    ///
    /// # Errors
    ///
    /// - [`RetrievalError::Auth`] if no token can be obtained
    /// - [`RetrievalError::TokenRejectedTwice`] if re-authentication does not help
    /// - [`RetrievalError::Remote`] for any other remote failure
    #[instrument(skip(self), fields(kind = ?kind, content_type = content_type.as_str()))]
    pub async fn search_with(
        &self,
        kind: SearchKind,
        content_type: ContentType,
        query: &str,
    ) -> Result<Vec<RecordId>, RetrievalError> {
        let service = self.gateway.service();
        let ids = self
            .session
            .with_token(|token| {
                let service = Arc::clone(service);
                let query = query.to_string();
                async move { service.search(&token, &query, kind, content_type).await }
            })
            .await?;

        info!(count = ids.len(), "search finished");
        Ok(ids)
    }

    /// Fetches the CIF text of one record.
    ///
    /// # Errors
    ///
    /// Same as [`Retriever::search_with`].
    #[instrument(skip(self), fields(id = %id))]
    pub async fn fetch_structure(&self, id: &RecordId) -> Result<String, RetrievalError> {
        let service = self.gateway.service();
        Ok(self
            .session
            .with_token(|token| {
                let service = Arc::clone(service);
                let id = id.clone();
                async move { service.fetch_structure(&token, &id).await }
            })
            .await?)
    }

    /// Streams tabular record fragments, one outcome per batch.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::BatchSize`] if the ids cannot be split.
    pub fn fetch_records(
        &self,
        ids: &[RecordId],
        extra_fields: &[String],
    ) -> Result<BatchStream<TabularFragment>, RetrievalError> {
        let fields: Arc<[String]> = extra_fields.into();
        self.run_batches(ids, move |service, token, batch| {
            let fields = Arc::clone(&fields);
            async move {
                Ok::<_, BatchError>(service.fetch_records(&token, &batch.ids, &fields).await?)
            }
        })
    }

    /// Streams structure payloads, one outcome per batch.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::BatchSize`] if the ids cannot be split.
    pub fn fetch_structures(
        &self,
        ids: &[RecordId],
        mode: StructureMode,
    ) -> Result<BatchStream<StructurePayload>, RetrievalError> {
        let mode = Arc::new(mode);
        self.run_batches(ids, move |service, token, batch| {
            let mode = Arc::clone(&mode);
            async move {
                Ok::<_, BatchError>(
                    service
                        .fetch_structure_files(&token, &batch.ids, &mode)
                        .await?,
                )
            }
        })
    }

    /// Fetches tabular data for `ids` and merges it into `<prefix>.csv`.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError`] only for job-fatal problems; failed batches
    /// are listed in the report and the failure file.
    #[instrument(skip(self, ids, extra_fields), fields(ids = ids.len()))]
    pub async fn records_to_csv(
        &self,
        ids: &[RecordId],
        extra_fields: &[String],
        prefix: &str,
    ) -> Result<AggregateReport, RetrievalError> {
        let merger = TabularMerger::create(&self.output_dir, prefix)?;
        let outcomes = self.fetch_records(ids, extra_fields)?;
        Ok(aggregate(outcomes, merger, &self.output_dir, prefix).await?)
    }

    /// Fetches CIF archives for `ids` and merges them into `<prefix>_results.zip`.
    ///
    /// # Errors
    ///
    /// See [`Retriever::records_to_csv`].
    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    pub async fn structures_to_zip(
        &self,
        ids: &[RecordId],
        prefix: &str,
    ) -> Result<AggregateReport, RetrievalError> {
        let merger = ArchiveMerger::create(&self.output_dir, prefix)?;
        let mode = Arc::new(StructureMode::Archive {
            filename: prefix.to_string(),
        });
        let outcomes = self.run_batches(ids, move |service, token, batch| {
            let mode = Arc::clone(&mode);
            async move {
                match service
                    .fetch_structure_files(&token, &batch.ids, &mode)
                    .await?
                {
                    StructurePayload::Archive(bytes) => Ok(bytes),
                    StructurePayload::Records(_) => {
                        Err(BatchError::malformed("expected a zip archive, got text records"))
                    }
                }
            }
        })?;
        Ok(aggregate(outcomes, merger, &self.output_dir, prefix).await?)
    }

    /// Fetches plain-text CIF records for `ids` and writes them to `<prefix>_results.cif`.
    ///
    /// # Errors
    ///
    /// See [`Retriever::records_to_csv`].
    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    pub async fn structures_to_cif(
        &self,
        ids: &[RecordId],
        prefix: &str,
    ) -> Result<AggregateReport, RetrievalError> {
        let merger = TextRecordMerger::create(&self.output_dir, prefix)?;
        let outcomes = self.run_batches(ids, move |service, token, batch| async move {
            match service
                .fetch_structure_files(&token, &batch.ids, &StructureMode::Text)
                .await?
            {
                StructurePayload::Records(records) => Ok(records),
                StructurePayload::Archive(_) => {
                    Err(BatchError::malformed("expected text records, got an archive"))
                }
            }
        })?;
        Ok(aggregate(outcomes, merger, &self.output_dir, prefix).await?)
    }

    /// Splits `ids` and runs `call` once per batch, each with its own scoped token.
    fn run_batches<T, F, Fut>(
        &self,
        ids: &[RecordId],
        call: F,
    ) -> Result<BatchStream<T>, RetrievalError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn IcsdService>, AuthToken, Batch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BatchError>> + Send + 'static,
    {
        let batches = split_batches(ids, self.batch_size)?;
        info!(
            ids = ids.len(),
            batches = batches.len(),
            batch_size = self.batch_size,
            concurrency = self.executor.concurrency(),
            "starting batched retrieval"
        );

        let gateway = self.gateway.clone();
        let call = Arc::new(call);
        Ok(self.executor.run(
            batches,
            move |batch| {
                let gateway = gateway.clone();
                let call = Arc::clone(&call);
                async move {
                    let service = Arc::clone(gateway.service());
                    gateway
                        .with_scope(|token| call(service, token, batch))
                        .await?
                }
            },
            self.cancel.child_token(),
        ))
    }
}
