//! Concurrent batch executor.
//!
//! [`BatchExecutor`] runs one fetch per [`Batch`] on a bounded pool of tokio
//! tasks and yields a [`BatchOutcome`] for every batch, in completion order,
//! through a [`BatchStream`].
//!
//! # Concurrency Model
//!
//! - A driver task walks the batch list in order
//! - A semaphore permit is acquired before each batch starts, so at most
//!   `concurrency` remote calls are in flight
//! - Each batch runs in its own task; a panic or error in one batch becomes a
//!   `Failure` for that batch only
//! - Cancellation stops new batches from starting; in-flight batches drain and
//!   every unstarted batch is reported as [`BatchError::Cancelled`]
//!
//! # Example
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use icsd_core::batch::{RecordId, split_batches};
//! use icsd_core::engine::{BatchError, BatchExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ids: Vec<RecordId> = (1..=1200u64).map(RecordId::from).collect();
//! let batches = split_batches(&ids, 500)?;
//! let executor = BatchExecutor::new(8)?;
//! let mut outcomes = executor.run(
//!     batches,
//!     |batch| async move { Ok::<_, BatchError>(batch.len()) },
//!     CancellationToken::new(),
//! );
//! while let Some(outcome) = outcomes.next().await {
//!     println!("batch {} success={}", outcome.batch().index, outcome.is_success());
//! }
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batch::{Batch, RecordId};
use crate::client::ClientError;
use crate::session::AuthError;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default worker pool size.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Error type for executor construction.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// Why one batch produced no payload.
///
/// Carried inside [`BatchOutcome::Failure`]; never returned as a job error.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The worker could not obtain a token.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The remote call failed.
    #[error(transparent)]
    Remote(#[from] ClientError),

    /// The payload arrived but could not be merged.
    #[error("malformed batch payload: {reason}")]
    Malformed {
        /// What was wrong with the payload.
        reason: String,
    },

    /// The worker task panicked.
    #[error("batch worker panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The job was cancelled before this batch started.
    #[error("batch cancelled before it started")]
    Cancelled,
}

impl BatchError {
    /// Creates a malformed-payload error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Result of running one batch. There is no partial success.
#[derive(Debug)]
pub enum BatchOutcome<T> {
    /// Every id in the batch was fetched.
    Success {
        /// The batch that was fetched.
        batch: Batch,
        /// Whatever the fetch function returned.
        payload: T,
    },
    /// None of the ids in the batch were fetched.
    Failure {
        /// The batch whose ids are now unaccounted for.
        batch: Batch,
        /// Why it failed.
        error: BatchError,
    },
}

impl<T> BatchOutcome<T> {
    /// The batch this outcome belongs to.
    #[must_use]
    pub fn batch(&self) -> &Batch {
        match self {
            Self::Success { batch, .. } | Self::Failure { batch, .. } => batch,
        }
    }

    /// Returns true for [`BatchOutcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The ids of this batch.
    #[must_use]
    pub fn ids(&self) -> &[RecordId] {
        &self.batch().ids
    }
}

/// Counters for one executor run.
///
/// Updated from worker tasks; read them after the stream has ended for final values.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl ExecutorStats {
    /// Number of batches that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Number of batches that failed, cancelled ones included.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Number of batches that never started because the job was cancelled.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Total outcomes emitted so far.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded() + self.failed()
    }

    fn record<T>(&self, outcome: &BatchOutcome<T>) {
        match outcome {
            BatchOutcome::Success { .. } => {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            BatchOutcome::Failure { error, .. } => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                if matches!(error, BatchError::Cancelled) {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Outcomes of one executor run, in completion order.
///
/// The stream ends once every batch has produced exactly one outcome.
#[derive(Debug)]
pub struct BatchStream<T> {
    inner: ReceiverStream<BatchOutcome<T>>,
    stats: Arc<ExecutorStats>,
}

impl<T> BatchStream<T> {
    /// Live counters for this run.
    #[must_use]
    pub fn stats(&self) -> Arc<ExecutorStats> {
        Arc::clone(&self.stats)
    }
}

impl<T> Stream for BatchStream<T> {
    type Item = BatchOutcome<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Bounded worker pool for batch fetches.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    concurrency: usize,
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl BatchExecutor {
    /// Creates an executor running at most `concurrency` batches at once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if the value is outside
    /// the valid range (1-100).
    #[instrument(level = "debug")]
    pub fn new(concurrency: usize) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }
        debug!(concurrency, "creating batch executor");
        Ok(Self { concurrency })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs `fetch` once per batch and streams the outcomes as they complete.
    ///
    /// `fetch` receives its own copy of the batch. Errors it returns and panics
    /// it raises become [`BatchOutcome::Failure`] for that batch; the other
    /// batches are unaffected.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(
        skip(self, batches, fetch, cancel),
        fields(batches = batches.len(), concurrency = self.concurrency)
    )]
    pub fn run<T, F, Fut>(
        &self,
        batches: Vec<Batch>,
        fetch: F,
        cancel: CancellationToken,
    ) -> BatchStream<T>
    where
        T: Send + 'static,
        F: Fn(Batch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BatchError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(batches.len().max(1));
        let stats = Arc::new(ExecutorStats::default());

        tokio::spawn(drive(
            batches,
            Arc::new(fetch),
            Arc::new(Semaphore::new(self.concurrency)),
            cancel,
            tx,
            Arc::clone(&stats),
        ));

        BatchStream {
            inner: ReceiverStream::new(rx),
            stats,
        }
    }
}

async fn drive<T, F, Fut>(
    batches: Vec<Batch>,
    fetch: Arc<F>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tx: mpsc::Sender<BatchOutcome<T>>,
    stats: Arc<ExecutorStats>,
) where
    T: Send + 'static,
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BatchError>> + Send + 'static,
{
    let total = batches.len();
    let mut pending = batches.into_iter();
    let mut handles = Vec::with_capacity(total);

    info!(batches = total, "starting batch run");

    for batch in pending.by_ref() {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            emit_cancelled(batch, &tx, &stats).await;
            break;
        };

        debug!(batch = batch.index, ids = batch.len(), "starting batch");

        let fetch = Arc::clone(&fetch);
        let tx = tx.clone();
        let stats = Arc::clone(&stats);

        handles.push(tokio::spawn(async move {
            // Permit is dropped when this block exits (RAII)
            let _permit = permit;

            let attempt = batch.clone();
            let result = tokio::spawn(async move { fetch(attempt).await }).await;

            let outcome = match result {
                Ok(Ok(payload)) => {
                    debug!(batch = batch.index, "batch succeeded");
                    BatchOutcome::Success { batch, payload }
                }
                Ok(Err(error)) => {
                    warn!(batch = batch.index, ids = batch.len(), error = %error, "batch failed");
                    BatchOutcome::Failure { batch, error }
                }
                Err(join_error) => {
                    let error = join_error_to_batch_error(join_error);
                    warn!(
                        batch = batch.index,
                        ids = batch.len(),
                        error = %error,
                        "batch worker aborted"
                    );
                    BatchOutcome::Failure { batch, error }
                }
            };

            stats.record(&outcome);
            // Receiver gone means nobody is listening any more; nothing to report to.
            let _ = tx.send(outcome).await;
        }));
    }

    for batch in pending {
        emit_cancelled(batch, &tx, &stats).await;
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "batch task join error");
        }
    }

    info!(
        succeeded = stats.succeeded(),
        failed = stats.failed(),
        cancelled = stats.cancelled(),
        "batch run finished"
    );
}

async fn emit_cancelled<T>(
    batch: Batch,
    tx: &mpsc::Sender<BatchOutcome<T>>,
    stats: &ExecutorStats,
) {
    debug!(batch = batch.index, "batch cancelled before start");
    let outcome = BatchOutcome::Failure {
        batch,
        error: BatchError::Cancelled,
    };
    stats.record(&outcome);
    let _ = tx.send(outcome).await;
}

fn join_error_to_batch_error(error: JoinError) -> BatchError {
    match error.try_into_panic() {
        Ok(payload) => BatchError::Panicked {
            message: panic_message(payload),
        },
        Err(_) => BatchError::Cancelled,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::split_batches;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn batches(count: u64, size: usize) -> Vec<Batch> {
        let ids: Vec<RecordId> = (1..=count).map(RecordId::from).collect();
        split_batches(&ids, size).unwrap()
    }

    async fn collect<T>(stream: BatchStream<T>) -> Vec<BatchOutcome<T>> {
        stream.collect().await
    }

    #[test]
    fn test_new_rejects_out_of_range_concurrency() {
        assert!(matches!(
            BatchExecutor::new(0),
            Err(EngineError::InvalidConcurrency { value: 0 })
        ));
        assert!(matches!(
            BatchExecutor::new(101),
            Err(EngineError::InvalidConcurrency { value: 101 })
        ));
        assert_eq!(BatchExecutor::new(100).unwrap().concurrency(), 100);
        assert_eq!(BatchExecutor::default().concurrency(), DEFAULT_CONCURRENCY);
    }

    #[tokio::test]
    async fn test_every_batch_yields_exactly_one_outcome() {
        let executor = BatchExecutor::new(3).unwrap();
        let stream = executor.run(
            batches(95, 10),
            |batch| async move { Ok(batch.len()) },
            CancellationToken::new(),
        );
        let stats = stream.stats();
        let outcomes = collect(stream).await;

        assert_eq!(outcomes.len(), 10);
        let mut indices: Vec<usize> = outcomes.iter().map(|o| o.batch().index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (1..=10).collect::<Vec<_>>());
        assert!(outcomes.iter().all(BatchOutcome::is_success));
        assert_eq!(stats.succeeded(), 10);
        assert_eq!(stats.failed(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_list_ends_immediately() {
        let executor = BatchExecutor::new(2).unwrap();
        let outcomes = collect(executor.run(
            Vec::new(),
            |_batch| async { Ok(()) },
            CancellationToken::new(),
        ))
        .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_batches_never_exceed_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = BatchExecutor::new(2).unwrap();

        let (in_flight_c, peak_c) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let outcomes = collect(executor.run(
            batches(12, 1),
            move |_batch| {
                let in_flight = Arc::clone(&in_flight_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(outcomes.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_affect_siblings() {
        let executor = BatchExecutor::new(4).unwrap();
        let outcomes = collect(executor.run(
            batches(1200, 500),
            |batch| async move {
                if batch.index == 2 {
                    Err(BatchError::Remote(ClientError::http_status("fake/csv", 500)))
                } else {
                    Ok(batch.len())
                }
            },
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            match outcome {
                BatchOutcome::Success { batch, payload } => {
                    assert_ne!(batch.index, 2);
                    assert_eq!(*payload, batch.len());
                }
                BatchOutcome::Failure { batch, error } => {
                    assert_eq!(batch.index, 2);
                    assert_eq!(batch.len(), 500);
                    assert!(matches!(error, BatchError::Remote(_)));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_batch_becomes_failure() {
        let executor = BatchExecutor::new(2).unwrap();
        let outcomes = collect(executor.run(
            batches(3, 1),
            |batch| async move {
                assert_ne!(batch.index, 2, "worker exploded");
                Ok(batch.index)
            },
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(outcomes.len(), 3);
        let failure = outcomes.iter().find(|o| !o.is_success()).unwrap();
        assert_eq!(failure.batch().index, 2);
        match failure {
            BatchOutcome::Failure {
                error: BatchError::Panicked { message },
                ..
            } => assert!(message.contains("worker exploded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_every_batch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = BatchExecutor::new(2).unwrap();
        let stream = executor.run(batches(30, 10), |_batch| async { Ok(()) }, cancel);
        let stats = stream.stats();
        let outcomes = collect(stream).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            BatchOutcome::Failure {
                error: BatchError::Cancelled,
                ..
            }
        )));
        assert_eq!(stats.cancelled(), 3);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_drains_in_flight_and_reports_rest() {
        let cancel = CancellationToken::new();
        let executor = BatchExecutor::new(1).unwrap();
        let trigger = cancel.clone();

        let outcomes = collect(executor.run(
            batches(5, 1),
            move |batch| {
                let trigger = trigger.clone();
                async move {
                    if batch.index == 2 {
                        trigger.cancel();
                    }
                    Ok(batch.index)
                }
            },
            cancel,
        ))
        .await;

        assert_eq!(outcomes.len(), 5);
        let succeeded: Vec<usize> = outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.batch().index)
            .collect();
        assert!(succeeded.contains(&1));
        assert!(succeeded.contains(&2), "in-flight batch must drain");
        let cancelled = outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    BatchOutcome::Failure {
                        error: BatchError::Cancelled,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(succeeded.len() + cancelled, 5);
        assert!(cancelled >= 1);
    }
}
