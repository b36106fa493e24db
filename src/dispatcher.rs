//! Fan-out dispatcher
//!
//! Turns one batch of targets into concurrent fetches, bounded by a
//! per-batch pool of fetch slots, and folds the outcomes into either a
//! complete [`BatchResult`] or the first failure reported.
//!
//! Every launched fetch runs to completion even after a sibling has failed;
//! only the caller's cancellation token (request deadline or disconnect)
//! cuts fetches short.

use crate::error::FetchError;
use crate::fetcher::{parse_target, Fetcher};
use crate::models::{BatchResult, TodoRecord};
use crate::LimitsSettings;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub struct Dispatcher {
    fetcher: Arc<dyn Fetcher>,
    batch_limit: usize,
    max_targets: usize,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    pub fn new(fetcher: Arc<dyn Fetcher>, limits: &LimitsSettings) -> Self {
        Self {
            fetcher,
            batch_limit: limits.batch_limit,
            max_targets: limits.max_targets,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    /// Fetch and decode every target.
    ///
    /// Returns all records when every target succeeded, otherwise the first
    /// error drained after all fetches have finished. Oversized batches and
    /// malformed targets are rejected before any fetch starts. Result order is
    /// completion order and carries no meaning.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        targets: Vec<String>,
    ) -> Result<BatchResult, FetchError> {
        if targets.len() > self.max_targets {
            return Err(FetchError::BatchTooLarge {
                count: targets.len(),
                max: self.max_targets,
            });
        }

        // Malformed targets fail the batch before anything is launched.
        for target in &targets {
            parse_target(target)?;
        }

        let batch_size = targets.len();
        let span = info_span!("batch", batch_id = %uuid::Uuid::new_v4(), batch_size);
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        self.run_batch(cancel, targets)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        cancel: &CancellationToken,
        targets: Vec<String>,
    ) -> Result<BatchResult, FetchError> {
        let start = Instant::now();
        let batch_size = targets.len();

        let fetch_slots = Arc::new(Semaphore::new(self.batch_limit));
        let records = Arc::new(Mutex::new(Vec::with_capacity(batch_size)));
        // Sized to the batch so reporting a failure never waits on the collector.
        let (error_tx, mut error_rx) = mpsc::channel::<FetchError>(batch_size.max(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();

        for target in targets {
            // Blocks further launches while the pool is saturated.
            let slot = fetch_slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| FetchError::WorkerFailed {
                    message: e.to_string(),
                })?;

            let fetcher = self.fetcher.clone();
            let cancel = cancel.clone();
            let records = records.clone();
            let error_tx = error_tx.clone();
            let counters = self.counters.clone();
            let in_flight = in_flight.clone();

            counters.launched.fetch_add(1, Ordering::Relaxed);
            workers.spawn(
                async move {
                    let _slot = slot;
                    let _active = InFlightGuard::enter(in_flight, &counters.peak_in_flight);

                    match fetch_record(fetcher.as_ref(), &cancel, &target).await {
                        Ok(record) => records.lock().await.push(record),
                        Err(err) => {
                            warn!(url = %target, kind = err.kind(), error = %err, "Fetch failed");
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            let _ = error_tx.send(err).await;
                        }
                    }

                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                .in_current_span(),
            );
        }
        drop(error_tx);

        let mut worker_fault = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(join_err) = joined {
                warn!(error = %join_err, "Fetch worker did not finish");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                worker_fault.get_or_insert(FetchError::from(join_err));
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;

        if let Some(err) = error_rx.try_recv().ok().or(worker_fault) {
            info!(elapsed_ms, kind = err.kind(), "Batch failed");
            return Err(err);
        }

        let records = std::mem::take(&mut *records.lock().await);
        info!(elapsed_ms, results = records.len(), "Batch completed");

        Ok(BatchResult::new(records))
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            fetches_launched: self.counters.launched.load(Ordering::Relaxed),
            fetches_completed: self.counters.completed.load(Ordering::Relaxed),
            fetches_failed: self.counters.failed.load(Ordering::Relaxed),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

async fn fetch_record(
    fetcher: &dyn Fetcher,
    cancel: &CancellationToken,
    target: &str,
) -> Result<TodoRecord, FetchError> {
    let payload = fetcher.fetch(cancel, target).await?;

    let record = TodoRecord::decode(target, &payload).map_err(|e| FetchError::Decode {
        target: target.to_string(),
        message: e.to_string(),
    })?;

    debug!(url = %target, id = record.id, "Decoded record");
    Ok(record)
}

#[derive(Debug, Default)]
struct DispatchCounters {
    batches: AtomicU64,
    launched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    peak_in_flight: AtomicUsize,
}

/// Cumulative dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub batches: u64,
    pub fetches_launched: u64,
    /// Finished fetches, successful or not
    pub fetches_completed: u64,
    pub fetches_failed: u64,
    /// Most fetches ever observed running at once within a single batch
    pub peak_in_flight: usize,
}

struct InFlightGuard {
    current: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(current: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}
