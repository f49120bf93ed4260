//! Worker pool
//!
//! A fixed set of workers, each a tokio task that owns an inbox of
//! [`WorkerMessage`]s and replies on a shared outbox of [`WorkerEvent`]s. Pair
//! evaluation runs on the blocking pool so geometry work never stalls the runtime;
//! a panic there surfaces as [`WorkerEvent::BatchFailed`] instead of losing the
//! batch. Workers share only the read-only job inputs and a stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::batch::types::{
    Batch, BatchId, BatchInfrastructureError, BatchResult, OverlayResultItem, Provenance,
};
use crate::metrics::{OverlayMetrics, Timer};
use crate::overlay::{panic_message, OverlayComputer};

/// Messages accepted by a worker
#[derive(Debug)]
pub enum WorkerMessage {
    /// Evaluate every pair of the batch
    ProcessBatch {
        /// Batch to evaluate
        batch: Batch,
        /// Attempt number, echoed in the reply
        attempt: u32,
    },
    /// Finish the current pair, drop remaining work and exit
    Terminate,
}

/// Replies emitted by workers
#[derive(Debug)]
pub enum WorkerEvent {
    /// A worker picked the batch up
    BatchStarted {
        /// Worker index
        worker: usize,
        /// Batch picked up
        batch_id: BatchId,
        /// Attempt from the request
        attempt: u32,
    },
    /// All pairs evaluated
    BatchComplete {
        /// Worker index
        worker: usize,
        /// Attempt from the request
        attempt: u32,
        /// Items and pair counts
        result: BatchResult,
    },
    /// The batch could not be evaluated
    BatchFailed {
        /// Worker index
        worker: usize,
        /// Batch that failed
        batch_id: BatchId,
        /// Attempt from the request
        attempt: u32,
        /// Why
        error: BatchInfrastructureError,
    },
}

struct WorkerHandle {
    inbox: mpsc::UnboundedSender<WorkerMessage>,
    task: JoinHandle<()>,
    alive: bool,
    busy: bool,
    stalled: bool,
}

impl WorkerHandle {
    fn usable(&self) -> bool {
        self.alive && !self.stalled
    }
}

/// Fixed-size pool of message-driven workers.
///
/// A worker holds at most one batch at a time. Callers keep their own queue and
/// hand the next batch over once [`WorkerPool::release`] reports a worker idle.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    stop: Arc<AtomicBool>,
    next: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .field("live", &self.live_workers())
            .field("stalled", &self.stalled_workers())
            .field("stopping", &self.stop.load(Ordering::Acquire))
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) and return the pool with its event stream
    pub fn spawn(
        size: usize,
        computer: Arc<dyn OverlayComputer>,
        metrics: OverlayMetrics,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let size = size.max(1);
        let (outbox, events) = mpsc::channel(size * 4);
        let stop = Arc::new(AtomicBool::new(false));

        let workers = (0..size)
            .map(|index| {
                let (inbox, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_worker(
                    index,
                    rx,
                    outbox.clone(),
                    Arc::clone(&computer),
                    Arc::clone(&stop),
                    metrics,
                ));
                WorkerHandle {
                    inbox,
                    task,
                    alive: true,
                    busy: false,
                    stalled: false,
                }
            })
            .collect();

        info!(workers = size, "Worker pool started");

        (
            Self {
                workers,
                stop,
                next: 0,
            },
            events,
        )
    }

    /// Number of workers spawned
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Workers whose inbox is still open
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Live workers that may still be handed a batch
    pub fn usable_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.usable()).count()
    }

    /// Workers written off after overrunning a batch timeout
    pub fn stalled_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive && w.stalled).count()
    }

    /// Hand a batch to the next idle worker in round-robin order.
    ///
    /// `avoid` is skipped while any other usable worker exists, even a busy one.
    /// Returns the index of the worker that accepted the batch, `Ok(None)` when
    /// every eligible worker is busy, and `NoWorkers` once none is usable.
    pub fn dispatch(
        &mut self,
        batch: Batch,
        attempt: u32,
        avoid: Option<usize>,
    ) -> Result<Option<usize>, BatchInfrastructureError> {
        let mut message = WorkerMessage::ProcessBatch { batch, attempt };

        loop {
            if self.usable_workers() == 0 {
                return Err(BatchInfrastructureError::NoWorkers);
            }
            let Some(candidate) = self.pick(avoid) else {
                return Ok(None);
            };
            match self.workers[candidate].inbox.send(message) {
                Ok(()) => {
                    self.workers[candidate].busy = true;
                    self.next = (candidate + 1) % self.workers.len();
                    return Ok(Some(candidate));
                }
                Err(mpsc::error::SendError(returned)) => {
                    warn!(worker = candidate, "Worker inbox closed, marking worker dead");
                    self.workers[candidate].alive = false;
                    message = returned;
                }
            }
        }
    }

    fn pick(&self, avoid: Option<usize>) -> Option<usize> {
        let count = self.workers.len();
        let next = self.next;
        let usable = |i: &usize| self.workers[*i].usable();
        let order = move || (0..count).map(move |offset| (next + offset) % count);
        let alternative = order().filter(usable).any(|i| Some(i) != avoid);

        order()
            .filter(usable)
            .filter(|i| !self.workers[*i].busy)
            .find(|i| !alternative || Some(*i) != avoid)
    }

    /// Record that `worker` replied and holds no batch anymore.
    ///
    /// A stalled worker that finally replies is usable again.
    pub fn release(&mut self, worker: usize) {
        if let Some(handle) = self.workers.get_mut(worker) {
            if handle.stalled {
                info!(worker, "Stalled worker recovered");
            }
            handle.busy = false;
            handle.stalled = false;
        }
    }

    /// Stop handing batches to `worker` until it replies
    pub fn mark_stalled(&mut self, worker: usize) {
        if let Some(handle) = self.workers.get_mut(worker) {
            handle.stalled = true;
        }
    }

    /// Raise the stop flag and ask every worker to exit; does not wait
    pub fn terminate(&self) {
        self.stop.store(true, Ordering::Release);
        for worker in self.workers.iter().filter(|w| w.alive) {
            let _ = worker.inbox.send(WorkerMessage::Terminate);
        }
    }

    /// Ask workers to exit after their queued work and wait for them
    pub async fn shutdown(self) {
        for worker in self.workers.iter().filter(|w| w.alive) {
            let _ = worker.inbox.send(WorkerMessage::Terminate);
        }
        for joined in join_all(self.workers.into_iter().map(|w| w.task)).await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        debug!("Worker pool shut down");
    }
}

#[instrument(skip_all, fields(worker = index))]
async fn run_worker(
    index: usize,
    mut inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    outbox: mpsc::Sender<WorkerEvent>,
    computer: Arc<dyn OverlayComputer>,
    stop: Arc<AtomicBool>,
    metrics: OverlayMetrics,
) {
    while let Some(message) = inbox.recv().await {
        let (batch, attempt) = match message {
            WorkerMessage::Terminate => {
                debug!("Worker received terminate");
                break;
            }
            WorkerMessage::ProcessBatch { batch, attempt } => (batch, attempt),
        };

        let batch_id = batch.id();
        if stop.load(Ordering::Acquire) {
            debug!(%batch_id, "Discarding batch, pool is stopping");
            continue;
        }

        let started = WorkerEvent::BatchStarted {
            worker: index,
            batch_id,
            attempt,
        };
        if outbox.send(started).await.is_err() {
            break;
        }

        let timer = Timer::start();
        let computer = Arc::clone(&computer);
        let flag = Arc::clone(&stop);
        let run = tokio::task::spawn_blocking(move || process_batch(&batch, computer.as_ref(), &flag)).await;

        let event = match run {
            Ok(Some(mut result)) => {
                let seconds = timer.elapsed_secs();
                result.duration = std::time::Duration::from_secs_f64(seconds);
                metrics.record_batch_duration(seconds);
                debug!(
                    %batch_id,
                    attempt,
                    processed = result.processed_pairs,
                    produced = result.items.len(),
                    "Batch complete"
                );
                WorkerEvent::BatchComplete {
                    worker: index,
                    attempt,
                    result,
                }
            }
            Ok(None) => {
                debug!(%batch_id, "Batch interrupted by stop request");
                continue;
            }
            Err(e) => {
                warn!(%batch_id, attempt, error = %e, "Worker crashed while processing batch");
                WorkerEvent::BatchFailed {
                    worker: index,
                    batch_id,
                    attempt,
                    error: BatchInfrastructureError::WorkerCrashed {
                        worker: index,
                        message: describe_join_error(e),
                    },
                }
            }
        };

        if outbox.send(event).await.is_err() {
            break;
        }
    }
}

/// Evaluate every pair of `batch`; `None` if the stop flag was raised mid-way
fn process_batch(batch: &Batch, computer: &dyn OverlayComputer, stop: &AtomicBool) -> Option<BatchResult> {
    let inputs = &batch.inputs;
    let mut items = Vec::new();
    let mut processed_pairs = 0u64;
    let mut skipped_pairs = 0u64;
    let mut invalid_pairs = 0u64;

    for pair in batch.span.pairs() {
        let target = &inputs.targets[pair.target_index];
        let mask = &inputs.masks[pair.mask_index];

        match computer.compute(&target.geometry, &mask.geometry, inputs.operation) {
            Ok(Some(geometry)) => items.push(OverlayResultItem::new(
                inputs.operation,
                geometry,
                Provenance {
                    target_index: pair.target_index,
                    mask_index: pair.mask_index,
                    target_feature_id: target.id.clone(),
                    mask_feature_id: mask.id.clone(),
                    target_layer: inputs.target_layer.clone(),
                    mask_layer: inputs.mask_layer.clone(),
                },
            )),
            Ok(None) => skipped_pairs += 1,
            Err(error) => {
                debug!(
                    target_index = pair.target_index,
                    mask_index = pair.mask_index,
                    %error,
                    "Pair skipped"
                );
                skipped_pairs += 1;
                invalid_pairs += 1;
            }
        }
        processed_pairs += 1;

        if stop.load(Ordering::Acquire) {
            return None;
        }
    }

    Some(BatchResult {
        batch_id: batch.id(),
        items,
        processed_pairs,
        skipped_pairs,
        invalid_pairs,
        error: None,
        duration: std::time::Duration::ZERO,
    })
}

fn describe_join_error(error: JoinError) -> String {
    if error.is_panic() {
        panic_message(error.into_panic().as_ref())
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::{BatchSpan, JobInputs};
    use crate::feature::{Feature, FeatureSet};
    use crate::overlay::{GeometryOverlay, Operation, PairComputationError};
    use geo::{point, Geometry};

    fn inputs(targets: usize, masks: usize) -> Arc<JobInputs> {
        let set = |prefix: &str, n: usize| -> FeatureSet {
            (0..n)
                .map(|i| Feature::new(format!("{prefix}{i}"), Geometry::Point(point!(x: i as f64, y: 0.0))))
                .collect()
        };
        Arc::new(JobInputs {
            targets: set("t", targets),
            masks: set("m", masks),
            operation: Operation::Intersection,
            target_layer: "targets".into(),
            mask_layer: "masks".into(),
        })
    }

    fn batch(id: usize, inputs: &Arc<JobInputs>) -> Batch {
        Batch::new(
            BatchSpan {
                id: BatchId(id),
                targets: 0..inputs.targets.len(),
                masks: 0..inputs.masks.len(),
            },
            Arc::clone(inputs),
        )
    }

    #[test]
    fn test_process_batch_counts_pairs() {
        let inputs = inputs(3, 3);
        let stop = AtomicBool::new(false);
        let result = process_batch(&batch(0, &inputs), &GeometryOverlay, &stop).expect("not stopped");

        // Identical points on the diagonal intersect; the rest are disjoint.
        assert_eq!(result.processed_pairs, 9);
        assert_eq!(result.items.len(), 3);
        assert_eq!(result.skipped_pairs, 6);
        assert_eq!(result.invalid_pairs, 0);
        assert!(result
            .items
            .iter()
            .all(|i| i.provenance.target_index == i.provenance.mask_index));
    }

    #[test]
    fn test_process_batch_counts_invalid_pairs() {
        let inputs = inputs(2, 1);
        let stop = AtomicBool::new(false);
        let reject = |_: &Geometry<f64>,
                      _: &Geometry<f64>,
                      _: Operation|
         -> Result<Option<Geometry<f64>>, PairComputationError> {
            Err(PairComputationError::SelfIntersection)
        };
        let result = process_batch(&batch(0, &inputs), &reject, &stop).expect("not stopped");
        assert_eq!(result.processed_pairs, 2);
        assert_eq!(result.invalid_pairs, 2);
        assert!(result.items.is_empty());
    }

    #[test]
    fn test_process_batch_stops_when_flagged() {
        let inputs = inputs(2, 2);
        let stop = AtomicBool::new(true);
        assert!(process_batch(&batch(0, &inputs), &GeometryOverlay, &stop).is_none());
    }

    #[tokio::test]
    async fn test_pool_round_robin_and_replies() {
        let inputs = inputs(2, 2);
        let (mut pool, mut events) =
            WorkerPool::spawn(2, Arc::new(GeometryOverlay), OverlayMetrics::new("intersection"));

        assert_eq!(pool.dispatch(batch(0, &inputs), 1, None), Ok(Some(0)));
        assert_eq!(pool.dispatch(batch(1, &inputs), 1, None), Ok(Some(1)));
        // Both workers hold a batch; the next one waits with the caller.
        assert_eq!(pool.dispatch(batch(2, &inputs), 1, None), Ok(None));

        let mut completed = Vec::new();
        while completed.len() < 2 {
            match events.recv().await.expect("pool is alive") {
                WorkerEvent::BatchComplete { worker, result, .. } => completed.push((worker, result.batch_id)),
                WorkerEvent::BatchStarted { .. } => {}
                WorkerEvent::BatchFailed { error, .. } => panic!("unexpected failure: {error}"),
            }
        }
        completed.sort();
        assert_eq!(completed, vec![(0, BatchId(0)), (1, BatchId(1))]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_avoids_previous_worker() {
        let inputs = inputs(1, 1);
        let (mut pool, _events) =
            WorkerPool::spawn(3, Arc::new(GeometryOverlay), OverlayMetrics::new("intersection"));

        // Round-robin would pick worker 0 next; avoiding it moves on to worker 1.
        assert_eq!(pool.dispatch(batch(0, &inputs), 2, Some(0)), Ok(Some(1)));
        pool.terminate();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_avoided_worker_is_not_used_while_another_is_busy() {
        let inputs = inputs(1, 1);
        let (mut pool, _events) =
            WorkerPool::spawn(2, Arc::new(GeometryOverlay), OverlayMetrics::new("intersection"));

        assert_eq!(pool.dispatch(batch(0, &inputs), 1, None), Ok(Some(0)));
        pool.release(0);
        assert_eq!(pool.dispatch(batch(1, &inputs), 1, None), Ok(Some(1)));
        assert_eq!(pool.dispatch(batch(2, &inputs), 2, Some(0)), Ok(None));

        pool.release(1);
        assert_eq!(pool.dispatch(batch(2, &inputs), 2, Some(0)), Ok(Some(1)));
        pool.terminate();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_workers_are_skipped_until_they_reply() {
        let inputs = inputs(1, 1);
        let (mut pool, _events) =
            WorkerPool::spawn(2, Arc::new(GeometryOverlay), OverlayMetrics::new("intersection"));

        pool.mark_stalled(0);
        assert_eq!(pool.usable_workers(), 1);
        assert_eq!(pool.dispatch(batch(0, &inputs), 1, None), Ok(Some(1)));
        assert_eq!(pool.dispatch(batch(1, &inputs), 1, None), Ok(None));

        pool.mark_stalled(1);
        assert_eq!(pool.stalled_workers(), 2);
        assert_eq!(
            pool.dispatch(batch(1, &inputs), 1, None),
            Err(BatchInfrastructureError::NoWorkers)
        );

        pool.release(0);
        assert_eq!(pool.dispatch(batch(1, &inputs), 1, None), Ok(Some(0)));
        pool.terminate();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_computer_reports_batch_failure() {
        let inputs = inputs(1, 1);
        let explode = |_: &Geometry<f64>,
                       _: &Geometry<f64>,
                       _: Operation|
         -> Result<Option<Geometry<f64>>, PairComputationError> { panic!("geometry engine exploded") };
        let (mut pool, mut events) =
            WorkerPool::spawn(1, Arc::new(explode), OverlayMetrics::new("intersection"));

        pool.dispatch(batch(0, &inputs), 1, None).expect("worker accepts");

        loop {
            match events.recv().await.expect("pool is alive") {
                WorkerEvent::BatchStarted { .. } => continue,
                WorkerEvent::BatchFailed { batch_id, error, .. } => {
                    assert_eq!(batch_id, BatchId(0));
                    assert!(matches!(
                        error,
                        BatchInfrastructureError::WorkerCrashed { ref message, .. } if message.contains("exploded")
                    ));
                    break;
                }
                WorkerEvent::BatchComplete { .. } => panic!("batch should not complete"),
            }
        }

        pool.shutdown().await;
    }
}
