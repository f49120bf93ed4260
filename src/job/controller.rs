//! Job controller
//!
//! Owns the lifecycle of every submitted job: validation, planning, dispatch to a
//! per-job worker pool, retry of failed batches, aggregation and the terminal event.
//! Callers observe a job through the event channel they hand to
//! [`JobController::submit`] and through the returned [`JobHandle`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{
    AggregatedResults, Batch, BatchId, BatchInfrastructureError, BatchPlanner, BatchResult,
    BatchSizing, MergeOutcome, ProgressSnapshot, ProgressTracker, ResultAggregator, RetryDecision,
    RetryPolicy, WorkerEvent, WorkerPool,
};
use crate::config::EngineConfig;
use crate::job::events::{CancelRequest, CompletionEvent, JobEvent, JobId, JobStatistics, ProgressEvent};
use crate::job::request::{JobRequest, ValidatedJob};
use crate::job::state::{JobState, StateMachine};
use crate::metrics::OverlayMetrics;
use crate::overlay::{GeometryOverlay, Operation, OverlayComputer};
use crate::Result;

/// How long a finished job waits for its workers to exit before detaching them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Channel a caller hands in to receive a job's events
pub type EventSender = mpsc::UnboundedSender<JobEvent>;

type CancelSignal = Arc<watch::Sender<bool>>;

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// All pairs accounted for
    Completed(CompletionEvent),
    /// Cancelled on request
    Cancelled,
    /// Job-level failure
    Failed(String),
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Caller-side view of a running job
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    state: watch::Receiver<JobState>,
    cancel: CancelSignal,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    /// Job identifier
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Latest state
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Request cancellation; `false` if already requested or the job has finished
    pub fn cancel(&self) -> bool {
        !self.state().is_terminal() && !self.cancel.send_replace(true)
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> Result<JobOutcome> {
        Ok(self.task.await?)
    }
}

/// Accepts overlay jobs and runs each one on its own worker pool
#[derive(Clone)]
pub struct JobController {
    config: EngineConfig,
    computer: Arc<dyn OverlayComputer>,
    planner: BatchPlanner,
    jobs: Arc<DashMap<JobId, CancelSignal>>,
}

impl fmt::Debug for JobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobController")
            .field("config", &self.config)
            .field("active_jobs", &self.jobs.len())
            .finish()
    }
}

impl JobController {
    /// Controller using [`GeometryOverlay`]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            computer: Arc::new(GeometryOverlay),
            planner: BatchPlanner,
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Replace the per-pair computer
    pub fn with_computer<C: OverlayComputer>(mut self, computer: C) -> Self {
        self.computer = Arc::new(computer);
        self
    }

    /// Configuration every job starts from
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Jobs that have not reached a terminal state
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Cancel a live job by id; `false` if unknown, finished or already cancelled
    pub fn cancel(&self, request: &CancelRequest) -> bool {
        match self.jobs.get(&request.job_id) {
            Some(signal) => {
                let newly_requested = !signal.send_replace(true);
                if newly_requested {
                    info!(job_id = %request.job_id, "Cancellation requested");
                }
                newly_requested
            }
            None => {
                debug!(job_id = %request.job_id, "Cancellation for unknown or finished job");
                false
            }
        }
    }

    /// Validate and start a job.
    ///
    /// A rejected request moves the job straight to `Failed`, emits the matching
    /// events and returns the rejection reason. Must be called within a tokio runtime.
    #[instrument(skip(self, request, events), fields(operation = %request.operation))]
    pub fn submit(&self, request: JobRequest, events: EventSender) -> Result<JobHandle> {
        let id = JobId::new();
        let operation_label = request
            .operation
            .parse::<Operation>()
            .map(|op| op.as_str())
            .unwrap_or("unknown");
        let mut machine = StateMachine::new();
        let (state_tx, state_rx) = watch::channel(JobState::Pending);

        let job = match request.validate() {
            Ok(job) => job,
            Err(error) => {
                error!(job_id = %id, %error, "Rejecting overlay job");
                if let Ok(from) = machine.transition(JobState::Failed) {
                    state_tx.send_replace(JobState::Failed);
                    let _ = events.send(JobEvent::StateChanged {
                        job_id: id,
                        from,
                        to: JobState::Failed,
                    });
                }
                let _ = events.send(JobEvent::Failed {
                    job_id: id,
                    reason: error.to_string(),
                });
                OverlayMetrics::new(operation_label).record_job_outcome("rejected");
                return Err(error.into());
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);
        self.jobs.insert(id, Arc::clone(&cancel));

        info!(
            job_id = %id,
            total_pairs = job.total_pairs,
            targets = job.inputs.targets.len(),
            masks = job.inputs.masks.len(),
            "Overlay job accepted"
        );

        let run = JobRun {
            id,
            config: self.config.clone(),
            computer: Arc::clone(&self.computer),
            planner: self.planner,
            metrics: OverlayMetrics::new(job.inputs.operation.as_str()),
            job,
            events,
            machine,
            state: state_tx,
            registry: Arc::clone(&self.jobs),
        };
        let task = tokio::spawn(run.run(cancel_rx));

        Ok(JobHandle {
            id,
            state: state_rx,
            cancel,
            task,
        })
    }
}

/// One job's run loop
struct JobRun {
    id: JobId,
    config: EngineConfig,
    computer: Arc<dyn OverlayComputer>,
    planner: BatchPlanner,
    job: ValidatedJob,
    events: EventSender,
    machine: StateMachine,
    state: watch::Sender<JobState>,
    registry: Arc<DashMap<JobId, CancelSignal>>,
    metrics: OverlayMetrics,
}

impl JobRun {
    #[instrument(skip_all, fields(job_id = %self.id, operation = %self.job.inputs.operation))]
    async fn run(mut self, mut cancel: watch::Receiver<bool>) -> JobOutcome {
        self.metrics.record_job_started();
        let outcome = self.drive(&mut cancel).await;
        self.registry.remove(&self.id);
        self.metrics.record_job_finished(outcome.label());
        outcome
    }

    async fn drive(&mut self, cancel: &mut watch::Receiver<bool>) -> JobOutcome {
        if *cancel.borrow() {
            return self.cancelled(None);
        }

        self.transition(JobState::Planning);
        let began = Instant::now();
        let inputs = Arc::clone(&self.job.inputs);
        let total_pairs = self.job.total_pairs;
        let sizing = match self.job.batch_size_hint {
            Some(max_pairs) => BatchSizing::MaxPairs(max_pairs),
            None => BatchSizing::Workers {
                workers: self.config.worker_count,
                batches_per_worker: self.config.batches_per_worker,
            },
        };
        let spans = match self
            .planner
            .plan(inputs.targets.len(), inputs.masks.len(), sizing)
        {
            Ok(spans) => spans,
            Err(e) => return self.failed(format!("planning failed: {e}")),
        };
        let mut tracker = ProgressTracker::new(total_pairs);

        if spans.is_empty() {
            if let Some(snapshot) = tracker.observe(0) {
                self.emit_progress(snapshot, 0, 0);
            }
            self.transition(JobState::Completed);
            let done = CompletionEvent {
                job_id: self.id,
                results: Vec::new(),
                skipped_pairs: 0,
                failed_batch_count: 0,
                total_pairs: 0,
                invalid_pairs: 0,
                statistics: JobStatistics::new(
                    inputs.targets.len(),
                    inputs.masks.len(),
                    0,
                    began.elapsed(),
                    Duration::ZERO,
                ),
            };
            info!("Overlay job has no pairs, completed immediately");
            self.emit(JobEvent::Completed(done.clone()));
            return JobOutcome::Completed(done);
        }

        if *cancel.borrow() {
            return self.cancelled(None);
        }

        self.transition(JobState::Dispatching);
        let batches: Vec<Batch> = spans
            .into_iter()
            .map(|span| Batch::new(span, Arc::clone(&inputs)))
            .collect();
        let (pool, mut worker_events) = WorkerPool::spawn(
            self.config.worker_count.min(batches.len()),
            Arc::clone(&self.computer),
            self.metrics,
        );
        info!(
            batches = batches.len(),
            workers = pool.size(),
            total_pairs,
            "Dispatching overlay batches"
        );

        let mut dispatcher = Dispatcher {
            pool,
            queue: (0..batches.len())
                .map(|index| Pending {
                    batch_id: BatchId(index),
                    attempt: 1,
                    avoid: None,
                })
                .collect(),
            in_flight: HashMap::with_capacity(batches.len()),
            aggregator: ResultAggregator::new(total_pairs),
            tracker,
            retry: RetryPolicy::new(self.config.max_batch_attempts),
            timeout: self.config.batch_timeout(),
            metrics: self.metrics,
            batches,
        };

        if let Some(snapshot) = dispatcher.pump() {
            self.emit_progress(snapshot, dispatcher.completed_batches(), dispatcher.total_batches());
        }

        self.transition(JobState::Running);

        while !dispatcher.is_complete() {
            let deadline = dispatcher.next_deadline();
            let progress = tokio::select! {
                biased;

                _ = cancellation(cancel) => return self.cancelled(Some(dispatcher)),

                event = worker_events.recv() => match event {
                    Some(event) => {
                        let progress = dispatcher.on_event(event);
                        dispatcher.pump().or(progress)
                    }
                    None => {
                        warn!("Every worker exited with batches outstanding");
                        let progress = dispatcher.fail_outstanding();
                        if progress.is_none() && !dispatcher.is_complete() {
                            dispatcher.abandon();
                            return self.failed("worker pool exited with unaccounted pairs".to_string());
                        }
                        progress
                    }
                },

                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let progress = dispatcher.expire(Instant::now());
                    dispatcher.pump().or(progress)
                }
            };

            if let Some(snapshot) = progress {
                self.emit_progress(snapshot, dispatcher.completed_batches(), dispatcher.total_batches());
            }
        }

        if *cancel.borrow() {
            return self.cancelled(Some(dispatcher));
        }

        self.transition(JobState::Aggregating);
        let (aggregated, pool) = dispatcher.finalize(inputs.operation);
        drop(worker_events);

        let statistics = JobStatistics::new(
            inputs.targets.len(),
            inputs.masks.len(),
            aggregated.results.len(),
            began.elapsed(),
            aggregated.batch_time,
        );
        let done = CompletionEvent {
            job_id: self.id,
            statistics,
            skipped_pairs: aggregated.skipped_pairs,
            failed_batch_count: aggregated.failed_batch_count,
            total_pairs: aggregated.total_pairs,
            invalid_pairs: aggregated.invalid_pairs,
            results: aggregated.results,
        };
        self.transition(JobState::Completed);
        info!(
            results = done.results.len(),
            skipped_pairs = done.skipped_pairs,
            invalid_pairs = done.invalid_pairs,
            failed_batches = done.failed_batch_count,
            success_rate = done.statistics.success_rate,
            elapsed_ms = done.statistics.processing_time_ms,
            "Overlay job completed"
        );
        self.emit(JobEvent::Completed(done.clone()));

        stop_pool(pool).await;
        JobOutcome::Completed(done)
    }

    fn cancelled(&mut self, dispatcher: Option<Dispatcher>) -> JobOutcome {
        if let Some(dispatcher) = dispatcher {
            dispatcher.abandon();
        }
        self.transition(JobState::Cancelled);
        info!("Overlay job cancelled, partial results discarded");
        self.emit(JobEvent::Cancelled { job_id: self.id });
        JobOutcome::Cancelled
    }

    fn failed(&mut self, reason: String) -> JobOutcome {
        self.transition(JobState::Failed);
        error!(%reason, "Overlay job failed");
        self.emit(JobEvent::Failed {
            job_id: self.id,
            reason: reason.clone(),
        });
        JobOutcome::Failed(reason)
    }

    fn transition(&mut self, next: JobState) {
        match self.machine.transition(next) {
            Ok(from) => {
                self.state.send_replace(next);
                debug!(%from, to = %next, "Job state changed");
                self.emit(JobEvent::StateChanged {
                    job_id: self.id,
                    from,
                    to: next,
                });
            }
            Err(e) => warn!(error = %e, "Ignoring state transition"),
        }
    }

    fn emit_progress(&self, snapshot: ProgressSnapshot, completed_batches: usize, total_batches: usize) {
        debug!(
            processed = snapshot.processed_pairs,
            total = snapshot.total_pairs,
            percent = snapshot.percent,
            "Progress"
        );
        self.emit(JobEvent::Progress(ProgressEvent {
            job_id: self.id,
            processed_pairs: snapshot.processed_pairs,
            total_pairs: snapshot.total_pairs,
            percent: snapshot.percent,
            completed_batches,
            total_batches,
        }));
    }

    fn emit(&self, event: JobEvent) {
        // The caller may have stopped listening; the job still runs to its end.
        let _ = self.events.send(event);
    }
}

/// Resolves once cancellation is requested; never if it cannot be anymore
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn stop_pool(pool: WorkerPool) {
    pool.terminate();
    if pool.stalled_workers() > 0 {
        warn!(stalled = pool.stalled_workers(), "Detaching workers stuck past the batch timeout");
        return;
    }
    if time::timeout(SHUTDOWN_GRACE, pool.shutdown()).await.is_err() {
        warn!(grace = ?SHUTDOWN_GRACE, "Workers still busy after grace period, detaching");
    }
}

struct InFlight {
    attempt: u32,
    worker: usize,
    started: Option<Instant>,
}

/// A batch attempt waiting for an idle worker
struct Pending {
    batch_id: BatchId,
    attempt: u32,
    avoid: Option<usize>,
}

/// Batch bookkeeping for the Running phase.
///
/// Every planned batch is queued, in flight or merged into the aggregator, so the
/// job completes exactly when the aggregator has seen every pair. Workers hold one
/// batch at a time; the queue drains as they report back.
struct Dispatcher {
    pool: WorkerPool,
    batches: Vec<Batch>,
    queue: VecDeque<Pending>,
    in_flight: HashMap<BatchId, InFlight>,
    aggregator: ResultAggregator,
    tracker: ProgressTracker,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    metrics: OverlayMetrics,
}

impl Dispatcher {
    fn total_batches(&self) -> usize {
        self.batches.len()
    }

    fn completed_batches(&self) -> usize {
        self.aggregator.merged_batches()
    }

    fn is_complete(&self) -> bool {
        self.aggregator.is_complete()
    }

    /// Hand queued batches to idle workers, in queue order.
    ///
    /// Once no worker is usable the remaining queue fails with `NoWorkers`.
    fn pump(&mut self) -> Option<ProgressSnapshot> {
        let mut progress = None;
        while let Some(next) = self.queue.front() {
            let (batch_id, attempt, avoid) = (next.batch_id, next.attempt, next.avoid);
            let Some(batch) = self.batches.get(batch_id.0).cloned() else {
                warn!(%batch_id, "Dispatch requested for unknown batch");
                self.queue.pop_front();
                continue;
            };
            match self.pool.dispatch(batch, attempt, avoid) {
                Ok(Some(worker)) => {
                    self.queue.pop_front();
                    debug!(%batch_id, attempt, worker, "Dispatched batch");
                    self.in_flight.insert(
                        batch_id,
                        InFlight {
                            attempt,
                            worker,
                            started: None,
                        },
                    );
                }
                Ok(None) => break,
                Err(error) => {
                    self.queue.pop_front();
                    progress = self.give_up(batch_id, error).or(progress);
                }
            }
        }
        progress
    }

    /// In-flight entry for `batch_id` if `attempt` is the one we are waiting for
    fn current(&mut self, batch_id: BatchId, attempt: u32) -> Option<&mut InFlight> {
        self.in_flight
            .get_mut(&batch_id)
            .filter(|entry| entry.attempt == attempt)
    }

    fn on_event(&mut self, event: WorkerEvent) -> Option<ProgressSnapshot> {
        match event {
            WorkerEvent::BatchStarted {
                worker,
                batch_id,
                attempt,
            } => {
                if let Some(entry) = self.current(batch_id, attempt) {
                    entry.worker = worker;
                    entry.started = Some(Instant::now());
                }
                None
            }
            WorkerEvent::BatchComplete {
                worker,
                attempt,
                result,
            } => {
                self.pool.release(worker);
                if self.current(result.batch_id, attempt).is_none() {
                    debug!(batch_id = %result.batch_id, attempt, worker, "Discarding stale batch reply");
                    return None;
                }
                self.in_flight.remove(&result.batch_id);
                self.account(result)
            }
            WorkerEvent::BatchFailed {
                worker,
                batch_id,
                attempt,
                error,
            } => {
                self.pool.release(worker);
                if self.current(batch_id, attempt).is_none() {
                    debug!(%batch_id, attempt, worker, "Discarding stale batch failure");
                    return None;
                }
                self.on_failure(batch_id, attempt, Some(worker), error)
            }
        }
    }

    fn on_failure(
        &mut self,
        batch_id: BatchId,
        attempt: u32,
        worker: Option<usize>,
        error: BatchInfrastructureError,
    ) -> Option<ProgressSnapshot> {
        self.in_flight.remove(&batch_id);
        match self.retry.decide(attempt, worker, &error) {
            RetryDecision::Retry {
                attempt: next,
                avoid_worker,
            } => {
                warn!(%batch_id, attempt, %error, "Batch failed, retrying on another worker");
                self.metrics.record_batch_failure("retried");
                self.queue.push_front(Pending {
                    batch_id,
                    attempt: next,
                    avoid: avoid_worker,
                });
                None
            }
            RetryDecision::PermanentFailure => self.give_up(batch_id, error),
        }
    }

    fn give_up(&mut self, batch_id: BatchId, error: BatchInfrastructureError) -> Option<ProgressSnapshot> {
        let span = self.batches.get(batch_id.0)?.span.clone();
        error!(
            %batch_id,
            %error,
            pairs = span.pair_count(),
            "Batch failed permanently, its pairs yield no results"
        );
        self.metrics.record_batch_failure("permanent");
        self.account(BatchResult::permanently_failed(&span, error))
    }

    fn account(&mut self, result: BatchResult) -> Option<ProgressSnapshot> {
        if !result.is_failed() {
            self.metrics.record_pairs(
                result.items.len() as u64,
                result.skipped_pairs,
                result.invalid_pairs,
            );
        }
        match self.aggregator.merge(result) {
            MergeOutcome::Merged => self.tracker.observe(self.aggregator.processed_pairs()),
            MergeOutcome::Duplicate => None,
        }
    }

    /// Earliest moment a started batch exceeds the timeout
    fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        self.in_flight
            .values()
            .filter_map(|entry| entry.started)
            .min()
            .map(|started| started + timeout)
    }

    /// Fail every started batch whose timeout has elapsed at `now`.
    ///
    /// The worker running it is stalled and receives no further batches unless
    /// it eventually replies.
    fn expire(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        let timeout = self.timeout?;
        let mut expired: Vec<_> = self
            .in_flight
            .iter()
            .filter_map(|(batch_id, entry)| {
                let elapsed = now.duration_since(entry.started?);
                (elapsed >= timeout).then_some((*batch_id, entry.attempt, entry.worker, elapsed))
            })
            .collect();
        expired.sort_by_key(|(batch_id, ..)| *batch_id);

        let mut progress = None;
        for (batch_id, attempt, worker, elapsed) in expired {
            warn!(%batch_id, attempt, worker, ?elapsed, "Batch timed out");
            self.metrics.record_batch_failure("timeout");
            self.pool.mark_stalled(worker);
            progress = self
                .on_failure(
                    batch_id,
                    attempt,
                    Some(worker),
                    BatchInfrastructureError::TimedOut { elapsed },
                )
                .or(progress);
        }
        progress
    }

    /// Account every queued and in-flight batch as permanently failed
    fn fail_outstanding(&mut self) -> Option<ProgressSnapshot> {
        let mut outstanding: Vec<BatchId> = self
            .in_flight
            .drain()
            .map(|(batch_id, _)| batch_id)
            .chain(self.queue.drain(..).map(|pending| pending.batch_id))
            .collect();
        outstanding.sort();

        let mut progress = None;
        for batch_id in outstanding {
            progress = self
                .give_up(batch_id, BatchInfrastructureError::NoWorkers)
                .or(progress);
        }
        progress
    }

    /// Stop workers without waiting; late replies are dropped with the event receiver
    fn abandon(self) {
        self.pool.terminate();
    }

    fn finalize(self, operation: Operation) -> (AggregatedResults, WorkerPool) {
        (self.aggregator.finalize(operation), self.pool)
    }
}
