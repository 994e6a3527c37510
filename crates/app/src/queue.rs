use std::time::Duration;

use metrics::counter;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use budgetwatch_core::retry::RetryPolicy;
use budgetwatch_core::types::ThresholdCrossingEvent;
use budgetwatch_storage::{Database, NewFailureRecord};

use crate::dispatch::NotificationDispatcher;
use crate::monitor::{BudgetMonitor, TickError};

/// Unit of work carried by the in-process job queue.
#[derive(Debug, Clone)]
pub enum Task {
    /// Re-evaluate one campaign's spend against its threshold schedule.
    Evaluate { campaign_id: String },
    /// Fan one crossing event out to the campaign's recipients.
    Dispatch { event: ThresholdCrossingEvent },
}

impl Task {
    fn kind(&self) -> &'static str {
        match self {
            Self::Evaluate { .. } => "evaluate",
            Self::Dispatch { .. } => "dispatch",
        }
    }

    fn campaign_id(&self) -> &str {
        match self {
            Self::Evaluate { campaign_id } => campaign_id,
            Self::Dispatch { event } => &event.campaign_id,
        }
    }
}

/// A task plus the attempt number this execution represents (starting at 1).
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub attempt: u32,
}

/// Error returned when the queue's worker has shut down.
#[derive(Debug, Error)]
#[error("job queue is closed")]
pub struct QueueClosed;

/// Error returned by the non-blocking enqueue. The runner and anything it
/// calls must use this path: awaiting a send into the queue the runner
/// itself drains would deadlock once the queue is full.
#[derive(Debug, Error)]
pub enum TryEnqueueError {
    #[error("job queue is full")]
    Full,
    #[error("job queue is closed")]
    Closed,
}

/// Sending half of the in-process job queue.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<QueuedTask>,
}

impl JobQueue {
    /// Creates a bounded queue and returns the receiver for the runner.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<QueuedTask>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Enqueues a fresh task as its first attempt, waiting for capacity.
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueClosed> {
        self.requeue(QueuedTask { task, attempt: 1 }).await
    }

    /// Enqueues a fresh task without waiting for capacity.
    pub fn try_enqueue(&self, task: Task) -> Result<(), TryEnqueueError> {
        self.sender
            .try_send(QueuedTask { task, attempt: 1 })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => TryEnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => TryEnqueueError::Closed,
            })
    }

    async fn requeue(&self, queued: QueuedTask) -> Result<(), QueueClosed> {
        self.sender.send(queued).await.map_err(|_| QueueClosed)
    }
}

/// Adds up to 20% random jitter so retries from one incident spread out.
pub(crate) fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = (delay.as_millis() as u64) / 5;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

/// Worker that drains the queue, executing evaluations and dispatches.
///
/// Transient failures are rescheduled with exponential backoff; permanent
/// failures are dropped after the owning component has recorded them.
pub struct JobRunner {
    queue: JobQueue,
    receiver: mpsc::Receiver<QueuedTask>,
    monitor: BudgetMonitor,
    dispatcher: NotificationDispatcher,
    database: Database,
    retry: RetryPolicy,
}

impl JobRunner {
    pub fn new(
        queue: JobQueue,
        receiver: mpsc::Receiver<QueuedTask>,
        monitor: BudgetMonitor,
        dispatcher: NotificationDispatcher,
        database: Database,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            receiver,
            monitor,
            dispatcher,
            database,
            retry,
        }
    }

    /// Runs the worker loop in the background until the queue closes.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        while let Some(queued) = self.receiver.recv().await {
            self.handle(queued).await;
        }
        info!(stage = "queue", "job queue closed, runner stopping");
    }

    async fn handle(&self, queued: QueuedTask) {
        match &queued.task {
            Task::Evaluate { campaign_id } => match self.monitor.tick(campaign_id).await {
                Ok(crossed) => {
                    debug!(
                        stage = "queue",
                        campaign_id,
                        crossed = crossed.len(),
                        "evaluation completed"
                    );
                }
                Err(TickError::NotFound) => {
                    // The campaign was deleted after the task was queued.
                    warn!(stage = "queue", campaign_id, "dropping evaluation for unknown campaign");
                }
                Err(err) if err.is_transient() => {
                    self.retry_or_abandon(queued.clone(), err.to_string()).await;
                }
                Err(err) => {
                    // Permanent; the monitor already halted and recorded it.
                    warn!(stage = "queue", campaign_id, error = %err, "dropping failed evaluation");
                }
            },
            Task::Dispatch { event } => match self.dispatcher.dispatch(event).await {
                Ok(receipt) => {
                    info!(
                        stage = "queue",
                        campaign_id = %event.campaign_id,
                        threshold = %event.threshold,
                        delivered = receipt.delivered.len(),
                        failed = receipt.failed.len(),
                        suppressed = receipt.suppressed,
                        "dispatch completed"
                    );
                }
                Err(err) => {
                    // Dispatch errors are storage-level and retry-safe; the
                    // delivery log dedupes anything that already went out.
                    self.retry_or_abandon(queued.clone(), err.to_string()).await;
                }
            },
        }
    }

    async fn retry_or_abandon(&self, queued: QueuedTask, detail: String) {
        let kind = queued.task.kind();
        if self.retry.is_exhausted(queued.attempt) {
            error!(
                stage = "queue",
                task = kind,
                campaign_id = queued.task.campaign_id(),
                attempts = queued.attempt,
                error = %detail,
                "abandoning task after exhausting retries"
            );

            let threshold = match &queued.task {
                Task::Dispatch { event } => Some(event.threshold),
                Task::Evaluate { .. } => None,
            };
            let record = NewFailureRecord::new(
                queued.task.campaign_id(),
                threshold,
                "task_retries_exhausted",
                format!("{kind} task failed {} times: {detail}", queued.attempt),
                chrono::Utc::now(),
            );
            if let Err(err) = self.database.failure_log().record(&record).await {
                error!(stage = "queue", error = %err, "failed to record abandoned task");
            } else {
                counter!("failure_log_records_total", "kind" => "task_retries_exhausted")
                    .increment(1);
            }
            return;
        }

        let delay = with_jitter(self.retry.delay_for(queued.attempt));
        counter!("job_retries_total", "task" => kind).increment(1);
        warn!(
            stage = "queue",
            task = kind,
            campaign_id = queued.task.campaign_id(),
            attempt = queued.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %detail,
            "rescheduling task after transient failure"
        );

        let queue = self.queue.clone();
        let next = QueuedTask {
            task: queued.task,
            attempt: queued.attempt + 1,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.requeue(next).await.is_err() {
                warn!(stage = "queue", "queue closed before a rescheduled task could run");
            }
        });
    }
}
