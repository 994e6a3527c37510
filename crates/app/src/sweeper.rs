use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use budgetwatch_storage::{CampaignError, Database};

use crate::queue::{JobQueue, QueueClosed, Task};

/// Background worker that periodically enqueues an evaluation for every
/// active, non-halted campaign. Evaluation stays idempotent, so a sweep that
/// overlaps with ingest-triggered evaluations is harmless.
pub struct EvaluationSweeper {
    database: Database,
    queue: JobQueue,
    interval: Duration,
}

impl EvaluationSweeper {
    pub fn new(database: Database, queue: JobQueue, interval: Duration) -> Self {
        Self {
            database,
            queue,
            interval,
        }
    }

    /// Runs the sweep loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(enqueued) => {
                    info!(stage = "sweeper", enqueued, "evaluation sweep completed");
                }
                Err(SweepError::QueueClosed(_)) => {
                    info!(stage = "sweeper", "job queue closed, sweeper stopping");
                    return;
                }
                Err(err) => {
                    error!(stage = "sweeper", error = %err, "evaluation sweep failed");
                }
            }
        }
    }

    /// Executes one sweep and returns the number of campaigns enqueued.
    pub async fn run_once(&self) -> Result<usize, SweepError> {
        let campaign_ids = self.database.campaigns().list_active_for_evaluation().await?;
        let enqueued = campaign_ids.len();

        for campaign_id in campaign_ids {
            self.queue.enqueue(Task::Evaluate { campaign_id }).await?;
        }

        counter!("sweep_campaigns_total").increment(enqueued as u64);
        Ok(enqueued)
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("failed to list campaigns for the sweep: {0}")]
    List(#[from] CampaignError),
    #[error("failed to enqueue evaluation: {0}")]
    QueueClosed(#[from] QueueClosed),
}
