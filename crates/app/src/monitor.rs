use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use budgetwatch_core::evaluator::{evaluate, EvaluateError};
use budgetwatch_core::types::{
    CampaignState, ThresholdBps, ThresholdCrossingEvent, ThresholdSchedule,
};
use budgetwatch_storage::{
    CampaignError, Database, NewFailureRecord, SpendMetricError, WatermarkError,
};

use crate::queue::{JobQueue, Task, TryEnqueueError};

/// In-process mutual exclusion for campaign evaluation.
///
/// One lease per campaign id; entries are created on demand and never
/// removed, so the map is bounded by the number of campaigns seen.
#[derive(Clone, Default)]
pub struct CampaignLeases {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CampaignLeases {
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(
        &self,
        campaign_id: &str,
        lease_timeout: Duration,
    ) -> Option<OwnedMutexGuard<()>> {
        let lease = {
            let mut map = self.inner.lock().expect("lease map poisoned");
            map.entry(campaign_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        tokio::time::timeout(lease_timeout, lease.lock_owned())
            .await
            .ok()
    }
}

/// Drives one campaign through the evaluation cycle: load budget and spend,
/// compare against the threshold schedule, and hand newly crossed thresholds
/// to the dispatcher through the job queue.
///
/// Each crossing is enqueued before its watermark advance, so a crash between
/// the two re-fires the threshold on the next evaluation and the delivery log
/// suppresses the duplicates.
#[derive(Clone)]
pub struct BudgetMonitor {
    database: Database,
    queue: JobQueue,
    defaults: ThresholdSchedule,
    leases: CampaignLeases,
    lease_timeout: Duration,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl BudgetMonitor {
    pub fn new(
        database: Database,
        queue: JobQueue,
        defaults: ThresholdSchedule,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            database,
            queue,
            defaults,
            leases: CampaignLeases::new(),
            lease_timeout,
            clock: Arc::new(Utc::now),
        }
    }

    /// Evaluates one campaign and returns the thresholds fired this cycle.
    pub async fn tick(&self, campaign_id: &str) -> Result<Vec<ThresholdBps>, TickError> {
        let _lease = self
            .leases
            .acquire(campaign_id, self.lease_timeout)
            .await
            .ok_or(TickError::LeaseTimeout)?;

        let campaign = match self
            .database
            .campaigns()
            .fetch_for_evaluation(campaign_id)
            .await
        {
            Ok(campaign) => campaign,
            Err(CampaignError::NotFound) => return Err(TickError::NotFound),
            Err(CampaignError::InvalidBudget { budget }) => {
                self.halt(
                    campaign_id,
                    "invalid_budget",
                    format!("campaign budget is not positive: {budget}"),
                )
                .await?;
                return Err(TickError::InvalidBudget);
            }
            Err(err @ (CampaignError::InvalidState(_) | CampaignError::Decode(_))) => {
                self.halt(campaign_id, "corrupt_campaign", err.to_string())
                    .await?;
                return Err(TickError::CorruptCampaign(err.to_string()));
            }
            Err(CampaignError::Database(err)) => return Err(TickError::Storage(err.to_string())),
        };

        if campaign.state != CampaignState::Active || campaign.evaluation_halted {
            debug!(
                stage = "monitor",
                campaign_id,
                state = campaign.state.as_str(),
                halted = campaign.evaluation_halted,
                "skipping inactive campaign"
            );
            return Ok(Vec::new());
        }

        let spend = match self.database.spend_metrics().aggregate(campaign_id).await {
            Ok(spend) => spend,
            Err(SpendMetricError::UnknownCampaign) => return Err(TickError::NotFound),
            Err(SpendMetricError::Database(err)) => {
                return Err(TickError::Storage(err.to_string()))
            }
        };

        let watermark = match self.database.watermarks().get(campaign_id).await {
            Ok(watermark) => watermark,
            Err(err @ WatermarkError::Corrupt(_)) => {
                self.halt(campaign_id, "corrupt_watermark", err.to_string())
                    .await?;
                return Err(TickError::CorruptCampaign(err.to_string()));
            }
            Err(WatermarkError::UnknownCampaign) => return Err(TickError::NotFound),
            Err(WatermarkError::Database(err)) => {
                return Err(TickError::Storage(err.to_string()))
            }
        };

        let schedule = campaign.thresholds.as_ref().unwrap_or(&self.defaults);
        let crossed = match evaluate(campaign.budget, spend, schedule, watermark) {
            Ok(crossed) => crossed,
            Err(EvaluateError::InvalidBudget(budget)) => {
                self.halt(
                    campaign_id,
                    "invalid_budget",
                    format!("campaign budget is not positive: {budget}"),
                )
                .await?;
                return Err(TickError::InvalidBudget);
            }
            Err(EvaluateError::NegativeSpend(spend)) => {
                self.halt(
                    campaign_id,
                    "negative_spend",
                    format!("aggregate spend is negative: {spend}"),
                )
                .await?;
                return Err(TickError::NegativeSpend);
            }
        };

        let mut expected = watermark;
        let mut fired = Vec::with_capacity(crossed.len());
        for threshold in crossed {
            let now = (self.clock)();
            let event = ThresholdCrossingEvent::new(
                campaign_id,
                campaign.org_id.clone(),
                threshold,
                spend,
                campaign.budget,
                now,
            )
            .map_err(|err| TickError::CorruptCampaign(err.to_string()))?;

            // Never await a send here: the runner executing this tick is the
            // queue's only consumer, so a blocking send on a full queue would
            // never complete. A full queue aborts the pass with the watermark
            // at the last committed threshold; the retried tick resumes there.
            self.queue
                .try_enqueue(Task::Dispatch { event })
                .map_err(|err| match err {
                    TryEnqueueError::Full => TickError::QueueFull,
                    TryEnqueueError::Closed => TickError::QueueClosed,
                })?;

            let advanced = self
                .database
                .watermarks()
                .compare_and_set(campaign_id, expected, threshold, now)
                .await
                .map_err(|err| TickError::Storage(err.to_string()))?;
            if !advanced {
                // A competing evaluation moved the watermark first. Stop
                // here; the enqueued dispatch dedupes against its log.
                counter!("budget_evaluations_total", "result" => "conflict").increment(1);
                warn!(
                    stage = "monitor",
                    campaign_id,
                    threshold = %threshold,
                    "watermark advance lost to a concurrent evaluation"
                );
                return Ok(fired);
            }

            counter!("threshold_crossings_total").increment(1);
            info!(
                stage = "monitor",
                campaign_id,
                threshold = %threshold,
                spend = %spend,
                budget = %campaign.budget,
                "threshold crossed"
            );
            expected = Some(threshold);
            fired.push(threshold);
        }

        counter!("budget_evaluations_total", "result" => "completed").increment(1);
        Ok(fired)
    }

    /// Excludes the campaign from evaluation and leaves an operator-visible
    /// failure record explaining why.
    async fn halt(
        &self,
        campaign_id: &str,
        kind: &'static str,
        detail: String,
    ) -> Result<(), TickError> {
        let now = (self.clock)();
        let halted_now = self
            .database
            .campaigns()
            .mark_evaluation_halted(campaign_id, now)
            .await
            .map_err(|err| TickError::Storage(err.to_string()))?;
        if !halted_now {
            // Already halted and recorded; keep the operator log clean.
            debug!(stage = "monitor", campaign_id, kind, "campaign is already halted");
            return Ok(());
        }

        self.database
            .failure_log()
            .record(&NewFailureRecord::new(
                campaign_id,
                None,
                kind,
                detail.clone(),
                now,
            ))
            .await
            .map_err(|err| TickError::Storage(err.to_string()))?;

        counter!("failure_log_records_total", "kind" => kind).increment(1);
        counter!("budget_evaluations_total", "result" => "halted").increment(1);
        warn!(stage = "monitor", campaign_id, kind, detail = %detail, "campaign evaluation halted");
        Ok(())
    }
}

/// Errors raised by one evaluation cycle.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("campaign not found")]
    NotFound,
    #[error("campaign budget is not positive")]
    InvalidBudget,
    #[error("aggregate spend is negative")]
    NegativeSpend,
    #[error("campaign cannot be evaluated: {0}")]
    CorruptCampaign(String),
    #[error("timed out waiting for the campaign evaluation lease")]
    LeaseTimeout,
    #[error("job queue is full")]
    QueueFull,
    #[error("job queue is closed")]
    QueueClosed,
    #[error("storage error during evaluation: {0}")]
    Storage(String),
}

impl TickError {
    /// Retry-safe errors; everything else either recurs deterministically or
    /// has already halted the campaign.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LeaseTimeout | Self::QueueFull | Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuedTask;
    use budgetwatch_core::types::Money;
    use tokio::sync::mpsc;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        sqlx::query(
            "INSERT INTO organizations (id, name, created_at) \
             VALUES ('org-1', 'Example Org', '2025-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .expect("insert org");
        sqlx::query(
            "INSERT INTO campaigns (id, org_id, name, budget_minor, currency, state, evaluation_halted, created_at, updated_at) \
             VALUES ('c-1', 'org-1', 'Spring Launch', 10000, 'USD', 'ACTIVE', 0, '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .expect("insert campaign");
        db
    }

    async fn record_spend(db: &Database, campaign_id: &str, amount: i64) {
        let now = Utc::now();
        db.spend_metrics()
            .record(&budgetwatch_storage::NewSpendMetric::new(
                campaign_id,
                Money::from_minor(amount),
                now,
                now,
            ))
            .await
            .expect("record spend");
    }

    fn monitor(db: &Database, queue: JobQueue) -> BudgetMonitor {
        BudgetMonitor::new(
            db.clone(),
            queue,
            ThresholdSchedule::default(),
            Duration::from_secs(1),
        )
    }

    fn bps(value: u32) -> ThresholdBps {
        ThresholdBps::new(value).unwrap()
    }

    fn drain(receiver: &mut mpsc::Receiver<QueuedTask>) -> Vec<QueuedTask> {
        let mut tasks = Vec::new();
        while let Ok(task) = receiver.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    #[tokio::test]
    async fn tick_fires_crossed_thresholds_in_ascending_order() {
        let db = setup_db().await;
        let (queue, mut receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);
        record_spend(&db, "c-1", 9_500).await;

        let fired = monitor.tick("c-1").await.expect("tick");
        assert_eq!(fired, vec![bps(8_000), bps(9_000)]);
        assert_eq!(
            db.watermarks().get("c-1").await.expect("watermark"),
            Some(bps(9_000))
        );

        let tasks = drain(&mut receiver);
        assert_eq!(tasks.len(), 2);
        let thresholds: Vec<_> = tasks
            .iter()
            .map(|queued| match &queued.task {
                Task::Dispatch { event } => event.threshold,
                other => panic!("unexpected task: {other:?}"),
            })
            .collect();
        assert_eq!(thresholds, vec![bps(8_000), bps(9_000)]);
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_refire_thresholds() {
        let db = setup_db().await;
        let (queue, mut receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);
        record_spend(&db, "c-1", 8_200).await;

        assert_eq!(monitor.tick("c-1").await.expect("tick"), vec![bps(8_000)]);
        assert!(monitor.tick("c-1").await.expect("tick").is_empty());
        assert_eq!(drain(&mut receiver).len(), 1);

        // More spend past the next threshold fires only the new one.
        record_spend(&db, "c-1", 1_000).await;
        assert_eq!(monitor.tick("c-1").await.expect("tick"), vec![bps(9_000)]);
    }

    #[tokio::test]
    async fn campaign_threshold_override_takes_precedence() {
        let db = setup_db().await;
        sqlx::query("UPDATE campaigns SET thresholds_json = '[5000, 10000]' WHERE id = 'c-1'")
            .execute(db.pool())
            .await
            .expect("set override");
        let (queue, _receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);
        record_spend(&db, "c-1", 6_000).await;

        let fired = monitor.tick("c-1").await.expect("tick");
        assert_eq!(fired, vec![bps(5_000)]);
    }

    #[tokio::test]
    async fn paused_campaigns_are_skipped() {
        let db = setup_db().await;
        sqlx::query("UPDATE campaigns SET state = 'PAUSED' WHERE id = 'c-1'")
            .execute(db.pool())
            .await
            .expect("pause");
        let (queue, mut receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);
        record_spend(&db, "c-1", 10_000).await;

        assert!(monitor.tick("c-1").await.expect("tick").is_empty());
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn invalid_budget_halts_the_campaign_and_records_failure() {
        let db = setup_db().await;
        sqlx::query("UPDATE campaigns SET budget_minor = 0 WHERE id = 'c-1'")
            .execute(db.pool())
            .await
            .expect("zero budget");
        let (queue, _receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);

        let err = monitor.tick("c-1").await.unwrap_err();
        assert!(matches!(err, TickError::InvalidBudget));
        assert!(!err.is_transient());

        assert!(db
            .campaigns()
            .list_active_for_evaluation()
            .await
            .expect("list")
            .is_empty());
        let failures = db.failure_log().list_recent(Some("c-1"), 10).await.expect("list");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "invalid_budget");
    }

    #[tokio::test]
    async fn full_queue_aborts_the_pass_without_blocking() {
        let db = setup_db().await;
        let (queue, mut receiver) = JobQueue::bounded(1);
        let monitor = monitor(&db, queue);
        record_spend(&db, "c-1", 9_500).await;

        // Two crossings against a single queue slot. The tick must bail out
        // instead of waiting for a consumer that is running the tick itself.
        let err = tokio::time::timeout(Duration::from_secs(1), monitor.tick("c-1"))
            .await
            .expect("tick must not wait on its own queue")
            .unwrap_err();
        assert!(matches!(err, TickError::QueueFull));
        assert!(err.is_transient());

        // The first crossing committed; the second resumes on the next tick.
        assert_eq!(
            db.watermarks().get("c-1").await.expect("watermark"),
            Some(bps(8_000))
        );
        assert_eq!(drain(&mut receiver).len(), 1);

        assert_eq!(monitor.tick("c-1").await.expect("tick"), vec![bps(9_000)]);
        assert_eq!(drain(&mut receiver).len(), 1);
    }

    #[tokio::test]
    async fn repeated_ticks_on_a_halted_campaign_record_one_failure() {
        let db = setup_db().await;
        sqlx::query("UPDATE campaigns SET budget_minor = 0 WHERE id = 'c-1'")
            .execute(db.pool())
            .await
            .expect("zero budget");
        let (queue, _receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);

        for _ in 0..3 {
            let err = monitor.tick("c-1").await.unwrap_err();
            assert!(matches!(err, TickError::InvalidBudget));
        }

        let failures = db.failure_log().list_recent(Some("c-1"), 10).await.expect("list");
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn negative_aggregate_spend_halts_the_campaign() {
        let db = setup_db().await;
        record_spend(&db, "c-1", -500).await;
        let (queue, _receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);

        let err = monitor.tick("c-1").await.unwrap_err();
        assert!(matches!(err, TickError::NegativeSpend));

        let failures = db.failure_log().list_recent(Some("c-1"), 10).await.expect("list");
        assert_eq!(failures[0].kind, "negative_spend");
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let db = setup_db().await;
        let (queue, _receiver) = JobQueue::bounded(16);
        let monitor = monitor(&db, queue);

        let err = monitor.tick("missing").await.unwrap_err();
        assert!(matches!(err, TickError::NotFound));
    }

    #[tokio::test]
    async fn concurrent_ticks_never_fire_a_threshold_twice() {
        let db = setup_db().await;
        let (queue, mut receiver) = JobQueue::bounded(64);
        let monitor = monitor(&db, queue);
        record_spend(&db, "c-1", 9_500).await;

        let left = monitor.clone();
        let right = monitor.clone();
        let (first, second) = tokio::join!(left.tick("c-1"), right.tick("c-1"));
        let mut fired = first.expect("tick");
        fired.extend(second.expect("tick"));

        fired.sort();
        assert_eq!(fired, vec![bps(8_000), bps(9_000)]);

        let tasks = drain(&mut receiver);
        assert_eq!(tasks.len(), 2);
    }
}
