use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use budgetwatch_core::types::{
    CampaignState, ChannelKind, DeliveryKey, DeliveryOutcome, Money, ThresholdBps,
    ThresholdSchedule,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for reading campaign budgets and lifecycle state.
    pub fn campaigns(&self) -> CampaignRepository {
        CampaignRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the append-only spend metric store.
    pub fn spend_metrics(&self) -> SpendMetricRepository {
        SpendMetricRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the per-campaign threshold watermarks.
    pub fn watermarks(&self) -> WatermarkRepository {
        WatermarkRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the recipient directory.
    pub fn recipients(&self) -> RecipientRepository {
        RecipientRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for delivery attempt bookkeeping.
    pub fn delivery_log(&self) -> DeliveryLogRepository {
        DeliveryLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the operator-visible failure log.
    pub fn failure_log(&self) -> FailureLogRepository {
        FailureLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the in-app notification inbox.
    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository used to read campaign budgets and manage the evaluation halt flag.
#[derive(Clone)]
pub struct CampaignRepository {
    pool: SqlitePool,
}

impl CampaignRepository {
    /// Loads the raw campaign row without budget classification. Used by the
    /// operator status surface, which must also show broken campaigns.
    pub async fn fetch(&self, campaign_id: &str) -> Result<CampaignRecord, CampaignError> {
        let row = sqlx::query(
            "SELECT id, org_id, name, budget_minor, currency, state, evaluation_halted, thresholds_json \
             FROM campaigns WHERE id = ?",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CampaignError::NotFound)?;

        let state_raw: String = row.get("state");
        let thresholds_json: Option<String> = row.get("thresholds_json");
        let thresholds = thresholds_json
            .as_deref()
            .map(serde_json::from_str::<ThresholdSchedule>)
            .transpose()?;

        Ok(CampaignRecord {
            id: row.get("id"),
            org_id: row.get("org_id"),
            name: row.get("name"),
            budget: Money::from_minor(row.get("budget_minor")),
            currency: row.get("currency"),
            state: CampaignState::from_str(&state_raw)
                .ok_or_else(|| CampaignError::InvalidState(state_raw))?,
            evaluation_halted: row.get::<i64, _>("evaluation_halted") != 0,
            thresholds,
        })
    }

    /// Loads the campaign for evaluation, classifying a non-positive budget
    /// as the permanent `InvalidBudget` error.
    pub async fn fetch_for_evaluation(
        &self,
        campaign_id: &str,
    ) -> Result<CampaignRecord, CampaignError> {
        let record = self.fetch(campaign_id).await?;
        if !record.budget.is_positive() {
            return Err(CampaignError::InvalidBudget {
                budget: record.budget,
            });
        }
        Ok(record)
    }

    /// Lists campaigns eligible for the periodic evaluation sweep:
    /// active and not halted by a budget problem.
    pub async fn list_active_for_evaluation(&self) -> Result<Vec<String>, CampaignError> {
        let rows = sqlx::query(
            "SELECT id FROM campaigns \
             WHERE state = 'ACTIVE' AND evaluation_halted = 0 \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    /// Excludes the campaign from automatic evaluation until an operator
    /// corrects its budget. Returns `false` when the campaign was already
    /// halted, so callers can avoid repeating the bookkeeping.
    pub async fn mark_evaluation_halted(
        &self,
        campaign_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, CampaignError> {
        self.set_evaluation_halted(campaign_id, true, updated_at)
            .await
    }

    /// Re-enables automatic evaluation after the budget has been fixed.
    pub async fn clear_evaluation_halted(
        &self,
        campaign_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, CampaignError> {
        self.set_evaluation_halted(campaign_id, false, updated_at)
            .await
    }

    async fn set_evaluation_halted(
        &self,
        campaign_id: &str,
        halted: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, CampaignError> {
        let flag = if halted { 1 } else { 0 };
        let result = sqlx::query(
            "UPDATE campaigns SET evaluation_halted = ?, updated_at = ? \
             WHERE id = ? AND evaluation_halted != ?",
        )
        .bind(flag)
        .bind(to_rfc3339(updated_at))
        .bind(campaign_id)
        .bind(flag)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the flag already had this value or the campaign is gone.
            let exists = sqlx::query("SELECT 1 FROM campaigns WHERE id = ?")
                .bind(campaign_id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(CampaignError::NotFound);
            }
            return Ok(false);
        }
        Ok(true)
    }
}

/// Campaign row as read for evaluation and status rendering.
#[derive(Debug, Clone)]
pub struct CampaignRecord {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub budget: Money,
    pub currency: String,
    pub state: CampaignState,
    pub evaluation_halted: bool,
    pub thresholds: Option<ThresholdSchedule>,
}

/// Errors that can occur while reading or updating campaigns.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("campaign not found")]
    NotFound,
    #[error("campaign budget is not positive: {budget}")]
    InvalidBudget { budget: Money },
    #[error("campaign has an unknown lifecycle state: {0}")]
    InvalidState(String),
    #[error("failed to decode thresholds json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Append-only store of recorded spend metrics per campaign.
#[derive(Clone)]
pub struct SpendMetricRepository {
    pool: SqlitePool,
}

impl SpendMetricRepository {
    /// Appends a spend metric row.
    pub async fn record(&self, metric: &NewSpendMetric) -> Result<(), SpendMetricError> {
        let result = sqlx::query(
            "INSERT INTO spend_metrics (id, campaign_id, amount_minor, occurred_at, recorded_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&metric.id)
        .bind(&metric.campaign_id)
        .bind(metric.amount.minor())
        .bind(to_rfc3339(metric.occurred_at))
        .bind(to_rfc3339(metric.recorded_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) => {
                if db_err.code().as_deref() == Some("787") {
                    return Err(SpendMetricError::UnknownCampaign);
                }
                Err(SpendMetricError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(SpendMetricError::Database(err)),
        }
    }

    /// Returns the campaign's cumulative spend.
    pub async fn aggregate(&self, campaign_id: &str) -> Result<Money, SpendMetricError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM campaigns WHERE id = ?1) AS known, \
                    COALESCE((SELECT SUM(amount_minor) FROM spend_metrics WHERE campaign_id = ?1), 0) AS total",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        let known: i64 = row.get("known");
        if known == 0 {
            return Err(SpendMetricError::UnknownCampaign);
        }
        Ok(Money::from_minor(row.get("total")))
    }
}

/// Data required to append a spend metric.
#[derive(Debug, Clone)]
pub struct NewSpendMetric {
    pub id: String,
    pub campaign_id: String,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl NewSpendMetric {
    /// Builds a metric row with an explicitly generated identifier.
    pub fn new(
        campaign_id: impl Into<String>,
        amount: Money,
        occurred_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            amount,
            occurred_at,
            recorded_at,
        }
    }
}

/// Errors raised by the spend metric store.
#[derive(Debug, Error)]
pub enum SpendMetricError {
    #[error("campaign is unknown to the metric store")]
    UnknownCampaign,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Per-campaign record of the highest threshold already notified.
///
/// The watermark is the only mutable shared state in the pipeline, so all
/// updates go through compare-and-set: the caller states the watermark it
/// read, and the update applies only if that is still the stored value.
#[derive(Clone)]
pub struct WatermarkRepository {
    pool: SqlitePool,
}

impl WatermarkRepository {
    /// Returns the campaign's watermark, or `None` before the first advance.
    pub async fn get(&self, campaign_id: &str) -> Result<Option<ThresholdBps>, WatermarkError> {
        let row = sqlx::query(
            "SELECT watermark_bps FROM threshold_watermarks WHERE campaign_id = ?",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: i64 = row.get("watermark_bps");
        let bps = u32::try_from(raw)
            .ok()
            .and_then(|value| ThresholdBps::new(value).ok())
            .ok_or(WatermarkError::Corrupt(raw))?;
        Ok(Some(bps))
    }

    /// Conditionally advances the watermark from `expected` to `new_value`.
    ///
    /// Returns `false` when the stored value no longer matches `expected`
    /// (a concurrent evaluation advanced it first) or when the update would
    /// move the watermark backwards.
    pub async fn compare_and_set(
        &self,
        campaign_id: &str,
        expected: Option<ThresholdBps>,
        new_value: ThresholdBps,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, WatermarkError> {
        let result = match expected {
            None => {
                let insert = sqlx::query(
                    "INSERT INTO threshold_watermarks (campaign_id, watermark_bps, updated_at) \
                     VALUES (?, ?, ?) \
                     ON CONFLICT (campaign_id) DO NOTHING",
                )
                .bind(campaign_id)
                .bind(i64::from(new_value.as_bps()))
                .bind(to_rfc3339(updated_at))
                .execute(&self.pool)
                .await;

                match insert {
                    Ok(result) => result,
                    Err(sqlx::Error::Database(db_err)) => {
                        if db_err.code().as_deref() == Some("787") {
                            return Err(WatermarkError::UnknownCampaign);
                        }
                        return Err(WatermarkError::Database(sqlx::Error::Database(db_err)));
                    }
                    Err(err) => return Err(WatermarkError::Database(err)),
                }
            }
            Some(old) => {
                sqlx::query(
                    "UPDATE threshold_watermarks \
                     SET watermark_bps = ?, updated_at = ? \
                     WHERE campaign_id = ? AND watermark_bps = ? AND watermark_bps < ?",
                )
                .bind(i64::from(new_value.as_bps()))
                .bind(to_rfc3339(updated_at))
                .bind(campaign_id)
                .bind(i64::from(old.as_bps()))
                .bind(i64::from(new_value.as_bps()))
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}

/// Errors raised by the watermark store.
#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("campaign is unknown to the watermark store")]
    UnknownCampaign,
    #[error("stored watermark is not a valid threshold: {0}")]
    Corrupt(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Directory of notification recipients per organization.
#[derive(Clone)]
pub struct RecipientRepository {
    pool: SqlitePool,
}

impl RecipientRepository {
    /// Lists the recipients registered for the organization.
    pub async fn list_for_org(&self, org_id: &str) -> Result<Vec<Recipient>, RecipientError> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            "SELECT id, org_id, display_name, email, webhook_url, in_app \
             FROM recipients WHERE org_id = ? ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RecipientRow::into_domain).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecipientRow {
    id: String,
    org_id: String,
    display_name: String,
    email: Option<String>,
    webhook_url: Option<String>,
    in_app: i64,
}

impl RecipientRow {
    fn into_domain(self) -> Recipient {
        Recipient {
            id: self.id,
            org_id: self.org_id,
            display_name: self.display_name,
            email: self.email,
            webhook_url: self.webhook_url,
            in_app: self.in_app != 0,
        }
    }
}

/// A notification recipient and its configured channel addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub id: String,
    pub org_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub in_app: bool,
}

/// Errors raised by the recipient directory.
#[derive(Debug, Error)]
pub enum RecipientError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Append-only record of delivery attempts, keyed by
/// `(campaign, threshold, recipient, channel)`.
#[derive(Clone)]
pub struct DeliveryLogRepository {
    pool: SqlitePool,
}

impl DeliveryLogRepository {
    /// Returns `true` when a successful delivery is already recorded for the key.
    pub async fn was_delivered(&self, key: &DeliveryKey) -> Result<bool, DeliveryLogError> {
        let row = sqlx::query(
            "SELECT EXISTS( \
                SELECT 1 FROM delivery_log \
                WHERE campaign_id = ? AND threshold_bps = ? AND recipient_id = ? AND channel = ? \
                  AND outcome = 'DELIVERED') AS delivered",
        )
        .bind(&key.campaign_id)
        .bind(i64::from(key.threshold.as_bps()))
        .bind(&key.recipient_id)
        .bind(key.channel.as_str())
        .fetch_one(&self.pool)
        .await?;

        let delivered: i64 = row.get("delivered");
        Ok(delivered != 0)
    }

    /// Appends a delivery attempt record.
    pub async fn record(&self, record: &NewDeliveryRecord<'_>) -> Result<(), DeliveryLogError> {
        sqlx::query(
            "INSERT INTO delivery_log \
             (id, campaign_id, threshold_bps, recipient_id, channel, outcome, attempts, error, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.key.campaign_id)
        .bind(i64::from(record.key.threshold.as_bps()))
        .bind(&record.key.recipient_id)
        .bind(record.key.channel.as_str())
        .bind(record.outcome.as_str())
        .bind(i64::from(record.attempts))
        .bind(&record.error)
        .bind(to_rfc3339(record.recorded_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Data required to append a delivery attempt record.
pub struct NewDeliveryRecord<'a> {
    pub id: String,
    pub key: &'a DeliveryKey,
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl<'a> NewDeliveryRecord<'a> {
    /// Builds a record with an explicitly generated identifier.
    pub fn new(
        key: &'a DeliveryKey,
        outcome: DeliveryOutcome,
        attempts: u32,
        error: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            outcome,
            attempts,
            error,
            recorded_at,
        }
    }
}

/// Errors raised by the delivery log.
#[derive(Debug, Error)]
pub enum DeliveryLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable, operator-visible log of permanent failures and exhausted retries,
/// keyed by campaign and threshold.
#[derive(Clone)]
pub struct FailureLogRepository {
    pool: SqlitePool,
}

impl FailureLogRepository {
    /// Appends a failure record.
    pub async fn record(&self, record: &NewFailureRecord) -> Result<(), FailureLogError> {
        sqlx::query(
            "INSERT INTO failure_log \
             (id, campaign_id, threshold_bps, recipient_id, channel, kind, detail, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.campaign_id)
        .bind(record.threshold.map(|value| i64::from(value.as_bps())))
        .bind(&record.recipient_id)
        .bind(record.channel.map(ChannelKind::as_str))
        .bind(&record.kind)
        .bind(&record.detail)
        .bind(to_rfc3339(record.recorded_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists recent failures, optionally restricted to one campaign.
    pub async fn list_recent(
        &self,
        campaign_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<FailureRecord>, FailureLogError> {
        let rows = match campaign_id {
            Some(campaign_id) => {
                sqlx::query_as::<_, FailureRecord>(
                    "SELECT id, campaign_id, threshold_bps, recipient_id, channel, kind, detail, recorded_at \
                     FROM failure_log WHERE campaign_id = ? \
                     ORDER BY recorded_at DESC LIMIT ?",
                )
                .bind(campaign_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, FailureRecord>(
                    "SELECT id, campaign_id, threshold_bps, recipient_id, channel, kind, detail, recorded_at \
                     FROM failure_log \
                     ORDER BY recorded_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }
}

/// Data required to append a failure record.
#[derive(Debug, Clone)]
pub struct NewFailureRecord {
    pub id: String,
    pub campaign_id: String,
    pub threshold: Option<ThresholdBps>,
    pub recipient_id: Option<String>,
    pub channel: Option<ChannelKind>,
    pub kind: String,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl NewFailureRecord {
    /// Builds a record with an explicitly generated identifier.
    pub fn new(
        campaign_id: impl Into<String>,
        threshold: Option<ThresholdBps>,
        kind: impl Into<String>,
        detail: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            threshold,
            recipient_id: None,
            channel: None,
            kind: kind.into(),
            detail: detail.into(),
            recorded_at,
        }
    }

    pub fn with_recipient(mut self, recipient_id: impl Into<String>, channel: ChannelKind) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self.channel = Some(channel);
        self
    }
}

/// Failure log row as returned to the operator surface.
#[derive(Debug, sqlx::FromRow, serde::Serialize)]
pub struct FailureRecord {
    pub id: String,
    pub campaign_id: String,
    pub threshold_bps: Option<i64>,
    pub recipient_id: Option<String>,
    pub channel: Option<String>,
    pub kind: String,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

/// Errors raised by the failure log.
#[derive(Debug, Error)]
pub enum FailureLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// In-app notification inbox written by the in-app delivery channel.
#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    /// Inserts an inbox entry for the recipient.
    pub async fn insert(&self, record: &NewInAppNotification) -> Result<(), NotificationError> {
        let result = sqlx::query(
            "INSERT INTO notifications \
             (id, recipient_id, campaign_id, threshold_bps, title, body, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.recipient_id)
        .bind(&record.campaign_id)
        .bind(i64::from(record.threshold.as_bps()))
        .bind(&record.title)
        .bind(&record.body)
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) => {
                if db_err.code().as_deref() == Some("787") {
                    return Err(NotificationError::UnknownRecipient);
                }
                Err(NotificationError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(NotificationError::Database(err)),
        }
    }

    /// Counts inbox entries for a recipient.
    pub async fn count_for_recipient(
        &self,
        recipient_id: &str,
    ) -> Result<i64, NotificationError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM notifications WHERE recipient_id = ?")
            .bind(recipient_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }
}

/// Data required to insert an in-app notification.
#[derive(Debug, Clone)]
pub struct NewInAppNotification {
    pub id: String,
    pub recipient_id: String,
    pub campaign_id: String,
    pub threshold: ThresholdBps,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl NewInAppNotification {
    /// Builds an inbox entry with an explicitly generated identifier.
    pub fn new(
        recipient_id: impl Into<String>,
        campaign_id: impl Into<String>,
        threshold: ThresholdBps,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recipient_id: recipient_id.into(),
            campaign_id: campaign_id.into(),
            threshold,
            title: title.into(),
            body: body.into(),
            created_at,
        }
    }
}

/// Errors raised by the notification inbox.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("recipient is unknown to the notification inbox")]
    UnknownRecipient,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
