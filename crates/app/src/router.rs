use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::warn;

use budgetwatch_core::types::{ThresholdBps, ThresholdSchedule};
use budgetwatch_storage::{CampaignError, Database, NewSpendMetric, SpendMetricError};

use crate::monitor::{BudgetMonitor, TickError};
use crate::problem::ProblemResponse;
use crate::queue::{JobQueue, Task};
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    queue: JobQueue,
    monitor: BudgetMonitor,
    defaults: ThresholdSchedule,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        queue: JobQueue,
        monitor: BudgetMonitor,
        defaults: ThresholdSchedule,
    ) -> Self {
        Self {
            metrics,
            storage,
            queue,
            monitor,
            defaults,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/campaigns/:id/spend", post(record_spend))
        .route("/campaigns/:id/evaluate", post(evaluate_campaign))
        .route("/campaigns/:id/status", get(campaign_status))
        .route("/admin/campaigns/:id/resume", post(resume_campaign))
        .route("/admin/failures", get(list_failures))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct SpendRequest {
    amount_minor: i64,
    #[serde(default)]
    occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct SpendResponse {
    campaign_id: String,
    amount_minor: i64,
}

/// Records a spend metric and schedules an evaluation of the campaign.
///
/// Negative amounts are accepted as corrections; zero is rejected.
async fn record_spend(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    Json(request): Json<SpendRequest>,
) -> Result<(StatusCode, Json<SpendResponse>), ProblemResponse> {
    if request.amount_minor == 0 {
        return Err(ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_amount",
            "amount_minor must not be zero",
        ));
    }

    let now = state.now();
    let metric = NewSpendMetric::new(
        campaign_id.clone(),
        budgetwatch_core::types::Money::from_minor(request.amount_minor),
        request.occurred_at.unwrap_or(now),
        now,
    );

    state
        .storage()
        .spend_metrics()
        .record(&metric)
        .await
        .map_err(|err| match err {
            SpendMetricError::UnknownCampaign => ProblemResponse::campaign_not_found(),
            SpendMetricError::Database(err) => ProblemResponse::internal(err.to_string()),
        })?;
    counter!("spend_ingest_total").increment(1);

    // The metric is durable either way; a failed enqueue only delays the
    // evaluation until the next sweep.
    if let Err(err) = state.queue.try_enqueue(Task::Evaluate {
        campaign_id: campaign_id.clone(),
    }) {
        warn!(stage = "api", campaign_id, error = %err, "evaluation deferred to the sweep");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SpendResponse {
            campaign_id,
            amount_minor: request.amount_minor,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct EvaluateResponse {
    campaign_id: String,
    crossed: Vec<u32>,
}

/// Runs one evaluation cycle synchronously and reports the thresholds fired.
async fn evaluate_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<EvaluateResponse>, ProblemResponse> {
    let crossed = state
        .monitor
        .tick(&campaign_id)
        .await
        .map_err(|err| match err {
            TickError::NotFound => ProblemResponse::campaign_not_found(),
            TickError::LeaseTimeout => ProblemResponse::new(
                StatusCode::CONFLICT,
                "evaluation_in_progress",
                "another evaluation of this campaign is still running",
            ),
            TickError::InvalidBudget => ProblemResponse::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_budget",
                "campaign budget is not positive; evaluation has been halted",
            ),
            TickError::NegativeSpend => ProblemResponse::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "negative_spend",
                "aggregate spend is negative; evaluation has been halted",
            ),
            TickError::CorruptCampaign(detail) => {
                ProblemResponse::new(StatusCode::UNPROCESSABLE_ENTITY, "corrupt_campaign", detail)
            }
            TickError::QueueFull => ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_saturated",
                "the dispatch queue is full; evaluation will resume on the next sweep",
            ),
            TickError::QueueClosed => ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_unavailable",
                "the dispatch queue is shutting down",
            ),
            TickError::Storage(detail) => ProblemResponse::internal(detail),
        })?;

    Ok(Json(EvaluateResponse {
        campaign_id,
        crossed: crossed.into_iter().map(ThresholdBps::as_bps).collect(),
    }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    campaign_id: String,
    name: String,
    state: &'static str,
    budget_minor: i64,
    spend_minor: i64,
    percent_used: Option<f64>,
    watermark_bps: Option<u32>,
    evaluation_halted: bool,
    thresholds: Vec<u32>,
}

/// Reports budget, spend, and watermark for one campaign, including
/// campaigns whose evaluation is halted.
async fn campaign_status(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<StatusResponse>, ProblemResponse> {
    let campaign = state
        .storage()
        .campaigns()
        .fetch(&campaign_id)
        .await
        .map_err(|err| match err {
            CampaignError::NotFound => ProblemResponse::campaign_not_found(),
            other => ProblemResponse::internal(other.to_string()),
        })?;

    let spend = state
        .storage()
        .spend_metrics()
        .aggregate(&campaign_id)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let watermark = state
        .storage()
        .watermarks()
        .get(&campaign_id)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let percent_used = if campaign.budget.is_positive() {
        Some(spend.minor() as f64 * 100.0 / campaign.budget.minor() as f64)
    } else {
        None
    };
    let thresholds = campaign
        .thresholds
        .as_ref()
        .unwrap_or(&state.defaults)
        .iter()
        .map(ThresholdBps::as_bps)
        .collect();

    Ok(Json(StatusResponse {
        campaign_id: campaign.id,
        name: campaign.name,
        state: campaign.state.as_str(),
        budget_minor: campaign.budget.minor(),
        spend_minor: spend.minor(),
        percent_used,
        watermark_bps: watermark.map(ThresholdBps::as_bps),
        evaluation_halted: campaign.evaluation_halted,
        thresholds,
    }))
}

/// Re-enables evaluation for a campaign after an operator fixed its data.
async fn resume_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    state
        .storage()
        .campaigns()
        .clear_evaluation_halted(&campaign_id, state.now())
        .await
        .map_err(|err| match err {
            CampaignError::NotFound => ProblemResponse::campaign_not_found(),
            other => ProblemResponse::internal(other.to_string()),
        })?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct FailuresQuery {
    #[serde(default)]
    campaign_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

const FAILURES_DEFAULT_LIMIT: i64 = 50;
const FAILURES_MAX_LIMIT: i64 = 500;

/// Lists recent failure log entries, newest first.
async fn list_failures(
    State(state): State<AppState>,
    Query(query): Query<FailuresQuery>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let limit = query
        .limit
        .unwrap_or(FAILURES_DEFAULT_LIMIT)
        .clamp(1, FAILURES_MAX_LIMIT);

    let failures = state
        .storage()
        .failure_log()
        .list_recent(query.campaign_id.as_deref(), limit)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    Ok(Json(failures))
}
