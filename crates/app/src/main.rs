mod dispatch;
mod monitor;
mod problem;
mod queue;
mod router;
mod sweeper;
mod telemetry;

use std::time::Duration;

use tracing::info;
use url::Url;

use budgetwatch_channel::{EmailChannel, WebhookChannel};
use budgetwatch_storage::Database;
use budgetwatch_util::{load_env_file, AppConfig};

use crate::dispatch::{ChannelSet, NotificationDispatcher};
use crate::monitor::BudgetMonitor;
use crate::queue::{JobQueue, JobRunner};
use crate::sweeper::EvaluationSweeper;

const QUEUE_CAPACITY: usize = 1024;
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = reqwest::Client::builder()
        .timeout(HTTP_CLIENT_TIMEOUT)
        .build()?;
    let webhook = WebhookChannel::new(http.clone(), config.webhook_signing_secret.clone());
    let email = match &config.mail_gateway {
        Some(gateway) => Some(EmailChannel::new(
            http,
            Url::parse(&gateway.url)?,
            gateway.token.clone(),
        )),
        None => None,
    };
    let channels = ChannelSet { webhook, email };

    let (job_queue, job_receiver) = JobQueue::bounded(QUEUE_CAPACITY);
    let monitor = BudgetMonitor::new(
        database.clone(),
        job_queue.clone(),
        config.thresholds.clone(),
        config.lock_lease,
    );
    let dispatcher = NotificationDispatcher::new(database.clone(), channels, config.dispatch_retry);

    JobRunner::new(
        job_queue.clone(),
        job_receiver,
        monitor.clone(),
        dispatcher,
        database.clone(),
        config.dispatch_retry,
    )
    .spawn();
    EvaluationSweeper::new(database.clone(), job_queue.clone(), config.sweep_interval).spawn();

    let state = router::AppState::new(
        metrics,
        database,
        job_queue,
        monitor,
        config.thresholds.clone(),
    );

    let addr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
