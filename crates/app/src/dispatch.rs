use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{error, info, warn};

use budgetwatch_channel::{ChannelError, EmailChannel, WebhookChannel};
use budgetwatch_core::retry::RetryPolicy;
use budgetwatch_core::types::{
    ChannelKind, DeliveryKey, DeliveryOutcome, DispatchReceipt, FailedDelivery,
    NotificationMessage, ThresholdCrossingEvent,
};
use budgetwatch_storage::{
    Database, DeliveryLogError, NewDeliveryRecord, NewFailureRecord, NewInAppNotification,
    NotificationError, Recipient, RecipientError,
};

use crate::queue::with_jitter;

/// The outbound channels the dispatcher can deliver through. Email is
/// optional; without a configured gateway, email targets fail permanently.
#[derive(Clone)]
pub struct ChannelSet {
    pub webhook: WebhookChannel,
    pub email: Option<EmailChannel>,
}

/// Fans one crossing event out to every configured recipient target.
///
/// Delivery is at-least-once: a `(campaign, threshold, recipient, channel)`
/// key with a recorded successful delivery is skipped, and each target is
/// retried independently so one broken endpoint cannot starve the rest.
#[derive(Clone)]
pub struct NotificationDispatcher {
    database: Database,
    channels: ChannelSet,
    retry: RetryPolicy,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

enum Target<'a> {
    Email(&'a str),
    Webhook(&'a str),
    InApp,
}

impl Target<'_> {
    fn channel(&self) -> ChannelKind {
        match self {
            Self::Email(_) => ChannelKind::Email,
            Self::Webhook(_) => ChannelKind::Webhook,
            Self::InApp => ChannelKind::InApp,
        }
    }
}

fn targets(recipient: &Recipient) -> Vec<Target<'_>> {
    let mut targets = Vec::new();
    if let Some(address) = recipient.email.as_deref() {
        targets.push(Target::Email(address));
    }
    if let Some(url) = recipient.webhook_url.as_deref() {
        targets.push(Target::Webhook(url));
    }
    if recipient.in_app {
        targets.push(Target::InApp);
    }
    targets
}

impl NotificationDispatcher {
    pub fn new(database: Database, channels: ChannelSet, retry: RetryPolicy) -> Self {
        Self {
            database,
            channels,
            retry,
            clock: Arc::new(Utc::now),
        }
    }

    /// Delivers the event to all recipients of the campaign's organization.
    pub async fn dispatch(
        &self,
        event: &ThresholdCrossingEvent,
    ) -> Result<DispatchReceipt, DispatchError> {
        let start = Instant::now();
        let recipients = self
            .database
            .recipients()
            .list_for_org(&event.org_id)
            .await?;
        let message = event.message();

        let mut receipt = DispatchReceipt::default();
        for recipient in &recipients {
            for target in targets(recipient) {
                let key = DeliveryKey {
                    campaign_id: event.campaign_id.clone(),
                    threshold: event.threshold,
                    recipient_id: recipient.id.clone(),
                    channel: target.channel(),
                };

                if self.database.delivery_log().was_delivered(&key).await? {
                    counter!("dispatch_duplicates_suppressed_total").increment(1);
                    receipt.suppressed += 1;
                    continue;
                }

                self.deliver(&key, &target, &message, &mut receipt).await;
            }
        }

        histogram!("dispatch_latency_seconds").record(start.elapsed().as_secs_f64());
        info!(
            stage = "dispatch",
            campaign_id = %event.campaign_id,
            threshold = %event.threshold,
            recipients = recipients.len(),
            delivered = receipt.delivered.len(),
            failed = receipt.failed.len(),
            suppressed = receipt.suppressed,
            "crossing event dispatched"
        );
        Ok(receipt)
    }

    /// Attempts one target until success, a permanent failure, or retry
    /// exhaustion, then records the outcome.
    async fn deliver(
        &self,
        key: &DeliveryKey,
        target: &Target<'_>,
        message: &NotificationMessage,
        receipt: &mut DispatchReceipt,
    ) {
        let channel = key.channel.as_str();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.send_once(key, target, message).await {
                Ok(()) => {
                    self.record_delivery(key, DeliveryOutcome::Delivered, attempts, None)
                        .await;
                    counter!("notification_dispatch_total", "channel" => channel, "outcome" => "delivered")
                        .increment(1);
                    receipt.delivered.push(key.clone());
                    return;
                }
                Err(err) if err.is_transient() && !self.retry.is_exhausted(attempts) => {
                    counter!("notification_retry_total", "channel" => channel).increment(1);
                    warn!(
                        stage = "dispatch",
                        campaign_id = %key.campaign_id,
                        recipient_id = %key.recipient_id,
                        channel,
                        attempt = attempts,
                        error = %err,
                        "delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(with_jitter(self.retry.delay_for(attempts))).await;
                }
                Err(err) => {
                    let kind = if err.is_transient() {
                        "retries_exhausted"
                    } else {
                        "delivery_permanent"
                    };
                    self.record_delivery(
                        key,
                        DeliveryOutcome::Failed,
                        attempts,
                        Some(err.to_string()),
                    )
                    .await;
                    self.record_failure(key, kind, err.to_string()).await;
                    counter!("notification_dispatch_total", "channel" => channel, "outcome" => "failed")
                        .increment(1);
                    receipt.failed.push(FailedDelivery {
                        key: key.clone(),
                        error: err.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn send_once(
        &self,
        key: &DeliveryKey,
        target: &Target<'_>,
        message: &NotificationMessage,
    ) -> Result<(), ChannelError> {
        match target {
            Target::Email(address) => match &self.channels.email {
                Some(email) => email.send(address, message).await,
                None => Err(ChannelError::Permanent(
                    "email delivery is not configured".to_string(),
                )),
            },
            Target::Webhook(url) => self.channels.webhook.send(url, message).await,
            Target::InApp => {
                let entry = NewInAppNotification::new(
                    key.recipient_id.clone(),
                    key.campaign_id.clone(),
                    key.threshold,
                    message.title.clone(),
                    message.body.clone(),
                    (self.clock)(),
                );
                self.database
                    .notifications()
                    .insert(&entry)
                    .await
                    .map_err(|err| match err {
                        NotificationError::UnknownRecipient => {
                            ChannelError::Permanent(err.to_string())
                        }
                        NotificationError::Database(err) => {
                            ChannelError::Transient(err.to_string())
                        }
                    })
            }
        }
    }

    /// Bookkeeping failures are logged but never abort the dispatch; the
    /// delivery itself already happened or failed.
    async fn record_delivery(
        &self,
        key: &DeliveryKey,
        outcome: DeliveryOutcome,
        attempts: u32,
        error_detail: Option<String>,
    ) {
        let record =
            NewDeliveryRecord::new(key, outcome, attempts, error_detail, (self.clock)());
        if let Err(err) = self.database.delivery_log().record(&record).await {
            error!(
                stage = "dispatch",
                campaign_id = %key.campaign_id,
                recipient_id = %key.recipient_id,
                error = %err,
                "failed to record delivery attempt"
            );
        }
    }

    async fn record_failure(&self, key: &DeliveryKey, kind: &'static str, detail: String) {
        let record = NewFailureRecord::new(
            key.campaign_id.clone(),
            Some(key.threshold),
            kind,
            detail,
            (self.clock)(),
        )
        .with_recipient(key.recipient_id.clone(), key.channel);
        if let Err(err) = self.database.failure_log().record(&record).await {
            error!(
                stage = "dispatch",
                campaign_id = %key.campaign_id,
                error = %err,
                "failed to record delivery failure"
            );
        } else {
            counter!("failure_log_records_total", "kind" => kind).increment(1);
        }
    }
}

/// Storage errors that prevent a dispatch from running at all. Both are
/// retry-safe at the queue level.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load recipients: {0}")]
    Recipients(#[from] RecipientError),
    #[error("failed to read the delivery log: {0}")]
    DeliveryLog(#[from] DeliveryLogError),
}
