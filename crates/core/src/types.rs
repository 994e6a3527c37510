use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monetary amount expressed in minor currency units (cents, etc.).
///
/// Budgets and spend are carried as integers end to end; ratios are computed
/// in basis points so no float ever sits on a decision path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(value: i64) -> Self {
        Self(value)
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Saturating sum, used when folding metric rows.
    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A threshold fraction stored as basis points (1..=10_000, i.e. (0, 1]).
///
/// `8_000` is the 0.80 threshold. Crossing checks compare
/// `spend * 10_000 >= budget * bps` in 128-bit integers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct ThresholdBps(u32);

impl ThresholdBps {
    pub const FULL_BUDGET: ThresholdBps = ThresholdBps(10_000);

    pub fn new(bps: u32) -> Result<Self, ThresholdError> {
        if bps == 0 || bps > 10_000 {
            return Err(ThresholdError::OutOfRange(bps));
        }
        Ok(Self(bps))
    }

    /// Parses a decimal fraction such as `0.8` or `1.0`.
    pub fn from_fraction_str(value: &str) -> Result<Self, ThresholdError> {
        let fraction: f64 = value
            .trim()
            .parse()
            .map_err(|_| ThresholdError::InvalidFraction(value.to_string()))?;
        if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
            return Err(ThresholdError::InvalidFraction(value.to_string()));
        }
        Self::new((fraction * 10_000.0).round() as u32)
    }

    pub fn as_bps(self) -> u32 {
        self.0
    }

    pub fn as_fraction(self) -> f64 {
        f64::from(self.0) / 10_000.0
    }
}

impl TryFrom<u32> for ThresholdBps {
    type Error = ThresholdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ThresholdBps> for u32 {
    fn from(value: ThresholdBps) -> Self {
        value.0
    }
}

impl fmt::Display for ThresholdBps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 100 == 0 {
            write!(f, "{}%", self.0 / 100)
        } else {
            write!(f, "{:.2}%", f64::from(self.0) / 100.0)
        }
    }
}

/// Errors raised while building threshold values or schedules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdError {
    #[error("threshold must be within (0, 10000] basis points, got {0}")]
    OutOfRange(u32),
    #[error("threshold fraction must be a decimal in (0, 1], got {0:?}")]
    InvalidFraction(String),
    #[error("thresholds must be strictly ascending")]
    NotAscending,
    #[error("threshold schedule must not be empty")]
    Empty,
}

/// Validated, strictly ascending sequence of threshold fractions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ThresholdBps>", into = "Vec<ThresholdBps>")]
pub struct ThresholdSchedule(Vec<ThresholdBps>);

impl ThresholdSchedule {
    pub fn new(thresholds: Vec<ThresholdBps>) -> Result<Self, ThresholdError> {
        if thresholds.is_empty() {
            return Err(ThresholdError::Empty);
        }
        if !thresholds.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(ThresholdError::NotAscending);
        }
        Ok(Self(thresholds))
    }

    /// Parses a comma separated list of fractions, e.g. `0.8,0.9,1.0`.
    pub fn parse(value: &str) -> Result<Self, ThresholdError> {
        let thresholds = value
            .split(',')
            .filter(|item| !item.trim().is_empty())
            .map(ThresholdBps::from_fraction_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(thresholds)
    }

    pub fn iter(&self) -> impl Iterator<Item = ThresholdBps> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[ThresholdBps] {
        &self.0
    }
}

impl Default for ThresholdSchedule {
    /// The 80% / 90% / 100% ladder used when no override is configured.
    fn default() -> Self {
        Self(vec![
            ThresholdBps(8_000),
            ThresholdBps(9_000),
            ThresholdBps(10_000),
        ])
    }
}

impl TryFrom<Vec<ThresholdBps>> for ThresholdSchedule {
    type Error = ThresholdError;

    fn try_from(value: Vec<ThresholdBps>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ThresholdSchedule> for Vec<ThresholdBps> {
    fn from(value: ThresholdSchedule) -> Self {
        value.0
    }
}

/// Campaign lifecycle state persisted in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignState {
    Active,
    Paused,
    Completed,
}

impl CampaignState {
    /// Returns the canonical database representation for the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelKind {
    Email,
    Webhook,
    InApp,
}

impl ChannelKind {
    /// Returns the canonical database representation for the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Webhook => "WEBHOOK",
            Self::InApp => "IN_APP",
        }
    }
}

/// Outcome of a recorded delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }
}

/// Immutable record of a threshold being crossed by a campaign's spend.
///
/// Rides the job queue between the monitor and the dispatcher, so it is
/// serializable. Construction guarantees a positive budget, which keeps
/// `percent_used` well defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCrossingEvent {
    pub campaign_id: String,
    pub org_id: String,
    pub threshold: ThresholdBps,
    pub spend: Money,
    pub budget: Money,
    pub occurred_at: DateTime<Utc>,
}

impl ThresholdCrossingEvent {
    pub fn new(
        campaign_id: impl Into<String>,
        org_id: impl Into<String>,
        threshold: ThresholdBps,
        spend: Money,
        budget: Money,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, ThresholdCrossingError> {
        if !budget.is_positive() {
            return Err(ThresholdCrossingError::NonPositiveBudget(budget));
        }
        Ok(Self {
            campaign_id: campaign_id.into(),
            org_id: org_id.into(),
            threshold,
            spend,
            budget,
            occurred_at,
        })
    }

    /// Spend as a percentage of budget. The constructor rejects budgets
    /// that would make this divide by zero.
    pub fn percent_used(&self) -> f64 {
        self.spend.minor() as f64 * 100.0 / self.budget.minor() as f64
    }

    /// Builds the channel-agnostic payload delivered to recipients.
    pub fn message(&self) -> NotificationMessage {
        NotificationMessage {
            campaign_id: self.campaign_id.clone(),
            threshold: self.threshold,
            title: format!("Campaign budget at {}", self.threshold),
            body: format!(
                "Campaign {} has used {:.1}% of its budget ({} of {} minor units spent).",
                self.campaign_id,
                self.percent_used(),
                self.spend,
                self.budget,
            ),
            percent_used: self.percent_used(),
            spend_minor: self.spend.minor(),
            budget_minor: self.budget.minor(),
            occurred_at: self.occurred_at,
        }
    }
}

/// Error raised when constructing a crossing event with a non-positive budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdCrossingError {
    #[error("crossing event requires a positive budget, got {0}")]
    NonPositiveBudget(Money),
}

/// Channel-agnostic notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub campaign_id: String,
    pub threshold: ThresholdBps,
    pub title: String,
    pub body: String,
    pub percent_used: f64,
    pub spend_minor: i64,
    pub budget_minor: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Identity of a single delivery attempt target.
///
/// The dedupe key for at-least-once delivery: a prior successful delivery
/// for the same key suppresses redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub campaign_id: String,
    pub threshold: ThresholdBps,
    pub recipient_id: String,
    pub channel: ChannelKind,
}

/// A delivery that failed permanently or exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedDelivery {
    pub key: DeliveryKey,
    pub error: String,
}

/// Result of fanning one crossing event out to a recipient set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReceipt {
    pub delivered: Vec<DeliveryKey>,
    pub failed: Vec<FailedDelivery>,
    pub suppressed: u32,
}

impl DispatchReceipt {
    /// Returns `true` when no target failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_rejects_zero_and_above_full_budget() {
        assert_eq!(ThresholdBps::new(0), Err(ThresholdError::OutOfRange(0)));
        assert_eq!(
            ThresholdBps::new(10_001),
            Err(ThresholdError::OutOfRange(10_001))
        );
        assert!(ThresholdBps::new(10_000).is_ok());
    }

    #[test]
    fn threshold_parses_fractions() {
        assert_eq!(
            ThresholdBps::from_fraction_str("0.8").unwrap().as_bps(),
            8_000
        );
        assert_eq!(
            ThresholdBps::from_fraction_str("1.0").unwrap(),
            ThresholdBps::FULL_BUDGET
        );
        assert!(ThresholdBps::from_fraction_str("1.5").is_err());
        assert!(ThresholdBps::from_fraction_str("0").is_err());
        assert!(ThresholdBps::from_fraction_str("nope").is_err());
    }

    #[test]
    fn schedule_requires_strictly_ascending_entries() {
        let ascending = ThresholdSchedule::parse("0.8,0.9,1.0").unwrap();
        assert_eq!(ascending.as_slice().len(), 3);

        assert_eq!(
            ThresholdSchedule::parse("0.9,0.8"),
            Err(ThresholdError::NotAscending)
        );
        assert_eq!(
            ThresholdSchedule::parse("0.8,0.8"),
            Err(ThresholdError::NotAscending)
        );
        assert_eq!(ThresholdSchedule::parse(""), Err(ThresholdError::Empty));
    }

    #[test]
    fn schedule_deserialization_validates() {
        let ok: Result<ThresholdSchedule, _> = serde_json::from_str("[8000, 9000, 10000]");
        assert!(ok.is_ok());

        let unordered: Result<ThresholdSchedule, _> = serde_json::from_str("[9000, 8000]");
        assert!(unordered.is_err());

        let out_of_range: Result<ThresholdSchedule, _> = serde_json::from_str("[0]");
        assert!(out_of_range.is_err());
    }

    #[test]
    fn crossing_event_rejects_non_positive_budget() {
        let err = ThresholdCrossingEvent::new(
            "c-1",
            "org-1",
            ThresholdBps::new(8_000).unwrap(),
            Money::from_minor(10),
            Money::ZERO,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ThresholdCrossingError::NonPositiveBudget(Money::ZERO)
        );
    }

    #[test]
    fn crossing_event_percentage_and_message() {
        let event = ThresholdCrossingEvent::new(
            "c-1",
            "org-1",
            ThresholdBps::new(8_000).unwrap(),
            Money::from_minor(9_500),
            Money::from_minor(10_000),
            Utc::now(),
        )
        .unwrap();

        assert!((event.percent_used() - 95.0).abs() < f64::EPSILON);
        let message = event.message();
        assert_eq!(message.title, "Campaign budget at 80%");
        assert!(message.body.contains("95.0%"));
        assert_eq!(message.spend_minor, 9_500);
    }

    #[test]
    fn threshold_display_formats_percent() {
        assert_eq!(ThresholdBps::new(8_000).unwrap().to_string(), "80%");
        assert_eq!(ThresholdBps::new(8_550).unwrap().to_string(), "85.50%");
    }

    #[test]
    fn crossing_event_round_trips_through_json() {
        let event = ThresholdCrossingEvent::new(
            "c-1",
            "org-1",
            ThresholdBps::new(9_000).unwrap(),
            Money::from_minor(450),
            Money::from_minor(500),
            Utc::now(),
        )
        .unwrap();

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ThresholdCrossingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
