use thiserror::Error;

use crate::types::{Money, ThresholdBps, ThresholdSchedule};

/// Errors raised by [`evaluate`]. Both are permanent: retrying with the same
/// inputs cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluateError {
    #[error("budget must be positive, got {0}")]
    InvalidBudget(Money),
    #[error("aggregate spend must not be negative, got {0}")]
    NegativeSpend(Money),
}

/// Returns the thresholds newly crossed by the campaign's spend ratio.
///
/// A threshold `t` is newly crossed iff `t > watermark` and
/// `spend / budget >= t`. The result is ascending and complete: when spend
/// jumps past several thresholds between evaluations, all of them are
/// returned in one pass. Pure and deterministic, so re-running with the same
/// watermark yields the same output.
pub fn evaluate(
    budget: Money,
    spend: Money,
    schedule: &ThresholdSchedule,
    watermark: Option<ThresholdBps>,
) -> Result<Vec<ThresholdBps>, EvaluateError> {
    if !budget.is_positive() {
        return Err(EvaluateError::InvalidBudget(budget));
    }
    if spend.is_negative() {
        return Err(EvaluateError::NegativeSpend(spend));
    }

    let crossed = schedule
        .iter()
        .filter(|threshold| watermark.map_or(true, |mark| *threshold > mark))
        .filter(|threshold| ratio_reaches(budget, spend, *threshold))
        .collect();

    Ok(crossed)
}

/// Exact integer comparison of `spend / budget >= threshold`.
fn ratio_reaches(budget: Money, spend: Money, threshold: ThresholdBps) -> bool {
    i128::from(spend.minor()) * 10_000 >= i128::from(budget.minor()) * i128::from(threshold.as_bps())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bps(value: u32) -> ThresholdBps {
        ThresholdBps::new(value).unwrap()
    }

    fn schedule() -> ThresholdSchedule {
        ThresholdSchedule::default()
    }

    #[test]
    fn zero_budget_is_invalid() {
        let err = evaluate(Money::ZERO, Money::from_minor(100), &schedule(), None).unwrap_err();
        assert_eq!(err, EvaluateError::InvalidBudget(Money::ZERO));

        let err = evaluate(
            Money::from_minor(-5),
            Money::from_minor(100),
            &schedule(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, EvaluateError::InvalidBudget(Money::from_minor(-5)));
    }

    #[test]
    fn negative_spend_is_invalid() {
        let err = evaluate(
            Money::from_minor(100),
            Money::from_minor(-1),
            &schedule(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, EvaluateError::NegativeSpend(Money::from_minor(-1)));
    }

    #[test]
    fn below_first_threshold_yields_nothing() {
        let crossed = evaluate(
            Money::from_minor(10_000),
            Money::from_minor(7_999),
            &schedule(),
            None,
        )
        .unwrap();
        assert!(crossed.is_empty());
    }

    #[test]
    fn multi_threshold_jump_fires_all_in_ascending_order() {
        // ratio = 0.95 with no watermark: 0.8 and 0.9 fire, 1.0 does not.
        let crossed = evaluate(
            Money::from_minor(10_000),
            Money::from_minor(9_500),
            &schedule(),
            None,
        )
        .unwrap();
        assert_eq!(crossed, vec![bps(8_000), bps(9_000)]);
    }

    #[test]
    fn watermark_excludes_already_notified_thresholds() {
        // After the watermark advanced to 0.9, a later ratio of 1.0 returns
        // only the final threshold.
        let crossed = evaluate(
            Money::from_minor(10_000),
            Money::from_minor(10_000),
            &schedule(),
            Some(bps(9_000)),
        )
        .unwrap();
        assert_eq!(crossed, vec![bps(10_000)]);
    }

    #[test]
    fn exact_boundary_counts_as_crossed() {
        let crossed = evaluate(
            Money::from_minor(10_000),
            Money::from_minor(8_000),
            &schedule(),
            None,
        )
        .unwrap();
        assert_eq!(crossed, vec![bps(8_000)]);
    }

    #[test]
    fn evaluation_is_idempotent_for_identical_inputs() {
        let first = evaluate(
            Money::from_minor(10_000),
            Money::from_minor(9_500),
            &schedule(),
            Some(bps(8_000)),
        )
        .unwrap();
        let second = evaluate(
            Money::from_minor(10_000),
            Money::from_minor(9_500),
            &schedule(),
            Some(bps(8_000)),
        )
        .unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![bps(9_000)]);
    }

    #[test]
    fn spend_past_budget_still_fires_remaining_thresholds() {
        let crossed = evaluate(
            Money::from_minor(10_000),
            Money::from_minor(25_000),
            &schedule(),
            None,
        )
        .unwrap();
        assert_eq!(crossed, vec![bps(8_000), bps(9_000), bps(10_000)]);
    }

    #[test]
    fn results_are_strictly_above_watermark_and_within_ratio() {
        // Sweep a grid of watermarks and spends against a denser schedule and
        // check the evaluator's contract directly.
        let schedule = ThresholdSchedule::parse("0.25,0.5,0.75,0.9,1.0").unwrap();
        let budget = Money::from_minor(1_000);

        for spend in [0i64, 249, 250, 700, 899, 900, 1_000, 1_500] {
            for watermark in [None, Some(bps(2_500)), Some(bps(7_500)), Some(bps(10_000))] {
                let crossed = evaluate(budget, Money::from_minor(spend), &schedule, watermark)
                    .unwrap();

                assert!(crossed.windows(2).all(|pair| pair[0] < pair[1]));
                for threshold in &crossed {
                    if let Some(mark) = watermark {
                        assert!(*threshold > mark);
                    }
                    assert!(
                        i128::from(spend) * 10_000
                            >= i128::from(budget.minor()) * i128::from(threshold.as_bps())
                    );
                }
                // Completeness: every qualifying schedule entry is present.
                for threshold in schedule.iter() {
                    let qualifies = watermark.map_or(true, |mark| threshold > mark)
                        && i128::from(spend) * 10_000
                            >= i128::from(budget.minor()) * i128::from(threshold.as_bps());
                    assert_eq!(qualifies, crossed.contains(&threshold));
                }
            }
        }
    }

    #[test]
    fn huge_amounts_do_not_overflow() {
        let crossed = evaluate(
            Money::from_minor(i64::MAX),
            Money::from_minor(i64::MAX),
            &schedule(),
            None,
        )
        .unwrap();
        assert_eq!(crossed.len(), 3);
    }
}
