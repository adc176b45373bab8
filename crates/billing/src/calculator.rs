//! Billing calculator
//!
//! Pure pricing arithmetic, separated from the ledger so it can be tested
//! without a database and reused for both the `next_billing_amount` preview
//! and the actual threshold charge. All monetary values are `i64` in the
//! smallest currency unit; nothing here rounds.

use crate::plans::SubscriptionPlan;

/// Amount owed for `student_count` students under `plan`, per year.
///
/// Free plans always cost zero regardless of enrollment. Uses saturating
/// multiplication so a pathological plan price cannot wrap into a negative
/// charge.
pub fn amount_due(student_count: i32, plan: &SubscriptionPlan) -> i64 {
    if plan.is_free || student_count <= 0 {
        return 0;
    }
    (student_count as i64).saturating_mul(plan.price_per_student_per_year)
}

/// Outcome of evaluating a student-count change against the plan threshold.
///
/// The ledger computes this pure decision first, then persists it inside a
/// single row-locked transaction; splitting the two keeps the billing rule
/// testable without I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountUpdate {
    pub new_student_count: i32,
    pub pending_increase: i32,
    pub next_billing_amount: i64,
    /// Set when the pending increase reached the plan threshold; carries the
    /// charge to append to `current_billing_amount`.
    pub threshold_charge: Option<i64>,
}

/// Evaluate a count change. `count_at_billing` is the count as of the last
/// charge; the pending increase never goes negative when enrollment shrinks.
pub fn evaluate_count_update(
    count_at_billing: i32,
    new_count: i32,
    plan: &SubscriptionPlan,
) -> CountUpdate {
    let pending = (new_count - count_at_billing).max(0);
    let next_billing_amount = amount_due(new_count, plan);

    let threshold_met =
        plan.billing_threshold > 0 && !plan.is_free && pending >= plan.billing_threshold;

    if threshold_met {
        CountUpdate {
            new_student_count: new_count,
            pending_increase: 0,
            next_billing_amount,
            threshold_charge: Some(amount_due(new_count, plan)),
        }
    } else {
        CountUpdate {
            new_student_count: new_count,
            pending_increase: pending,
            next_billing_amount,
            threshold_charge: None,
        }
    }
}
