//! Billing invariants
//!
//! Runnable consistency checks over the billing tables. The worker runs the
//! full set nightly, and any of them can be run after a webhook replay or a
//! manual data fix to confirm the system is in a valid state.
//!
//! Checks only read, never write, and every violation carries enough
//! context to debug the affected rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// One row (or row group) found in violation of an invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Name of the violated invariant, matching `available_checks`.
    pub invariant: String,
    /// Tenant(s) the violating rows belong to.
    pub tenant_ids: Vec<Uuid>,
    /// Operator-facing summary of what is wrong.
    pub description: String,
    /// Raw row values for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is (or could be) wrong.
    Critical,
    /// Data inconsistency that needs a fix but is not charging anyone.
    High,
    /// Worth investigating; a sweep may resolve it on its own.
    Medium,
    /// Informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Outcome of a full check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    tenant_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingMismatchRow {
    tenant_id: Uuid,
    subscription_id: i64,
    current_student_count: i32,
    student_count_at_billing: i32,
    pending_student_increase: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutTimestampRow {
    tenant_id: Uuid,
    transaction_id: i64,
    external_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingRow {
    tenant_id: Uuid,
    transaction_id: i64,
    expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct TenantMismatchRow {
    transaction_id: i64,
    txn_tenant_id: Uuid,
    sub_tenant_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UnappliedSettlementRow {
    tenant_id: Uuid,
    transaction_id: i64,
    paid_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeChargeRow {
    tenant_id: Uuid,
    history_id: i64,
    billing_amount: i64,
}

/// Read-only consistency checker over the billing tables.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and collect the violations into one summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_pending_increase_consistency().await?);
        violations.extend(self.check_paid_transactions_have_timestamp().await?);
        violations.extend(self.check_no_stale_pending_transactions().await?);
        violations.extend(self.check_transaction_tenant_matches_subscription().await?);
        violations.extend(self.check_paid_transactions_reflected().await?);
        violations.extend(self.check_no_negative_charges().await?);

        let checks_run = 7;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most one active subscription per tenant
    ///
    /// Multiple active subscriptions would double-bill the tenant. The
    /// partial unique index should make this impossible; the check catches
    /// damage from manual fixes run without it.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) as sub_count
            FROM tenant_subscriptions
            WHERE status = 'active'
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} active subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: pending_student_increase = max(0, current - at_billing)
    async fn check_pending_increase_consistency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PendingMismatchRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, id as subscription_id,
                   current_student_count, student_count_at_billing,
                   pending_student_increase
            FROM tenant_subscriptions
            WHERE status != 'cancelled'
              AND pending_student_increase !=
                  GREATEST(0, current_student_count - student_count_at_billing)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_increase_consistency".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Subscription {} has pending increase {} but counts imply {}",
                    row.subscription_id,
                    row.pending_student_increase,
                    (row.current_student_count - row.student_count_at_billing).max(0)
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "current_student_count": row.current_student_count,
                    "student_count_at_billing": row.student_count_at_billing,
                    "pending_student_increase": row.pending_student_increase,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: PAID transactions carry a paid_at timestamp
    async fn check_paid_transactions_have_timestamp(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutTimestampRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, id as transaction_id, external_id
            FROM payment_transactions
            WHERE status = 'paid' AND paid_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_transactions_have_timestamp".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Transaction {} is paid but has no paid_at",
                    row.transaction_id
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "external_id": row.external_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: No transaction stays PENDING long past its expiry
    ///
    /// The worker sweep and lazy polls should have lapsed it; a day of
    /// slack avoids flagging rows the next sweep will handle anyway.
    async fn check_no_stale_pending_transactions(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, id as transaction_id, expires_at
            FROM payment_transactions
            WHERE status = 'pending'
              AND expires_at < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_transactions".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Transaction {} still pending a day past expiry",
                    row.transaction_id
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "expires_at": row.expires_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Transaction tenant matches the owning subscription
    async fn check_transaction_tenant_matches_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TenantMismatchRow> = sqlx::query_as(
            r#"
            SELECT t.id as transaction_id,
                   t.tenant_id as txn_tenant_id,
                   s.tenant_id as sub_tenant_id
            FROM payment_transactions t
            JOIN tenant_subscriptions s ON s.id = t.tenant_subscription_id
            WHERE t.tenant_id != s.tenant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "transaction_tenant_matches_subscription".to_string(),
                tenant_ids: vec![row.txn_tenant_id, row.sub_tenant_id],
                description: format!(
                    "Transaction {} is scoped to a different tenant than its subscription",
                    row.transaction_id
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "transaction_tenant_id": row.txn_tenant_id,
                    "subscription_tenant_id": row.sub_tenant_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: A PAID transaction in the current period is reflected on
    /// its subscription
    ///
    /// Reconciliation settles the subscription in the same database
    /// transaction as the PAID update, so a mismatch means rows were edited
    /// outside the orchestrator. Charges issued after the payment (a later
    /// threshold charge reopens the amount owed) are excluded via
    /// `last_billing_date`; payments against earlier periods via
    /// `start_date`.
    async fn check_paid_transactions_reflected(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnappliedSettlementRow> = sqlx::query_as(
            r#"
            SELECT t.tenant_id, t.id as transaction_id, t.paid_at
            FROM payment_transactions t
            JOIN tenant_subscriptions s ON s.id = t.tenant_subscription_id
            WHERE t.status = 'paid'
              AND s.is_paid = FALSE
              AND t.paid_at >= s.start_date
              AND (s.last_billing_date IS NULL OR s.last_billing_date < t.paid_at)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_transactions_reflected_on_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Transaction {} is paid but the subscription never recorded the settlement",
                    row.transaction_id
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "paid_at": row.paid_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 7: Billing history never records a negative charge
    async fn check_no_negative_charges(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeChargeRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, id as history_id, billing_amount
            FROM billing_history
            WHERE billing_amount < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_negative_charges".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "History entry {} records a negative charge of {}",
                    row.history_id, row.billing_amount
                ),
                context: serde_json::json!({
                    "history_id": row.history_id,
                    "billing_amount": row.billing_amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run one check by name; unknown names report no violations.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "pending_increase_consistency" => self.check_pending_increase_consistency().await,
            "paid_transactions_have_timestamp" => {
                self.check_paid_transactions_have_timestamp().await
            }
            "no_stale_pending_transactions" => self.check_no_stale_pending_transactions().await,
            "transaction_tenant_matches_subscription" => {
                self.check_transaction_tenant_matches_subscription().await
            }
            "paid_transactions_reflected_on_subscription" => {
                self.check_paid_transactions_reflected().await
            }
            "no_negative_charges" => self.check_no_negative_charges().await,
            _ => Ok(vec![]),
        }
    }

    /// Names accepted by `run_check`.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "pending_increase_consistency",
            "paid_transactions_have_timestamp",
            "no_stale_pending_transactions",
            "transaction_tenant_matches_subscription",
            "paid_transactions_reflected_on_subscription",
            "no_negative_charges",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"pending_increase_consistency"));
        assert!(checks.contains(&"paid_transactions_reflected_on_subscription"));
    }
}
