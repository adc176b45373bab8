//! Maintenance sweeps
//!
//! Periodic housekeeping invoked by the worker binary: trial conversion,
//! expiry warnings, and expiry handling. Each sweep is independent and
//! idempotent; running one twice in the same day must not double-notify or
//! double-transition. Dedup comes from the ledger's state checks (an already
//! expired subscription is skipped) and from the warning timestamp on the
//! subscription row.

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::notifications::BillingNotifier;
use crate::subscriptions::SubscriptionLedger;

/// Days before `end_date` at which the expiry warning fires.
const EXPIRY_WARNING_DAYS: i64 = 7;

/// Outcome of one sweep, for worker logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepSummary {
    pub scanned: usize,
    pub processed: usize,
    pub errors: usize,
}

pub struct MaintenanceService {
    pool: PgPool,
    ledger: Arc<SubscriptionLedger>,
    notifier: BillingNotifier,
}

impl MaintenanceService {
    pub fn new(pool: PgPool, ledger: Arc<SubscriptionLedger>, notifier: BillingNotifier) -> Self {
        Self {
            pool,
            ledger,
            notifier,
        }
    }

    /// TRIAL subscriptions past their conversion point become ACTIVE.
    pub async fn check_and_convert_trials(&self) -> BillingResult<SweepSummary> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT tenant_id FROM tenant_subscriptions
            WHERE status = 'trial' AND trial_ends_at IS NOT NULL AND trial_ends_at <= NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SweepSummary {
            scanned: due.len(),
            ..SweepSummary::default()
        };

        for (tenant_id,) in due {
            match self.ledger.activate(tenant_id).await {
                Ok(_) => {
                    summary.processed += 1;
                    self.notifier.trial_converted(tenant_id).await;
                }
                Err(e) => {
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Trial conversion failed");
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            converted = summary.processed,
            errors = summary.errors,
            "Trial conversion sweep complete"
        );
        Ok(summary)
    }

    /// Notify tenants whose subscriptions end within the warning window.
    /// The warning timestamp on the row keeps a re-run from re-notifying.
    pub async fn check_and_send_warnings(&self) -> BillingResult<SweepSummary> {
        let expiring: Vec<(Uuid, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT tenant_id, end_date FROM tenant_subscriptions
            WHERE status IN ('active', 'trial')
              AND end_date > NOW()
              AND end_date <= NOW() + make_interval(days => $1::INT)
              AND expiry_warning_sent_at IS NULL
            "#,
        )
        .bind(EXPIRY_WARNING_DAYS as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SweepSummary {
            scanned: expiring.len(),
            ..SweepSummary::default()
        };
        let now = OffsetDateTime::now_utc();

        for (tenant_id, end_date) in expiring {
            let days_remaining = ((end_date - now).whole_hours() + 23) / 24;

            // Stamp before notifying so a crash mid-sweep cannot double-send
            // on the next run; the notification itself is fire-and-forget.
            let stamped = sqlx::query(
                r#"
                UPDATE tenant_subscriptions
                SET expiry_warning_sent_at = NOW(), updated_at = NOW()
                WHERE tenant_id = $1
                  AND status IN ('active', 'trial')
                  AND expiry_warning_sent_at IS NULL
                "#,
            )
            .bind(tenant_id)
            .execute(&self.pool)
            .await;

            match stamped {
                Ok(result) if result.rows_affected() > 0 => {
                    summary.processed += 1;
                    self.notifier
                        .subscription_expiring(tenant_id, days_remaining.max(0))
                        .await;
                }
                Ok(_) => {} // Another sweep got there first.
                Err(e) => {
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Expiry warning stamp failed");
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            warned = summary.processed,
            errors = summary.errors,
            "Expiry warning sweep complete"
        );
        Ok(summary)
    }

    /// ACTIVE subscriptions past `end_date` and unpaid lapse to EXPIRED.
    /// Already-expired rows are filtered out by the query, which is what
    /// makes a same-day re-run a no-op.
    pub async fn check_and_handle_expired_subscriptions(&self) -> BillingResult<SweepSummary> {
        let lapsed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT tenant_id FROM tenant_subscriptions
            WHERE status = 'active'
              AND end_date < NOW()
              AND is_paid = FALSE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SweepSummary {
            scanned: lapsed.len(),
            ..SweepSummary::default()
        };

        for (tenant_id,) in lapsed {
            match self.ledger.expire(tenant_id).await {
                Ok(_) => {
                    summary.processed += 1;
                    self.notifier.subscription_expired(tenant_id).await;
                }
                Err(e) => {
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Expiry handling failed");
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            expired = summary.processed,
            errors = summary.errors,
            "Expired subscription sweep complete"
        );
        Ok(summary)
    }
}
