//! Billing history
//!
//! Append-only ledger rows recording every charge. This is the audit trail
//! for money owed: rows are inserted by the subscription ledger and never
//! updated or deleted afterwards.

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Why a history entry was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    /// Pending student increase reached the plan threshold.
    ThresholdMet,
    /// Operator-initiated charge.
    Manual,
    /// Start of a fresh billing period.
    Renewal,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::ThresholdMet => "threshold_met",
            BillingType::Manual => "manual",
            BillingType::Renewal => "renewal",
        }
    }
}

/// One append-only row in `billing_history`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingHistoryEntry {
    pub id: i64,
    pub subscription_id: i64,
    pub tenant_id: Uuid,
    pub student_count: i32,
    pub previous_student_count: i32,
    pub billing_amount: i64,
    pub previous_billing_amount: i64,
    pub billing_type: BillingType,
    pub pending_increase_before: i32,
    pub pending_increase_after: i32,
    pub threshold_triggered: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub billing_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub notes: Option<String>,
}

/// Field set for a new entry; ids and billing_date are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub subscription_id: i64,
    pub tenant_id: Uuid,
    pub student_count: i32,
    pub previous_student_count: i32,
    pub billing_amount: i64,
    pub previous_billing_amount: i64,
    pub billing_type: BillingType,
    pub pending_increase_before: i32,
    pub pending_increase_after: i32,
    pub threshold_triggered: bool,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub notes: Option<String>,
}

/// Insert an entry inside the caller's transaction so the history row and
/// the subscription mutation commit or roll back together.
pub async fn append_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &NewHistoryEntry,
) -> BillingResult<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO billing_history
            (subscription_id, tenant_id, student_count, previous_student_count,
             billing_amount, previous_billing_amount, billing_type,
             pending_increase_before, pending_increase_after, threshold_triggered,
             period_start, period_end, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING id
        "#,
    )
    .bind(entry.subscription_id)
    .bind(entry.tenant_id)
    .bind(entry.student_count)
    .bind(entry.previous_student_count)
    .bind(entry.billing_amount)
    .bind(entry.previous_billing_amount)
    .bind(entry.billing_type.as_str())
    .bind(entry.pending_increase_before)
    .bind(entry.pending_increase_after)
    .bind(entry.threshold_triggered)
    .bind(entry.period_start)
    .bind(entry.period_end)
    .bind(&entry.notes)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

/// Read side of the billing history for admin and tenant views.
pub struct BillingHistoryService {
    pool: PgPool,
}

impl BillingHistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_subscription(
        &self,
        subscription_id: i64,
        limit: i64,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        let rows: Vec<BillingHistoryEntry> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, tenant_id, student_count, previous_student_count,
                   billing_amount, previous_billing_amount, billing_type,
                   pending_increase_before, pending_increase_after, threshold_triggered,
                   billing_date, period_start, period_end, notes
            FROM billing_history
            WHERE subscription_id = $1
            ORDER BY billing_date DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn list_for_tenant(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        let rows: Vec<BillingHistoryEntry> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, tenant_id, student_count, previous_student_count,
                   billing_amount, previous_billing_amount, billing_type,
                   pending_increase_before, pending_increase_after, threshold_triggered,
                   billing_date, period_start, period_end, notes
            FROM billing_history
            WHERE tenant_id = $1
            ORDER BY billing_date DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_type_serializes_snake_case() {
        assert_eq!(BillingType::ThresholdMet.as_str(), "threshold_met");
        assert_eq!(BillingType::Manual.as_str(), "manual");
        assert_eq!(BillingType::Renewal.as_str(), "renewal");

        let json = serde_json::to_string(&BillingType::ThresholdMet).unwrap();
        assert_eq!(json, "\"threshold_met\"");
    }
}
