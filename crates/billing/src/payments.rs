//! Payment orchestrator
//!
//! Bridges the subscription ledger and the payment gateway adapter: creates
//! provider charges, persists local transactions, and reconciles provider
//! status back onto the transaction and the subscription.
//!
//! Reconciliation runs from two racing paths (webhook delivery and lazy
//! status polls). Both funnel into [`PaymentOrchestrator::apply_terminal_status`],
//! whose `status = 'pending'` update predicate is the sole idempotency gate:
//! whichever path lands first wins, the other becomes a no-op.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use sekolah_shared::TransactionStatus;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    PayableArtifact, PaymentGateway, PaymentMethod, PaymentRequest, ProviderStatus,
};
use crate::notifications::BillingNotifier;
use crate::subscriptions::{SubscriptionLedger, TenantSubscription};

/// How long a payable artifact stays valid before the provider expires it.
const PAYMENT_VALIDITY_HOURS: i64 = 24;

/// One payment attempt, as stored in `payment_transactions`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentTransaction {
    pub id: i64,
    pub tenant_subscription_id: i64,
    pub tenant_id: Uuid,
    pub provider: String,
    pub payment_method: PaymentMethod,
    pub status: TransactionStatus,
    pub amount: i64,
    pub external_id: String,
    pub provider_reference: Option<String>,
    pub payment_url: Option<String>,
    pub qr_payload: Option<String>,
    pub virtual_account_number: Option<String>,
    pub ewallet_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
}

/// Tenant input for creating a payment.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentInput {
    pub method: PaymentMethod,
    /// Bank code for virtual-account payments.
    #[serde(default)]
    pub bank_code: Option<String>,
    /// Wallet channel for e-wallet payments.
    #[serde(default)]
    pub ewallet_channel: Option<String>,
    /// Display name sent to the provider, typically the school name.
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
}

/// What the tenant gets back: the artifact to pay with, plus its expiry.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedPaymentResponse {
    pub transaction_id: i64,
    pub external_id: String,
    pub amount: i64,
    pub method: PaymentMethod,
    pub artifact: PayableArtifact,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// What a terminal transition did, for callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This call applied the transition.
    Applied,
    /// The transaction was already terminal; nothing changed.
    AlreadyTerminal,
}

const TRANSACTION_COLUMNS: &str = r#"
    id, tenant_subscription_id, tenant_id, provider, payment_method, status,
    amount, external_id, provider_reference, payment_url, qr_payload,
    virtual_account_number, ewallet_reference, expires_at, paid_at,
    failure_reason, metadata
"#;

/// Decide the amount owed for a subscription, applying the payment guards.
///
/// Pure so the guard behavior is testable without a database: an already
/// paid subscription or a zero owed amount is not payable.
pub(crate) fn chargeable_amount(sub: &TenantSubscription) -> BillingResult<i64> {
    if sub.is_paid {
        return Err(BillingError::BadRequest(
            "subscription is already paid".into(),
        ));
    }
    let amount = if sub.next_billing_amount > 0 {
        sub.next_billing_amount
    } else {
        sub.current_billing_amount
    };
    if amount <= 0 {
        return Err(BillingError::BadRequest(
            "subscription has no amount owed".into(),
        ));
    }
    Ok(amount)
}

pub struct PaymentOrchestrator {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<SubscriptionLedger>,
    notifier: BillingNotifier,
}

impl PaymentOrchestrator {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<SubscriptionLedger>,
        notifier: BillingNotifier,
    ) -> Self {
        Self {
            pool,
            gateway,
            ledger,
            notifier,
        }
    }

    /// Create a payment for the tenant's current amount owed.
    ///
    /// The local PENDING row is inserted only after the provider confirms
    /// artifact creation, so a webhook can never reference a transaction
    /// that exists locally without a provider-side charge. The reverse
    /// window (provider charge without local row, if the insert fails) is
    /// legitimately a webhook no-op retried by the provider.
    pub async fn create_payment(
        &self,
        tenant_id: Uuid,
        input: CreatePaymentInput,
    ) -> BillingResult<CreatedPaymentResponse> {
        let sub = self.ledger.get_subscription(tenant_id).await?;
        let amount = chargeable_amount(&sub)?;

        // Locally unique idempotency key; also the join key from webhooks.
        let external_id = format!("PAY-{}", Uuid::new_v4().simple());
        let expires_at = OffsetDateTime::now_utc() + Duration::hours(PAYMENT_VALIDITY_HOURS);

        let request = PaymentRequest {
            method: input.method,
            amount,
            external_id: external_id.clone(),
            description: format!("Subscription payment for tenant {tenant_id}"),
            customer_name: input.customer_name.unwrap_or_else(|| tenant_id.to_string()),
            customer_email: input.customer_email,
            bank_code: input.bank_code,
            ewallet_channel: input.ewallet_channel,
            expires_at,
        };
        request.validate()?;

        let created = self.gateway.create_payment(&request).await.map_err(|e| {
            tracing::error!(
                tenant_id = %tenant_id,
                external_id = %external_id,
                provider = self.gateway.provider_name(),
                error = %e,
                "Payment creation failed at provider"
            );
            e
        })?;

        let (payment_url, qr_payload, va_number, ewallet_reference) = match &created.artifact {
            PayableArtifact::Qris { qr_payload } => (None, Some(qr_payload.clone()), None, None),
            PayableArtifact::VirtualAccount { account_number, .. } => {
                (None, None, Some(account_number.clone()), None)
            }
            PayableArtifact::Ewallet {
                reference,
                payment_url,
            } => (payment_url.clone(), None, None, Some(reference.clone())),
        };

        let txn: PaymentTransaction = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_transactions
                (tenant_subscription_id, tenant_id, provider, payment_method,
                 status, amount, external_id, provider_reference, payment_url,
                 qr_payload, virtual_account_number, ewallet_reference,
                 expires_at, metadata)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(sub.id)
        .bind(tenant_id)
        .bind(self.gateway.provider_name())
        .bind(input.method)
        .bind(amount)
        .bind(&external_id)
        .bind(&created.provider_reference)
        .bind(&payment_url)
        .bind(&qr_payload)
        .bind(&va_number)
        .bind(&ewallet_reference)
        .bind(created.expires_at)
        .bind(serde_json::json!({}))
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            transaction_id = txn.id,
            external_id = %external_id,
            method = %input.method,
            amount,
            "Payment transaction created"
        );

        Ok(CreatedPaymentResponse {
            transaction_id: txn.id,
            external_id,
            amount,
            method: input.method,
            artifact: created.artifact,
            expires_at: created.expires_at,
        })
    }

    /// Fetch a transaction, verifying it belongs to the requesting tenant
    /// before anything is disclosed.
    pub async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: i64,
    ) -> BillingResult<PaymentTransaction> {
        let txn: Option<PaymentTransaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM payment_transactions
            WHERE id = $1 AND tenant_id = $2
            "#
        ))
        .bind(transaction_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        txn.ok_or_else(|| BillingError::NotFound(format!("transaction {transaction_id}")))
    }

    /// Transaction status for a tenant. A PENDING transaction is actively
    /// reconciled against the provider before returning; terminal
    /// transactions are returned from the local row and never re-queried.
    pub async fn get_payment_status(
        &self,
        tenant_id: Uuid,
        transaction_id: i64,
    ) -> BillingResult<PaymentTransaction> {
        let txn = self.get_transaction(tenant_id, transaction_id).await?;

        if txn.status.is_terminal() {
            return Ok(txn);
        }

        // A past-expiry PENDING transaction lapses without a provider call.
        if let Some(expires_at) = txn.expires_at {
            if expires_at < OffsetDateTime::now_utc() {
                self.apply_terminal_status(
                    txn.id,
                    TransactionStatus::Expired,
                    None,
                    Some("payment window elapsed".to_string()),
                )
                .await?;
                return self.get_transaction(tenant_id, transaction_id).await;
            }
        }

        match self.gateway.get_status(&txn.external_id).await {
            Ok(ProviderStatus::Pending) => Ok(txn),
            Ok(ProviderStatus::Paid { paid_at }) => {
                self.apply_terminal_status(txn.id, TransactionStatus::Paid, paid_at, None)
                    .await?;
                self.get_transaction(tenant_id, transaction_id).await
            }
            Ok(ProviderStatus::Expired) => {
                self.apply_terminal_status(txn.id, TransactionStatus::Expired, None, None)
                    .await?;
                self.get_transaction(tenant_id, transaction_id).await
            }
            Ok(ProviderStatus::Failed { reason }) => {
                self.apply_terminal_status(txn.id, TransactionStatus::Failed, None, reason)
                    .await?;
                self.get_transaction(tenant_id, transaction_id).await
            }
            // Provider lost the charge; keep the local view rather than
            // inventing a terminal state.
            Err(BillingError::NotFound(_)) => {
                tracing::warn!(
                    transaction_id = txn.id,
                    external_id = %txn.external_id,
                    "Provider has no record of pending charge"
                );
                Ok(txn)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a transaction by the provider's join key. Used by webhook
    /// reconciliation; deliberately not tenant-scoped since the provider
    /// only knows the external id.
    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<PaymentTransaction>> {
        let txn: Option<PaymentTransaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM payment_transactions
            WHERE external_id = $1
            "#
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(txn)
    }

    /// Apply a terminal status to a transaction, exactly once.
    ///
    /// The `status = 'pending'` predicate makes this safe under concurrent
    /// webhook and poll reconciliation: only one caller observes an affected
    /// row. On PAID the owning subscription is settled inside the same
    /// database transaction, so a transient failure rolls the row back to
    /// PENDING and the provider's retry gets a second chance instead of
    /// hitting an already-terminal row with the subscription still unpaid.
    /// EXPIRED/FAILED touch the transaction only.
    pub async fn apply_terminal_status(
        &self,
        transaction_id: i64,
        new_status: TransactionStatus,
        paid_at: Option<OffsetDateTime>,
        failure_reason: Option<String>,
    ) -> BillingResult<ReconcileOutcome> {
        if !new_status.is_terminal() {
            return Err(BillingError::Validation(format!(
                "{new_status} is not a terminal transaction status"
            )));
        }

        let paid_at = match new_status {
            TransactionStatus::Paid => Some(paid_at.unwrap_or_else(OffsetDateTime::now_utc)),
            _ => None,
        };

        let mut tx = self.pool.begin().await?;

        let updated: Option<PaymentTransaction> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_transactions
            SET status = $2,
                paid_at = $3,
                failure_reason = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(transaction_id)
        .bind(new_status)
        .bind(paid_at)
        .bind(&failure_reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(txn) = updated else {
            tx.rollback().await?;
            tracing::info!(
                transaction_id,
                attempted_status = %new_status,
                "Terminal transition skipped: transaction already terminal"
            );
            return Ok(ReconcileOutcome::AlreadyTerminal);
        };

        if new_status == TransactionStatus::Paid {
            SubscriptionLedger::mark_as_paid_in_tx(&mut tx, txn.tenant_id, txn.paid_at).await?;
        }

        tx.commit().await?;

        tracing::info!(
            transaction_id,
            tenant_id = %txn.tenant_id,
            status = %new_status,
            failure_reason = ?failure_reason,
            "Payment transaction reconciled"
        );

        if new_status == TransactionStatus::Paid {
            self.notifier
                .payment_succeeded(txn.tenant_id, txn.amount)
                .await;
        }

        Ok(ReconcileOutcome::Applied)
    }

    /// PENDING transactions past their expiry, swept by the worker.
    pub async fn expire_stale_transactions(&self) -> BillingResult<u64> {
        let stale: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM payment_transactions
            WHERE status = 'pending' AND expires_at < NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0u64;
        for (id,) in stale {
            match self
                .apply_terminal_status(
                    id,
                    TransactionStatus::Expired,
                    None,
                    Some("payment window elapsed".to_string()),
                )
                .await
            {
                Ok(ReconcileOutcome::Applied) => expired += 1,
                Ok(ReconcileOutcome::AlreadyTerminal) => {}
                Err(e) => {
                    tracing::error!(transaction_id = id, error = %e, "Failed to expire transaction");
                }
            }
        }

        if expired > 0 {
            tracing::info!(expired, "Expired stale pending transactions");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekolah_shared::{BillingCycle, SubscriptionStatus};
    use time::macros::datetime;

    fn subscription(is_paid: bool, next: i64, current: i64) -> TenantSubscription {
        TenantSubscription {
            id: 1,
            tenant_id: Uuid::new_v4(),
            subscription_plan_id: 1,
            billing_cycle: BillingCycle::Yearly,
            status: SubscriptionStatus::Active,
            start_date: datetime!(2026-01-01 0:00 UTC),
            end_date: datetime!(2027-01-01 0:00 UTC),
            next_billing_date: None,
            current_student_count: 61,
            student_count_at_billing: 61,
            pending_student_increase: 0,
            current_billing_amount: current,
            next_billing_amount: next,
            is_paid,
            paid_at: None,
            last_billing_date: None,
            trial_ends_at: None,
            expiry_warning_sent_at: None,
        }
    }

    // Scenario B: already-paid subscriptions are not payable.
    #[test]
    fn paid_subscription_is_not_payable() {
        let err = chargeable_amount(&subscription(true, 6_100_000, 0));
        assert!(matches!(err, Err(BillingError::BadRequest(_))));
    }

    #[test]
    fn zero_owed_is_not_payable() {
        let err = chargeable_amount(&subscription(false, 0, 0));
        assert!(matches!(err, Err(BillingError::BadRequest(_))));
    }

    #[test]
    fn next_billing_amount_takes_precedence() {
        let amount = chargeable_amount(&subscription(false, 6_100_000, 5_000_000)).unwrap();
        assert_eq!(amount, 6_100_000);
    }

    #[test]
    fn falls_back_to_current_billing_amount() {
        let amount = chargeable_amount(&subscription(false, 0, 5_000_000)).unwrap();
        assert_eq!(amount, 5_000_000);
    }

    #[test]
    fn external_ids_are_unique_and_prefixed() {
        let a = format!("PAY-{}", Uuid::new_v4().simple());
        let b = format!("PAY-{}", Uuid::new_v4().simple());
        assert_ne!(a, b);
        assert!(a.starts_with("PAY-"));
        assert_eq!(a.len(), 4 + 32);
    }
}
