#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Database-backed flow tests for the guarantees that live in SQL: the
//! partial unique index behind one-active-subscription-per-tenant, the
//! idempotent settlement, and the `status = 'pending'` reconciliation gate.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use sekolah_billing::{
    BillingError, BillingNotifier, BillingResult, CreatePaymentInput, CreateSubscription,
    CreatedPayment, InvariantChecker, PayableArtifact, PaymentGateway, PaymentMethod,
    PaymentOrchestrator, PaymentRequest, PlanInput, PlanService, ProviderStatus,
    ReconcileOutcome, SubscriptionLedger, SubscriptionPlan,
};
use sekolah_shared::{BillingCycle, SubscriptionStatus, TransactionStatus};

/// Gateway that always creates a QRIS charge and reports it pending.
/// Terminal transitions in these tests come through the reconciliation
/// entry points, not from polling.
struct ScriptedGateway;

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    async fn create_payment(&self, request: &PaymentRequest) -> BillingResult<CreatedPayment> {
        Ok(CreatedPayment {
            provider_reference: Some(format!("prov-{}", request.external_id)),
            artifact: PayableArtifact::Qris {
                qr_payload: "00020101021226QRIS-TEST".to_string(),
            },
            expires_at: request.expires_at,
        })
    }

    async fn get_status(&self, _external_id: &str) -> BillingResult<ProviderStatus> {
        Ok(ProviderStatus::Pending)
    }

    fn configured_callback_token(&self) -> Option<&str> {
        None
    }
}

async fn seed_plan(pool: &PgPool) -> SubscriptionPlan {
    PlanService::new(pool.clone())
        .create_plan(PlanInput {
            name: "Standard".to_string(),
            description: None,
            price_per_student_per_year: 50_000,
            billing_threshold: 10,
            is_free: false,
            is_active: true,
            display_order: 1,
        })
        .await
        .unwrap()
}

fn create_input(tenant_id: Uuid, plan_id: i64) -> CreateSubscription {
    let now = OffsetDateTime::now_utc();
    CreateSubscription {
        tenant_id,
        plan_id,
        billing_cycle: BillingCycle::Yearly,
        start_date: now - Duration::days(30),
        end_date: now + Duration::days(335),
        student_count: 20,
        trial_ends_at: None,
    }
}

fn orchestrator(pool: &PgPool) -> PaymentOrchestrator {
    PaymentOrchestrator::new(
        pool.clone(),
        Arc::new(ScriptedGateway),
        Arc::new(SubscriptionLedger::new(pool.clone())),
        BillingNotifier::disabled(),
    )
}

fn qris_input() -> CreatePaymentInput {
    CreatePaymentInput {
        method: PaymentMethod::Qris,
        bank_code: None,
        ewallet_channel: None,
        customer_name: Some("SMA Negeri 1".to_string()),
        customer_email: None,
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn second_create_for_tenant_is_a_conflict(pool: PgPool) {
    let plan = seed_plan(&pool).await;
    let ledger = SubscriptionLedger::new(pool.clone());
    let tenant = Uuid::new_v4();

    ledger
        .create_subscription(create_input(tenant, plan.id))
        .await
        .unwrap();

    let second = ledger.create_subscription(create_input(tenant, plan.id)).await;
    assert!(matches!(second, Err(BillingError::Conflict(_))));
}

#[sqlx::test(migrations = "../../migrations")]
async fn active_unique_index_blocks_a_racing_insert(pool: PgPool) {
    // Bypass the service pre-check and hit the partial index directly, the
    // way the second of two concurrent creates would.
    let plan = seed_plan(&pool).await;
    let ledger = SubscriptionLedger::new(pool.clone());
    let tenant = Uuid::new_v4();

    ledger
        .create_subscription(create_input(tenant, plan.id))
        .await
        .unwrap();

    let raced = sqlx::query(
        r#"
        INSERT INTO tenant_subscriptions
            (tenant_id, subscription_plan_id, billing_cycle, status,
             start_date, end_date, current_student_count,
             student_count_at_billing)
        VALUES ($1, $2, 'yearly', 'active', NOW(), NOW() + INTERVAL '1 year', 0, 0)
        "#,
    )
    .bind(tenant)
    .bind(plan.id)
    .execute(&pool)
    .await;

    match raced {
        Err(sqlx::Error::Database(db)) => assert!(db.is_unique_violation()),
        other => panic!("expected unique violation, got {other:?}"),
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn mark_as_paid_twice_keeps_the_first_settlement(pool: PgPool) {
    let plan = seed_plan(&pool).await;
    let ledger = SubscriptionLedger::new(pool.clone());
    let tenant = Uuid::new_v4();

    ledger
        .create_subscription(create_input(tenant, plan.id))
        .await
        .unwrap();

    let first_paid_at = OffsetDateTime::now_utc() - Duration::hours(2);
    let first = ledger.mark_as_paid(tenant, Some(first_paid_at)).await.unwrap();
    assert!(first.is_paid);
    assert!(first.paid_at.is_some());

    let second = ledger
        .mark_as_paid(tenant, Some(OffsetDateTime::now_utc()))
        .await
        .unwrap();
    assert!(second.is_paid);
    assert_eq!(second.paid_at, first.paid_at);
}

#[sqlx::test(migrations = "../../migrations")]
async fn reconciliation_gate_applies_exactly_once(pool: PgPool) {
    let plan = seed_plan(&pool).await;
    let ledger = SubscriptionLedger::new(pool.clone());
    let orchestrator = orchestrator(&pool);
    let tenant = Uuid::new_v4();

    ledger
        .create_subscription(create_input(tenant, plan.id))
        .await
        .unwrap();

    let created = orchestrator.create_payment(tenant, qris_input()).await.unwrap();

    let outcome = orchestrator
        .apply_terminal_status(created.transaction_id, TransactionStatus::Paid, None, None)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);

    // The settlement lands with the transaction update.
    let sub = ledger.get_subscription(tenant).await.unwrap();
    assert!(sub.is_paid);

    // A redelivered notification, or the racing poll path, is a no-op that
    // cannot overwrite the terminal state.
    let retry = orchestrator
        .apply_terminal_status(created.transaction_id, TransactionStatus::Expired, None, None)
        .await
        .unwrap();
    assert_eq!(retry, ReconcileOutcome::AlreadyTerminal);

    let txn = orchestrator
        .get_transaction(tenant, created.transaction_id)
        .await
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Paid);
    assert!(txn.paid_at.is_some());
    let sub = ledger.get_subscription(tenant).await.unwrap();
    assert!(sub.is_paid);
}

#[sqlx::test(migrations = "../../migrations")]
async fn unapplied_settlement_trips_the_invariant_check(pool: PgPool) {
    let plan = seed_plan(&pool).await;
    let ledger = SubscriptionLedger::new(pool.clone());
    let orchestrator = orchestrator(&pool);
    let tenant = Uuid::new_v4();

    ledger
        .create_subscription(create_input(tenant, plan.id))
        .await
        .unwrap();
    let created = orchestrator.create_payment(tenant, qris_input()).await.unwrap();
    orchestrator
        .apply_terminal_status(created.transaction_id, TransactionStatus::Paid, None, None)
        .await
        .unwrap();

    // Simulate rows edited behind the orchestrator's back.
    sqlx::query(
        "UPDATE tenant_subscriptions SET is_paid = FALSE, last_billing_date = NULL WHERE tenant_id = $1",
    )
    .bind(tenant)
    .execute(&pool)
    .await
    .unwrap();

    let checker = InvariantChecker::new(pool.clone());
    let violations = checker
        .run_check("paid_transactions_reflected_on_subscription")
        .await
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].tenant_ids, vec![tenant]);

    // Re-applying the settlement clears the finding.
    ledger.mark_as_paid(tenant, None).await.unwrap();
    let violations = checker
        .run_check("paid_transactions_reflected_on_subscription")
        .await
        .unwrap();
    assert!(violations.is_empty());
}

#[sqlx::test(migrations = "../../migrations")]
async fn settlement_after_lapse_waits_for_renewal(pool: PgPool) {
    let plan = seed_plan(&pool).await;
    let ledger = SubscriptionLedger::new(pool.clone());
    let tenant = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();

    let mut input = create_input(tenant, plan.id);
    input.start_date = now - Duration::days(400);
    input.end_date = now - Duration::days(35);
    ledger.create_subscription(input).await.unwrap();
    ledger.expire(tenant).await.unwrap();

    // Paying the old debt settles it without resurrecting the lapsed period.
    let settled = ledger.mark_as_paid(tenant, None).await.unwrap();
    assert!(settled.is_paid);
    assert_eq!(settled.status, SubscriptionStatus::Expired);

    // A renewal opens a fresh period; settling that one reactivates.
    ledger.renew(tenant, now + Duration::days(330)).await.unwrap();
    let revived = ledger.mark_as_paid(tenant, None).await.unwrap();
    assert!(revived.is_paid);
    assert_eq!(revived.status, SubscriptionStatus::Active);
}
