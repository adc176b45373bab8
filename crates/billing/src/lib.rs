#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sekolah Billing Module
//!
//! Handles subscription billing and payment reconciliation for tenant
//! schools.
//!
//! ## Features
//!
//! - **Plan Catalog**: Administrator-managed subscription plans priced per
//!   student per year
//! - **Subscription Ledger**: Per-tenant subscription state machine with
//!   student-count tracking and threshold-triggered billing
//! - **Billing History**: Append-only audit trail of every charge
//! - **Payments**: Provider-agnostic gateway adapter (QRIS, virtual
//!   account, e-wallet) with idempotent reconciliation
//! - **Webhooks**: Inbound payment notifications, replay-safe
//! - **Maintenance**: Trial conversion, expiry warnings, and expiry sweeps

pub mod calculator;
pub mod error;
pub mod gateway;
pub mod history;
pub mod invariants;
pub mod maintenance;
pub mod notifications;
pub mod payments;
pub mod plans;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Calculator
pub use calculator::{amount_due, evaluate_count_update, CountUpdate};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::http::{GatewayConfig, HttpPaymentGateway};
pub use gateway::{
    CreatedPayment, PayableArtifact, PaymentGateway, PaymentMethod, PaymentRequest, ProviderStatus,
};

// History
pub use history::{BillingHistoryEntry, BillingHistoryService, BillingType, NewHistoryEntry};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Maintenance
pub use maintenance::{MaintenanceService, SweepSummary};

// Notifications
pub use notifications::{BillingNotifier, NotificationKind};

// Payments
pub use payments::{
    CreatePaymentInput, CreatedPaymentResponse, PaymentOrchestrator, PaymentTransaction,
    ReconcileOutcome,
};

// Plans
pub use plans::{PlanInput, PlanService, SubscriptionPlan};

// Subscriptions
pub use subscriptions::{
    CountUpdateResult, CreateSubscription, SubscriptionLedger, TenantSubscription,
};

// Webhooks
pub use webhooks::{WebhookAck, WebhookEvent, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Aggregate entry point wiring every billing sub-service to one pool
/// and one gateway.
pub struct BillingService {
    pub plans: PlanService,
    pub subscriptions: Arc<SubscriptionLedger>,
    pub history: BillingHistoryService,
    pub payments: Arc<PaymentOrchestrator>,
    pub webhooks: WebhookHandler,
    pub maintenance: MaintenanceService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Build the service from environment configuration (gateway and
    /// notification endpoint).
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(HttpPaymentGateway::new(GatewayConfig::from_env()?)?);
        let notifier = BillingNotifier::from_env();
        Ok(Self::with_gateway(pool, gateway, notifier))
    }

    /// Build the service around an explicit gateway and notifier; tests use
    /// this with a scripted gateway.
    pub fn with_gateway(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: BillingNotifier,
    ) -> Self {
        let ledger = Arc::new(SubscriptionLedger::new(pool.clone()));
        let payments = Arc::new(PaymentOrchestrator::new(
            pool.clone(),
            gateway.clone(),
            ledger.clone(),
            notifier.clone(),
        ));

        Self {
            plans: PlanService::new(pool.clone()),
            subscriptions: ledger.clone(),
            history: BillingHistoryService::new(pool.clone()),
            payments: payments.clone(),
            webhooks: WebhookHandler::new(gateway, payments),
            maintenance: MaintenanceService::new(pool.clone(), ledger, notifier),
            invariants: InvariantChecker::new(pool),
        }
    }
}
